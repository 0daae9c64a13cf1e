//! Position rows.

use super::{parse_decimal, parse_optional_decimal, parse_position_id};
use crate::db::StoreError;
use crate::domain::{Position, PositionState, ProductId, Side, StrategyType, TimeMs, WalletId};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::Row;

const TABLE: &str = "positions";

pub(super) async fn upsert(
    conn: &mut SqliteConnection,
    position: &Position,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO positions (
            id, wallet_id, product_id, side, requested_size, size, entry_price,
            leverage, strategy, state, created_at, opened_at, closed_at, exit_price, error
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            size = excluded.size,
            entry_price = excluded.entry_price,
            state = excluded.state,
            opened_at = excluded.opened_at,
            closed_at = excluded.closed_at,
            exit_price = excluded.exit_price,
            error = excluded.error
        "#,
    )
    .bind(position.id.to_string())
    .bind(position.wallet_id.as_str())
    .bind(position.product_id.as_u32() as i64)
    .bind(position.side.as_str())
    .bind(position.requested_size.to_canonical_string())
    .bind(position.size.to_canonical_string())
    .bind(position.entry_price.map(|p| p.to_canonical_string()))
    .bind(position.leverage as i64)
    .bind(position.strategy.map(|s| s.as_str()))
    .bind(position.state.as_str())
    .bind(position.created_at.as_i64())
    .bind(position.opened_at.map(|t| t.as_i64()))
    .bind(position.closed_at.map(|t| t.as_i64()))
    .bind(position.exit_price.map(|p| p.to_canonical_string()))
    .bind(position.error.as_deref())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Every position of the wallet that is not yet archived as closed.
pub(super) async fn load_active(
    pool: &SqlitePool,
    wallet_id: &WalletId,
) -> Result<Vec<Position>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM positions
        WHERE wallet_id = ? AND state != 'closed'
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .bind(wallet_id.as_str())
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_position).collect()
}

fn row_to_position(row: &SqliteRow) -> Result<Position, StoreError> {
    let side_raw: String = row.get("side");
    let state_raw: String = row.get("state");
    let strategy_raw: Option<String> = row.get("strategy");

    let strategy = match strategy_raw {
        Some(raw) => Some(
            StrategyType::parse(&raw)
                .ok_or_else(|| StoreError::corrupt(TABLE, format!("invalid strategy {}", raw)))?,
        ),
        None => None,
    };

    Ok(Position {
        id: parse_position_id(TABLE, &row.get::<String, _>("id"))?,
        wallet_id: WalletId::new(row.get::<String, _>("wallet_id")),
        product_id: ProductId::new(row.get::<i64, _>("product_id") as u32),
        side: Side::parse(&side_raw)
            .ok_or_else(|| StoreError::corrupt(TABLE, format!("invalid side {}", side_raw)))?,
        requested_size: parse_decimal(TABLE, &row.get::<String, _>("requested_size"))?,
        size: parse_decimal(TABLE, &row.get::<String, _>("size"))?,
        entry_price: parse_optional_decimal(TABLE, row.get("entry_price"))?,
        leverage: row.get::<i64, _>("leverage") as u32,
        strategy,
        state: PositionState::parse(&state_raw)
            .ok_or_else(|| StoreError::corrupt(TABLE, format!("invalid state {}", state_raw)))?,
        created_at: TimeMs::new(row.get("created_at")),
        opened_at: row.get::<Option<i64>, _>("opened_at").map(TimeMs::new),
        closed_at: row.get::<Option<i64>, _>("closed_at").map(TimeMs::new),
        exit_price: parse_optional_decimal(TABLE, row.get("exit_price"))?,
        error: row.get("error"),
    })
}
