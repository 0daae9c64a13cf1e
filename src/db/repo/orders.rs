//! Order rows.

use super::{parse_decimal, parse_optional_decimal, parse_order_id, parse_position_id};
use crate::db::StoreError;
use crate::domain::{Order, OrderKind, OrderStatus, ProductId, Side, TimeMs, WalletId};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::Row;

const TABLE: &str = "orders";

pub(super) async fn upsert(conn: &mut SqliteConnection, order: &Order) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO orders (
            id, client_id, venue_order_id, position_id, wallet_id, product_id, kind, side,
            requested_price, requested_size, filled_size, avg_fill_price, status,
            submitted_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            venue_order_id = excluded.venue_order_id,
            filled_size = excluded.filled_size,
            avg_fill_price = excluded.avg_fill_price,
            status = excluded.status,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(order.id.to_string())
    .bind(order.client_id.as_str())
    .bind(order.venue_order_id.as_deref())
    .bind(order.position_id.map(|p| p.to_string()))
    .bind(order.wallet_id.as_str())
    .bind(order.product_id.as_u32() as i64)
    .bind(order.kind.as_str())
    .bind(order.side.as_str())
    .bind(order.requested_price.map(|p| p.to_canonical_string()))
    .bind(order.requested_size.to_canonical_string())
    .bind(order.filled_size.to_canonical_string())
    .bind(order.avg_fill_price.map(|p| p.to_canonical_string()))
    .bind(order.status.as_str())
    .bind(order.submitted_at.as_i64())
    .bind(order.updated_at.as_i64())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Live orders plus every order attached to a non-archived position.
pub(super) async fn load_relevant(
    pool: &SqlitePool,
    wallet_id: &WalletId,
) -> Result<Vec<Order>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM orders
        WHERE wallet_id = ?
          AND (
            status IN ('pending', 'acked')
            OR position_id IN (
                SELECT id FROM positions WHERE wallet_id = ? AND state != 'closed'
            )
          )
        ORDER BY submitted_at ASC, id ASC
        "#,
    )
    .bind(wallet_id.as_str())
    .bind(wallet_id.as_str())
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_order).collect()
}

fn row_to_order(row: &SqliteRow) -> Result<Order, StoreError> {
    let kind_raw: String = row.get("kind");
    let side_raw: String = row.get("side");
    let status_raw: String = row.get("status");
    let position_raw: Option<String> = row.get("position_id");

    Ok(Order {
        id: parse_order_id(TABLE, &row.get::<String, _>("id"))?,
        client_id: row.get("client_id"),
        venue_order_id: row.get("venue_order_id"),
        position_id: position_raw
            .map(|raw| parse_position_id(TABLE, &raw))
            .transpose()?,
        wallet_id: WalletId::new(row.get::<String, _>("wallet_id")),
        product_id: ProductId::new(row.get::<i64, _>("product_id") as u32),
        kind: OrderKind::parse(&kind_raw)
            .ok_or_else(|| StoreError::corrupt(TABLE, format!("invalid kind {}", kind_raw)))?,
        side: Side::parse(&side_raw)
            .ok_or_else(|| StoreError::corrupt(TABLE, format!("invalid side {}", side_raw)))?,
        requested_price: parse_optional_decimal(TABLE, row.get("requested_price"))?,
        requested_size: parse_decimal(TABLE, &row.get::<String, _>("requested_size"))?,
        filled_size: parse_decimal(TABLE, &row.get::<String, _>("filled_size"))?,
        avg_fill_price: parse_optional_decimal(TABLE, row.get("avg_fill_price"))?,
        status: OrderStatus::parse(&status_raw)
            .ok_or_else(|| StoreError::corrupt(TABLE, format!("invalid status {}", status_raw)))?,
        submitted_at: TimeMs::new(row.get("submitted_at")),
        updated_at: TimeMs::new(row.get("updated_at")),
    })
}
