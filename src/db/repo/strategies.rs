//! TP/SL rule rows and strategy instance rows.

use super::{parse_decimal, parse_order_id, parse_position_id};
use crate::db::StoreError;
use crate::domain::{
    StrategyConfig, StrategyRecord, StrategyType, TimeMs, TpSlKind, TpSlMode, TpSlRule, WalletId,
};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::Row;

const RULES: &str = "tpsl_rules";
const STRATEGIES: &str = "strategy_instances";

/// One row per (position, kind); a replacement rule overwrites its predecessor.
pub(super) async fn upsert_rule(
    conn: &mut SqliteConnection,
    wallet_id: &WalletId,
    rule: &TpSlRule,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO tpsl_rules (
            position_id, wallet_id, kind, mode, mode_value, target_price,
            created_at, order_id, active, triggered
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(rule.position_id.to_string())
    .bind(wallet_id.as_str())
    .bind(rule.kind.as_str())
    .bind(rule.mode.as_str())
    .bind(rule.mode.value().to_canonical_string())
    .bind(rule.target_price.to_canonical_string())
    .bind(rule.created_at.as_i64())
    .bind(rule.order_id.map(|id| id.to_string()))
    .bind(rule.active as i64)
    .bind(rule.triggered as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(super) async fn load_rules(
    pool: &SqlitePool,
    wallet_id: &WalletId,
) -> Result<Vec<TpSlRule>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT r.* FROM tpsl_rules r
        JOIN positions p ON p.id = r.position_id
        WHERE r.wallet_id = ? AND p.state != 'closed'
        ORDER BY r.created_at ASC, r.position_id ASC, r.kind ASC
        "#,
    )
    .bind(wallet_id.as_str())
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_rule).collect()
}

fn row_to_rule(row: &SqliteRow) -> Result<TpSlRule, StoreError> {
    let kind_raw: String = row.get("kind");
    let mode_raw: String = row.get("mode");
    let mode_value = parse_decimal(RULES, &row.get::<String, _>("mode_value"))?;
    let order_raw: Option<String> = row.get("order_id");

    Ok(TpSlRule {
        position_id: parse_position_id(RULES, &row.get::<String, _>("position_id"))?,
        kind: TpSlKind::parse(&kind_raw)
            .ok_or_else(|| StoreError::corrupt(RULES, format!("invalid kind {}", kind_raw)))?,
        mode: TpSlMode::from_parts(&mode_raw, mode_value)
            .ok_or_else(|| StoreError::corrupt(RULES, format!("invalid mode {}", mode_raw)))?,
        target_price: parse_decimal(RULES, &row.get::<String, _>("target_price"))?,
        created_at: TimeMs::new(row.get("created_at")),
        order_id: order_raw.map(|raw| parse_order_id(RULES, &raw)).transpose()?,
        active: row.get::<i64, _>("active") != 0,
        triggered: row.get::<i64, _>("triggered") != 0,
    })
}

pub(super) async fn upsert_strategy(
    conn: &mut SqliteConnection,
    record: &StrategyRecord,
) -> Result<(), StoreError> {
    let config = serde_json::to_string(&record.config)?;
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO strategy_instances (
            wallet_id, strategy_type, config, running, current_position_id,
            updated_at, halt_reason
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.wallet_id.as_str())
    .bind(record.strategy_type.as_str())
    .bind(config)
    .bind(record.running as i64)
    .bind(record.current_position_id.map(|id| id.to_string()))
    .bind(record.updated_at.as_i64())
    .bind(record.halt_reason.as_deref())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(super) async fn load_strategies(
    pool: &SqlitePool,
    wallet_id: &WalletId,
) -> Result<Vec<StrategyRecord>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM strategy_instances
        WHERE wallet_id = ?
        ORDER BY strategy_type ASC
        "#,
    )
    .bind(wallet_id.as_str())
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_strategy).collect()
}

fn row_to_strategy(row: &SqliteRow) -> Result<StrategyRecord, StoreError> {
    let type_raw: String = row.get("strategy_type");
    let config: StrategyConfig = serde_json::from_str(&row.get::<String, _>("config"))?;
    let current_raw: Option<String> = row.get("current_position_id");

    Ok(StrategyRecord {
        wallet_id: WalletId::new(row.get::<String, _>("wallet_id")),
        strategy_type: StrategyType::parse(&type_raw).ok_or_else(|| {
            StoreError::corrupt(STRATEGIES, format!("invalid strategy type {}", type_raw))
        })?,
        config,
        running: row.get::<i64, _>("running") != 0,
        current_position_id: current_raw
            .map(|raw| parse_position_id(STRATEGIES, &raw))
            .transpose()?,
        updated_at: TimeMs::new(row.get("updated_at")),
        halt_reason: row.get("halt_reason"),
    })
}
