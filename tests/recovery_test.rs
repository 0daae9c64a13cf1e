use perpkeeper::db::{init_db, SqliteStateStore, StateDelta, StateStore};
use perpkeeper::domain::{GridConfig, StrategyRecord};
use perpkeeper::engine::{EngineSettings, OpenRequest, WalletAccount, WalletContext};
use perpkeeper::feed::PriceCache;
use perpkeeper::notify::BroadcastNotifier;
use perpkeeper::orchestration::recover_wallet;
use perpkeeper::venue::{MockOp, MockVenue, RetryPolicy, VenueError};
use perpkeeper::{
    Decimal, PositionState, ProductId, Side, StrategyConfig, StrategyType, WalletId,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const BTC: ProductId = ProductId(2);

fn d(s: &str) -> Decimal {
    Decimal::from_str_canonical(s).unwrap()
}

async fn open_store(dir: &TempDir) -> Arc<SqliteStateStore> {
    let path = dir.path().join("state.db").to_string_lossy().to_string();
    let pool = init_db(&path).await.expect("init_db failed");
    Arc::new(SqliteStateStore::new(pool))
}

/// A fresh process: new context, same database and venue.
fn boot(venue: &MockVenue, store: Arc<SqliteStateStore>) -> WalletContext {
    WalletContext::new(
        WalletAccount::new(WalletId::new("main"), "0xmain").with_leverage(10),
        Arc::new(venue.clone()),
        store,
        Arc::new(BroadcastNotifier::default()),
        PriceCache::new(15_000),
        EngineSettings {
            retry: RetryPolicy {
                max_attempts: 1,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
                call_timeout: Duration::from_secs(1),
            },
            ..EngineSettings::default()
        },
        &CancellationToken::new(),
    )
}

fn grid_request() -> OpenRequest {
    OpenRequest {
        product_id: BTC,
        side: Side::Long,
        size: d("0.5"),
        leverage: 2,
        strategy: Some(StrategyType::Grid),
    }
}

fn grid_record() -> StrategyRecord {
    StrategyRecord::new(
        WalletId::new("main"),
        StrategyConfig::Grid(GridConfig {
            product_id: BTC,
            side: Side::Long,
            size: d("0.5"),
            leverage: 2,
            tp_offset_pct: d("0.03"),
            sl_offset_pct: None,
            poll_interval_ms: 1000,
        }),
    )
}

#[tokio::test]
async fn test_lost_ack_entry_is_confirmed_on_restart() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let venue = MockVenue::new().with_price(BTC, d("60000"));

    {
        let ctx = boot(&venue, store.clone());
        ctx.store()
            .save_state(ctx.id(), StateDelta::new().strategy(&grid_record()))
            .await
            .unwrap();
        venue.lose_next_acks(1);
        let machine = ctx.open_position(grid_request()).await.unwrap();
        assert_eq!(machine.state(), PositionState::PendingEntry);
    }

    let ctx = boot(&venue, store.clone());
    let report = recover_wallet(&ctx).await.unwrap();

    assert_eq!(report.positions_restored, 1);
    assert_eq!(report.unconfirmed_orders, 1);
    assert!(report.mismatches.is_empty());
    assert_eq!(venue.order_count(), 1);

    let id = ctx.owned_position(StrategyType::Grid).unwrap();
    let machine = ctx.machine(id).unwrap();
    assert_eq!(machine.state(), PositionState::Open);
    assert_eq!(machine.position().entry_price, Some(d("60000")));

    assert_eq!(report.resume.len(), 1);
    assert_eq!(report.resume[0].current_position_id, Some(id));

    let reloaded = store.load_state(ctx.id()).await.unwrap();
    assert_eq!(reloaded.positions[0].state, PositionState::Open);
    assert!(reloaded
        .orders
        .iter()
        .all(|o| o.venue_order_id.is_some()));
}

#[tokio::test]
async fn test_entry_the_venue_never_saw_is_abandoned() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let venue = MockVenue::new().with_price(BTC, d("60000"));

    {
        let ctx = boot(&venue, store.clone());
        venue.fail_next(
            MockOp::Place,
            VenueError::NetworkError("connection refused".to_string()),
            1,
        );
        let machine = ctx.open_position(grid_request()).await.unwrap();
        assert_eq!(machine.state(), PositionState::PendingEntry);
    }
    let calls = venue.place_calls();

    let ctx = boot(&venue, store.clone());
    let report = recover_wallet(&ctx).await.unwrap();

    assert_eq!(report.unconfirmed_orders, 1);
    assert!(report.mismatches.is_empty());
    assert!(ctx.machines().is_empty());
    assert_eq!(venue.place_calls(), calls);
    assert_eq!(venue.order_count(), 0);

    // closed and archived: nothing left to load on the next start
    let reloaded = store.load_state(ctx.id()).await.unwrap();
    assert!(reloaded.positions.is_empty());
    assert!(reloaded.orders.is_empty());
}

#[tokio::test]
async fn test_position_missing_on_venue_is_errored_at_startup() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let venue = MockVenue::new().with_price(BTC, d("60000"));

    let position_id = {
        let ctx = boot(&venue, store.clone());
        let machine = ctx.open_position(grid_request()).await.unwrap();
        let mut record = grid_record();
        record.current_position_id = Some(machine.id());
        ctx.store()
            .save_state(ctx.id(), StateDelta::new().strategy(&record))
            .await
            .unwrap();
        machine.id()
    };
    // liquidated or closed by hand while the engine was down
    venue.set_position(&WalletId::new("main"), BTC, Decimal::zero());

    let ctx = boot(&venue, store.clone());
    let report = recover_wallet(&ctx).await.unwrap();

    assert_eq!(report.mismatches.len(), 1);
    assert_eq!(report.mismatches[0].local_size, d("0.5"));
    assert_eq!(report.mismatches[0].venue_size, Decimal::zero());
    let machine = ctx.machine(position_id).unwrap();
    assert_eq!(machine.state(), PositionState::Errored);
    assert_eq!(report.resume[0].current_position_id, Some(position_id));
}

#[tokio::test]
async fn test_stopped_strategies_are_not_resumed() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let venue = MockVenue::new().with_price(BTC, d("60000"));

    let mut record = grid_record();
    record.running = false;
    store
        .save_state(&WalletId::new("main"), StateDelta::new().strategy(&record))
        .await
        .unwrap();

    let ctx = boot(&venue, store.clone());
    let report = recover_wallet(&ctx).await.unwrap();
    assert!(report.resume.is_empty());
    assert_eq!(report.positions_restored, 0);
}
