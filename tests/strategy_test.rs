use async_trait::async_trait;
use perpkeeper::db::MemoryStateStore;
use perpkeeper::domain::{GridConfig, MlConfig, PriceSnapshot, RiskScenario, StrategyRecord};
use perpkeeper::engine::{EngineSettings, OpenRequest, TpSlMonitor, WalletAccount, WalletContext};
use perpkeeper::feed::PriceCache;
use perpkeeper::notify::BroadcastNotifier;
use perpkeeper::predictor::{Direction, Prediction, Predictor, PredictorError};
use perpkeeper::strategy::{GridStrategy, MlSignalStrategy, Strategy, TickOutcome};
use perpkeeper::venue::{MockOp, MockVenue, VenueError};
use perpkeeper::{
    Decimal, EngineError, OrderKind, PositionState, ProductId, Side, StrategyConfig,
    StrategyType, TimeMs, TpSlKind, WalletId,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SOL: ProductId = ProductId(8);

fn d(s: &str) -> Decimal {
    Decimal::from_str_canonical(s).unwrap()
}

fn context(venue: &MockVenue, prices: PriceCache) -> Arc<WalletContext> {
    Arc::new(WalletContext::new(
        WalletAccount::new(WalletId::new("main"), "0xmain").with_leverage(10),
        Arc::new(venue.clone()),
        Arc::new(MemoryStateStore::new()),
        Arc::new(BroadcastNotifier::default()),
        prices,
        EngineSettings::default(),
        &CancellationToken::new(),
    ))
}

fn tick_price(venue: &MockVenue, prices: &PriceCache, price: &str) {
    venue.set_price(SOL, d(price));
    prices.insert(PriceSnapshot::flat(SOL, d(price), TimeMs::now()));
}

fn grid_config() -> GridConfig {
    GridConfig {
        product_id: SOL,
        side: Side::Long,
        size: d("1"),
        leverage: 2,
        tp_offset_pct: d("0.5"),
        sl_offset_pct: None,
        poll_interval_ms: 10,
    }
}

fn ml_config() -> MlConfig {
    MlConfig {
        product_id: SOL,
        size: d("1"),
        leverage: 2,
        min_confidence: d("0.7"),
        scenario: RiskScenario::Conservative,
        history_window: 50,
        poll_interval_ms: 10,
        predictor_timeout_ms: 50,
    }
}

/// Always answers with the same prediction, optionally after a delay.
#[derive(Debug)]
struct FixedPredictor {
    prediction: Prediction,
    delay: Duration,
}

impl FixedPredictor {
    fn new(direction: Direction, confidence: &str) -> Self {
        Self {
            prediction: Prediction {
                direction,
                confidence: d(confidence),
            },
            delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl Predictor for FixedPredictor {
    async fn predict(&self, _history: &[Decimal]) -> Result<Prediction, PredictorError> {
        tokio::time::sleep(self.delay).await;
        Ok(self.prediction)
    }
}

#[tokio::test]
async fn test_grid_reenters_after_take_profit() {
    let venue = MockVenue::new();
    let prices = PriceCache::new(15_000);
    let ctx = context(&venue, prices.clone());
    tick_price(&venue, &prices, "150");

    let mut grid = GridStrategy::new(grid_config()).unwrap();
    let mut record = StrategyRecord::new(ctx.id().clone(), StrategyConfig::Grid(grid_config()));
    let cancel = CancellationToken::new();

    let first = match grid.tick(&ctx, &mut record, &cancel).await.unwrap() {
        TickOutcome::Opened(id) => id,
        other => panic!("expected an entry, got {:?}", other),
    };
    assert_eq!(record.current_position_id, Some(first));
    let machine = ctx.machine(first).unwrap();
    assert_eq!(machine.state(), PositionState::Open);
    assert_eq!(
        machine.active_rule(TpSlKind::TakeProfit).unwrap().target_price,
        d("150.75")
    );

    // one position at a time
    assert_eq!(
        grid.tick(&ctx, &mut record, &cancel).await.unwrap(),
        TickOutcome::Holding(first)
    );
    assert_eq!(venue.orders_of_kind(SOL, OrderKind::Entry).len(), 1);

    // the resting take-profit fills on the venue
    tick_price(&venue, &prices, "150.75");
    let tp = machine
        .orders()
        .into_iter()
        .find(|o| o.kind == OrderKind::TakeProfit)
        .unwrap();
    venue.fill_order(&tp.client_id).unwrap();
    TpSlMonitor::new(ctx.clone(), Duration::from_millis(10))
        .tick()
        .await
        .unwrap();
    assert_eq!(machine.state(), PositionState::Closed);

    let second = match grid.tick(&ctx, &mut record, &cancel).await.unwrap() {
        TickOutcome::Opened(id) => id,
        other => panic!("expected a re-entry, got {:?}", other),
    };
    assert_ne!(first, second);
    assert_eq!(venue.orders_of_kind(SOL, OrderKind::Entry).len(), 2);
}

#[tokio::test]
async fn test_grid_skips_tick_without_fresh_price() {
    let venue = MockVenue::new().with_price(SOL, d("150"));
    let ctx = context(&venue, PriceCache::new(15_000));

    let mut grid = GridStrategy::new(grid_config()).unwrap();
    let mut record = StrategyRecord::new(ctx.id().clone(), StrategyConfig::Grid(grid_config()));
    let outcome = grid
        .tick(&ctx, &mut record, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, TickOutcome::Stale);
    assert_eq!(venue.place_calls(), 0);
    assert_eq!(ctx.prices().watched(), vec![SOL]);
}

#[tokio::test]
async fn test_grid_attaches_exit_to_position_left_without_one() {
    let venue = MockVenue::new();
    let prices = PriceCache::new(15_000);
    let ctx = context(&venue, prices.clone());
    tick_price(&venue, &prices, "150");

    // entry filled but the process stopped before the take-profit went out
    let machine = ctx
        .open_position(OpenRequest {
            product_id: SOL,
            side: Side::Long,
            size: d("1"),
            leverage: 2,
            strategy: Some(StrategyType::Grid),
        })
        .await
        .unwrap();
    let mut record = StrategyRecord::new(ctx.id().clone(), StrategyConfig::Grid(grid_config()));
    record.current_position_id = ctx.owned_position(StrategyType::Grid);
    assert_eq!(record.current_position_id, Some(machine.id()));

    let mut grid = GridStrategy::new(grid_config()).unwrap();
    let cancel = CancellationToken::new();
    assert_eq!(
        grid.tick(&ctx, &mut record, &cancel).await.unwrap(),
        TickOutcome::Holding(machine.id())
    );
    assert!(machine.active_rule(TpSlKind::TakeProfit).is_some());
    assert_eq!(venue.live_orders_of_kind(SOL, OrderKind::TakeProfit), 1);

    grid.tick(&ctx, &mut record, &cancel).await.unwrap();
    assert_eq!(venue.orders_of_kind(SOL, OrderKind::TakeProfit).len(), 1);
    assert_eq!(venue.orders_of_kind(SOL, OrderKind::Entry).len(), 1);
}

#[tokio::test]
async fn test_grid_halts_on_rejected_entry() {
    let venue = MockVenue::new();
    let prices = PriceCache::new(15_000);
    let ctx = context(&venue, prices.clone());
    tick_price(&venue, &prices, "150");
    venue.fail_next(
        MockOp::Place,
        VenueError::Rejected("reduce size".to_string()),
        1,
    );

    let mut grid = GridStrategy::new(grid_config()).unwrap();
    let mut record = StrategyRecord::new(ctx.id().clone(), StrategyConfig::Grid(grid_config()));
    let cancel = CancellationToken::new();

    let err = grid.tick(&ctx, &mut record, &cancel).await.unwrap_err();
    assert!(matches!(err, EngineError::OrderRejected(_)));
    assert_eq!(venue.place_calls(), 1);
}

#[tokio::test]
async fn test_ml_enters_on_confident_signal_with_scenario_exits() {
    let venue = MockVenue::new();
    let prices = PriceCache::new(15_000);
    let ctx = context(&venue, prices.clone());
    tick_price(&venue, &prices, "200");

    let predictor = Arc::new(FixedPredictor::new(Direction::Down, "0.75"));
    let mut ml = MlSignalStrategy::new(ml_config(), predictor).unwrap();
    let mut record = StrategyRecord::new(ctx.id().clone(), StrategyConfig::Ml(ml_config()));

    let id = match ml
        .tick(&ctx, &mut record, &CancellationToken::new())
        .await
        .unwrap()
    {
        TickOutcome::Opened(id) => id,
        other => panic!("expected an entry, got {:?}", other),
    };
    let position = ctx.position(id).unwrap();
    assert_eq!(position.side, Side::Short);
    assert_eq!(position.strategy, Some(StrategyType::Ml));

    let machine = ctx.machine(id).unwrap();
    // conservative: TP 0.5%, SL 0.3%, mirrored for a short
    assert_eq!(
        machine.active_rule(TpSlKind::TakeProfit).unwrap().target_price,
        d("199")
    );
    assert_eq!(
        machine.active_rule(TpSlKind::StopLoss).unwrap().target_price,
        d("200.6")
    );
    assert_eq!(ml.history_len(), 1);
}

#[tokio::test]
async fn test_ml_ignores_weak_or_sideways_signals() {
    let venue = MockVenue::new();
    let prices = PriceCache::new(15_000);
    let ctx = context(&venue, prices.clone());
    tick_price(&venue, &prices, "200");
    let cancel = CancellationToken::new();

    for predictor in [
        FixedPredictor::new(Direction::Up, "0.65"),
        FixedPredictor::new(Direction::Sideways, "0.9"),
    ] {
        let mut ml = MlSignalStrategy::new(ml_config(), Arc::new(predictor)).unwrap();
        let mut record = StrategyRecord::new(ctx.id().clone(), StrategyConfig::Ml(ml_config()));
        assert_eq!(
            ml.tick(&ctx, &mut record, &cancel).await.unwrap(),
            TickOutcome::Idle
        );
    }
    assert_eq!(venue.place_calls(), 0);
}

#[tokio::test]
async fn test_ml_slow_predictor_means_no_signal() {
    let venue = MockVenue::new();
    let prices = PriceCache::new(15_000);
    let ctx = context(&venue, prices.clone());
    tick_price(&venue, &prices, "200");

    let predictor = FixedPredictor {
        delay: Duration::from_millis(500),
        ..FixedPredictor::new(Direction::Up, "0.8")
    };
    let mut ml = MlSignalStrategy::new(ml_config(), Arc::new(predictor)).unwrap();
    let mut record = StrategyRecord::new(ctx.id().clone(), StrategyConfig::Ml(ml_config()));

    let outcome = ml
        .tick(&ctx, &mut record, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, TickOutcome::Idle);
    assert_eq!(venue.place_calls(), 0);
}

#[tokio::test]
async fn test_cancelled_tick_does_not_enter() {
    let venue = MockVenue::new();
    let prices = PriceCache::new(15_000);
    let ctx = context(&venue, prices.clone());
    tick_price(&venue, &prices, "200");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut ml = MlSignalStrategy::new(
        ml_config(),
        Arc::new(FixedPredictor::new(Direction::Up, "0.9")),
    )
    .unwrap();
    let mut record = StrategyRecord::new(ctx.id().clone(), StrategyConfig::Ml(ml_config()));

    assert_eq!(
        ml.tick(&ctx, &mut record, &cancel).await.unwrap(),
        TickOutcome::Idle
    );
    assert_eq!(venue.place_calls(), 0);
}

/// Answers with a different prediction on each call.
#[derive(Debug)]
struct ScriptedPredictor {
    answers: std::sync::Mutex<Vec<Prediction>>,
}

#[async_trait]
impl Predictor for ScriptedPredictor {
    async fn predict(&self, _history: &[Decimal]) -> Result<Prediction, PredictorError> {
        let mut answers = self.answers.lock().unwrap();
        if answers.is_empty() {
            return Err(PredictorError::Failed("no more answers".to_string()));
        }
        Ok(answers.remove(0))
    }
}

#[tokio::test]
async fn test_ml_open_position_is_not_overridden_by_new_signal() {
    let venue = MockVenue::new();
    let prices = PriceCache::new(15_000);
    let ctx = context(&venue, prices.clone());
    tick_price(&venue, &prices, "200");

    let predictor = Arc::new(ScriptedPredictor {
        answers: std::sync::Mutex::new(vec![
            Prediction {
                direction: Direction::Up,
                confidence: d("0.9"),
            },
            Prediction {
                direction: Direction::Down,
                confidence: d("0.95"),
            },
        ]),
    });
    let mut ml = MlSignalStrategy::new(ml_config(), predictor.clone()).unwrap();
    let mut record = StrategyRecord::new(ctx.id().clone(), StrategyConfig::Ml(ml_config()));
    let cancel = CancellationToken::new();

    let id = match ml.tick(&ctx, &mut record, &cancel).await.unwrap() {
        TickOutcome::Opened(id) => id,
        other => panic!("expected an entry, got {:?}", other),
    };
    let calls = venue.place_calls();

    tick_price(&venue, &prices, "199");
    assert_eq!(
        ml.tick(&ctx, &mut record, &cancel).await.unwrap(),
        TickOutcome::Holding(id)
    );
    assert_eq!(record.current_position_id, Some(id));
    assert_eq!(venue.place_calls(), calls);
    assert_eq!(ctx.position(id).unwrap().side, Side::Long);
    assert_eq!(ctx.machine(id).unwrap().state(), PositionState::Open);
    // the opposite signal was never even asked for
    assert_eq!(predictor.answers.lock().unwrap().len(), 1);
}
