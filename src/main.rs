use anyhow::Context;
use perpkeeper::config::{load_strategy_requests, Config};
use perpkeeper::engine::{EngineSettings, WalletAccount, WalletContext};
use perpkeeper::feed::{PriceCache, PricePoller};
use perpkeeper::notify::{BroadcastNotifier, FanoutNotifier, LogNotifier, Notifier};
use perpkeeper::predictor::{Predictor, TrendPredictor};
use perpkeeper::{api, init_db, SqliteStateStore, StateStore, StrategyOrchestrator, WalletId};
use perpkeeper::{RestVenueGateway, VenueGateway};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        eprintln!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let pool = init_db(&config.database_path)
        .await
        .context("failed to initialize database")?;
    let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::new(pool));
    let venue: Arc<dyn VenueGateway> = Arc::new(RestVenueGateway::new(config.venue_api_url.clone()));
    let notifier: Arc<dyn Notifier> = Arc::new(FanoutNotifier::new(vec![
        Arc::new(LogNotifier),
        Arc::new(BroadcastNotifier::default()),
    ]));
    let predictor: Arc<dyn Predictor> = Arc::new(TrendPredictor::new());
    let prices = PriceCache::new(config.price_max_age_ms);
    let settings = EngineSettings::from_config(&config);
    let root = CancellationToken::new();

    let wallets: Vec<Arc<WalletContext>> = config
        .wallets
        .iter()
        .map(|wallet| {
            Arc::new(WalletContext::new(
                WalletAccount::from_config(wallet),
                venue.clone(),
                store.clone(),
                notifier.clone(),
                prices.clone(),
                settings.clone(),
                &root,
            ))
        })
        .collect();
    let orchestrator = Arc::new(StrategyOrchestrator::new(wallets, predictor, root.clone()));

    let state = api::AppState::new();
    let app = api::create_router(state.clone());
    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    tracing::info!(network = config.network.as_str(), "Server listening on {}", addr);

    let server_cancel = root.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    // Nothing trades until every wallet is reconciled.
    let mut resume = Vec::new();
    for (wallet, result) in orchestrator.recover().await {
        match result {
            Ok(report) => resume.extend(report.resume),
            Err(e) => tracing::error!(wallet = %wallet, error = %e, "Wallet left halted"),
        }
    }

    let poller = PricePoller::new(
        venue.clone(),
        prices.clone(),
        config.price_poll_interval,
        config.retry.clone(),
    );
    let poller = tokio::spawn(poller.run(root.clone()));
    orchestrator.spawn_monitors(config.tpsl_poll_interval);

    for (record, e) in orchestrator.resume(resume).await {
        tracing::warn!(wallet = %record.wallet_id, strategy = %record.strategy_type, error = %e, "Strategy not resumed");
    }
    if let Some(path) = &config.strategies_file {
        let requests = load_strategy_requests(path).context("failed to load strategies file")?;
        for request in requests {
            let wallet = WalletId::new(request.wallet);
            let strategy = request.strategy.strategy_type();
            match orchestrator.start(&wallet, request.strategy).await {
                Ok(()) => {}
                Err(perpkeeper::EngineError::AlreadyRunning { .. }) => {
                    tracing::info!(wallet = %wallet, strategy = %strategy, "Strategy already resumed");
                }
                Err(e) => {
                    tracing::error!(wallet = %wallet, strategy = %strategy, error = %e, "Strategy not started");
                }
            }
        }
    }

    state.mark_ready();
    tracing::info!(wallets = config.wallets.len(), "Engine ready");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            tracing::info!("Shutdown requested");
        }
        _ = root.cancelled() => {}
    }

    orchestrator.shutdown().await;
    poller.await.context("price poller task failed")?;
    server
        .await
        .context("server task failed")?
        .context("server error")?;
    Ok(())
}
