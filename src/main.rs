use chrono::Utc;
use clap::Parser;
use dhanbot::config::{AppConfig, Credentials};
use dhanbot::execution::{
    LoopSettings, OrderGateway, OrderSubmitter, PaperGateway, PriceFeedManager, StrategyLoop,
    TickStore,
};
use dhanbot::feed::QuoteStreamClient;
use dhanbot::strategy::{PolicyKind, SignalEvaluator};
use dhanbot::{DhanClient, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dhanbot", version, about = "Intraday signal trading loop for Dhan")]
struct Args {
    /// Configuration file (defaults to ./dhanbot.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Simulate fills locally instead of sending orders to the broker
    #[arg(long)]
    paper: bool,

    /// Override the configured signal policy
    #[arg(long, value_enum)]
    policy: Option<PolicyKind>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = match AppConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            setup_logging(&AppConfig::default().log_level);
            tracing::error!("❌ {}", e);
            std::process::exit(1);
        }
    };
    setup_logging(&config.log_level);

    if let Some(policy) = args.policy {
        config.strategy.policy = policy;
    }

    tracing::info!("🚀 dhanbot starting");

    let credentials = match Credentials::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("❌ {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!("🆔 Client ID: {}", credentials.client_id);
    tracing::info!("🔑 Access Token: {}", credentials.masked_token());

    let client = DhanClient::new(&config.broker, credentials.clone())?;
    check_profile(&client).await;

    // Tick history and signal evaluation
    let store = TickStore::new(config.strategy.history_capacity);
    let evaluator = SignalEvaluator::from_config(&config.strategy, store.clone());
    tracing::info!(
        "📐 Policy {} on {}s candles, {} samples required",
        evaluator.policy_name(),
        config.strategy.candle_interval_secs,
        evaluator.required_samples()
    );

    let price_feed = PriceFeedManager::new(
        client.clone(),
        store.clone(),
        config.trading.window.clone(),
        config.strategy.candle_interval(),
    )
    .with_stale_after(chrono::Duration::seconds(config.trading.stale_quote_secs));
    if config.trading.warm_up {
        let seeded = price_feed
            .warm_up(&config.instruments, evaluator.lookback(), Utc::now())
            .await;
        tracing::info!("🔥 Warm-up recorded {} historical closes", seeded);
    }

    // Live quotes
    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let (tick_tx, tick_rx) = mpsc::channel(config.feed.channel_capacity);
    let ingest_task = PriceFeedManager::spawn_ingest(store.clone(), tick_rx);

    let feed = QuoteStreamClient::new(config.feed.clone(), credentials);
    feed.subscribe(config.instruments.iter().map(|i| i.security_id.clone()));
    let feed_task = feed.start(tick_tx, shutdown_tx.subscribe())?;

    let ready_timeout = Duration::from_secs(config.feed.ready_timeout_secs);
    if feed.wait_until_ready(ready_timeout).await {
        tracing::info!("✅ Quote stream ready");
    } else {
        tracing::warn!(
            "⚠️  Quote stream not ready after {:?}, using REST quotes until it connects",
            ready_timeout
        );
    }

    // Orders
    let gateway: Arc<dyn OrderGateway> = if args.paper {
        tracing::info!("📝 Paper trading: orders are simulated locally");
        Arc::new(PaperGateway::new())
    } else {
        Arc::new(client.clone())
    };
    let submitter = OrderSubmitter::new(gateway, config.trading.price_buffer);

    let mut strategy_loop = StrategyLoop::new(
        config.instruments.clone(),
        LoopSettings::from(&config),
        evaluator,
        submitter,
        store,
    )
    .with_price_feed(price_feed);

    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
            let _ = ctrl_c_tx.send(());
        }
    });

    tracing::info!("Press Ctrl+C to stop...");
    let result = strategy_loop.run(shutdown_tx.subscribe()).await;

    // Tear down the stream; the ingest task ends with it
    let _ = shutdown_tx.send(());
    feed.close();
    match tokio::time::timeout(Duration::from_secs(5), feed_task).await {
        Ok(Ok(Err(e))) => tracing::warn!("Quote stream ended with error: {}", e),
        Ok(Err(e)) => tracing::warn!("Quote stream task failed: {}", e),
        Ok(Ok(Ok(()))) => {}
        Err(_) => tracing::warn!("Quote stream did not stop in time"),
    }
    if let Ok(Ok(count)) = tokio::time::timeout(Duration::from_secs(1), ingest_task).await {
        tracing::debug!("Ingested {} ticks this session", count);
    }

    match result {
        Ok(outcome) => {
            tracing::info!("👋 dhanbot stopped: {:?}", outcome);
            Ok(())
        }
        Err(e) => {
            tracing::error!("❌ dhanbot stopped: {}", e);
            std::process::exit(2);
        }
    }
}

fn setup_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Credential sanity check. A failure is reported but not fatal.
async fn check_profile(client: &DhanClient) {
    match client.get_profile().await {
        Ok(profile) => tracing::info!(
            "📬 Profile OK: client {} (token valid until {})",
            profile.dhan_client_id,
            profile.token_validity.as_deref().unwrap_or("unknown")
        ),
        Err(e) => tracing::warn!("⚠️  Profile check failed: {}", e),
    }
}
