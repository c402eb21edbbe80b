mod config;
mod control;
mod engine;
mod sizing;
mod state;

use alpaca_broker::AlpacaClient;
use anyhow::{Context, Result};
use broker_trait::BrokerClient;
use config::AgentConfig;
use control::ControlInputs;
use engine::DecisionEngine;
use signal_feed::SignalFeed;
use state::PersistentStateStore;
use std::sync::Arc;
use trade_log::TradeLog;

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    std::panic::set_hook(Box::new(|info| {
        tracing::error!("panic: {}", info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let cfg = AgentConfig::from_env()?;

    if !cfg.alpaca_base_url.contains("paper-api") && !cfg.live_trading_approved {
        tracing::error!(
            "ALPACA_BASE_URL does not look like a paper endpoint and LIVE_TRADING_APPROVED != yes; refusing to start"
        );
        std::process::exit(1);
    }

    let broker: Arc<dyn BrokerClient> = Arc::new(AlpacaClient::new(
        cfg.alpaca_api_key.clone(),
        cfg.alpaca_secret_key.clone(),
        cfg.alpaca_base_url.clone(),
        cfg.alpaca_data_url.clone(),
    )?);

    let account = broker
        .get_account()
        .await
        .context("startup broker connectivity check failed")?;
    tracing::info!(
        equity = %account.equity,
        cash = %account.cash,
        "broker connectivity check passed"
    );

    let feed = Arc::new(SignalFeed::new(
        cfg.signal_snapshot_url.clone(),
        cfg.signal_ws_url.clone(),
        cfg.signal_ws_token.clone(),
        cfg.poll_seconds,
    ));
    let feed_runner = feed.clone();
    tokio::spawn(async move { feed_runner.run().await });

    let store = PersistentStateStore::new(&cfg.state_dir)
        .with_context(|| format!("failed to open state dir {}", cfg.state_dir))?;

    let trade_log_path = format!("{}/trades.sqlite", cfg.state_dir.trim_end_matches('/'));
    let trade_log = Arc::new(TradeLog::open(&trade_log_path).await?);

    let control = ControlInputs::new(cfg.risk_profile.clone());

    let mut engine = DecisionEngine::new(broker, feed, control, store, trade_log, cfg.clone());

    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(cfg.decision_seconds));
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tracing::info!("decision engine started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = engine.tick().await {
                    tracing::error!("tick failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested (ctrl-c)");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("shutdown requested (sigterm)");
                break;
            }
        }
    }

    if let Err(e) = engine.persist_on_shutdown() {
        tracing::error!("final state persist failed: {}", e);
    }
    tracing::info!("decision engine stopped");
    Ok(())
}
