//! margin-sweep deposit watcher
//!
//! Entry point. Loads configuration, initialises structured logging,
//! wires the exchange session and notifier, and runs the deposit watcher
//! until Ctrl+C.

use anyhow::{Context, Result};
use secrecy::SecretString;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use margin_sweep::config::{self, AppConfig};
use margin_sweep::engine::watcher::{DepositWatcher, WatcherSettings};
use margin_sweep::exchange::paper::PaperExchange;
use margin_sweep::exchange::ExchangeSession;
use margin_sweep::notify::{Notifier, TelegramNotifier, TracingNotifier};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let cfg = config::AppConfig::load(&config_path)?;

    init_logging();

    info!(
        exchange = %cfg.exchange.name,
        assets = ?cfg.watcher.assets,
        interval_secs = cfg.watcher.interval_secs,
        transfer_delay_secs = cfg.watcher.transfer_delay_secs,
        "margin-sweep starting up"
    );

    let cancel = CancellationToken::new();

    let session = build_session(&cfg)?;
    let notifier = build_notifier(&cfg, cancel.child_token())?;
    let watcher = Arc::new(DepositWatcher::new(
        &session,
        WatcherSettings::from_config(&cfg),
        notifier,
    )?);
    info!(instance = %watcher.instance_id(), assets = ?watcher.assets(), "Deposit watcher ready");

    let handle = {
        let watcher = watcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { watcher.run(cancel).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutdown signal received.");
    cancel.cancel();

    handle.await.context("Deposit watcher task panicked")?;
    info!("margin-sweep shut down cleanly.");
    Ok(())
}

/// Build the exchange session named in the config.
fn build_session(cfg: &AppConfig) -> Result<ExchangeSession> {
    match cfg.exchange.name.as_str() {
        "paper" => {
            let exchange = match cfg.exchange.fixture_path.as_deref() {
                Some(path) => PaperExchange::load("paper", path)?,
                None => {
                    warn!("No paper fixture configured, starting with an empty exchange");
                    PaperExchange::new("paper")
                }
            };
            let name = exchange.name().to_string();
            Ok(ExchangeSession::from_client(name, Arc::new(exchange)))
        }
        other => anyhow::bail!("Unsupported exchange: {other}"),
    }
}

/// Telegram when both env vars resolve, log-only otherwise.
fn build_notifier(cfg: &AppConfig, cancel: CancellationToken) -> Result<Arc<dyn Notifier>> {
    let resolve = |env: &Option<String>| {
        env.as_deref()
            .and_then(|name| AppConfig::resolve_env(name).ok())
    };

    match (
        resolve(&cfg.alerts.telegram_bot_token_env),
        resolve(&cfg.alerts.telegram_chat_id_env),
    ) {
        (Some(token), Some(chat_id)) => {
            info!("Telegram notifications enabled");
            Ok(Arc::new(TelegramNotifier::new(
                SecretString::new(token),
                chat_id,
                cancel,
            )?))
        }
        _ => {
            info!("Telegram not configured, notifications go to the log only");
            Ok(Arc::new(TracingNotifier))
        }
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("margin_sweep=info"));

    let json_logging = std::env::var("SWEEP_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
