//! Deposit watcher: the periodic scan → reconcile → release → transfer job.
//!
//! One watcher owns the watchlist for one exchange session and asset set.
//! Polls are single-flight: a poll that starts while another is running is
//! refused instead of racing on the watchlist.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::executor::{TransferExecutor, TransferReport};
use super::scanner::HistoryScanner;
use super::watchlist::{ReconcileSummary, Watchlist};
use crate::config::AppConfig;
use crate::exchange::ExchangeSession;
use crate::notify::Notifier;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::types::{Deposit, SweepError};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub assets: Vec<String>,
    pub interval: Duration,
    pub settle_delay: Duration,
    pub requeue_on_balance_failure: bool,
    pub retry: RetryPolicy,
}

impl WatcherSettings {
    pub fn new(assets: Vec<String>) -> Self {
        Self {
            assets,
            interval: Duration::from_secs(300),
            settle_delay: Duration::from_secs(3),
            requeue_on_balance_failure: false,
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            assets: cfg.watcher.assets.clone(),
            interval: cfg.watcher.interval(),
            settle_delay: cfg.watcher.transfer_delay(),
            requeue_on_balance_failure: cfg.watcher.requeue_on_balance_failure,
            retry: RetryPolicy::from(&cfg.retry),
        }
    }
}

// ---------------------------------------------------------------------------
// Poll report
// ---------------------------------------------------------------------------

/// What happened to one asset during a poll.
#[derive(Debug, Clone, Default)]
pub struct AssetOutcome {
    pub asset: String,
    pub scanned: usize,
    pub reconcile: ReconcileSummary,
    pub released: usize,
    pub transfer: Option<TransferReport>,
    /// Set when the history scan failed and the asset was skipped.
    pub scan_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PollReport {
    pub poll_id: String,
    pub assets: Vec<AssetOutcome>,
    pub cancelled: bool,
}

impl PollReport {
    pub fn transfers(&self) -> usize {
        self.assets
            .iter()
            .filter_map(|a| a.transfer.as_ref())
            .map(|t| t.transferred.len())
            .sum()
    }

    pub fn outcome(&self, asset: &str) -> Option<&AssetOutcome> {
        self.assets.iter().find(|a| a.asset == asset)
    }
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

pub struct DepositWatcher {
    exchange: String,
    assets: Vec<String>,
    interval: Duration,
    scanner: HistoryScanner,
    executor: TransferExecutor,
    watchlist: Mutex<Watchlist>,
    poll_guard: Mutex<()>,
}

impl DepositWatcher {
    /// Build a watcher for `session`.
    ///
    /// Fails with `UnsupportedCapability` when the session can neither list
    /// deposit history nor transfer into margin.
    pub fn new(
        session: &ExchangeSession,
        settings: WatcherSettings,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, SweepError> {
        let margin = session.require_margin_transfer()?;
        let history = session.require_history()?;

        if session.spot_account.is_none() {
            warn!(
                exchange = %session.name,
                "Session has no spot account query, transfers will not be capped by balance"
            );
        }

        let scanner = HistoryScanner::new(history, settings.retry.clone());
        let executor = TransferExecutor::new(
            session.spot_account.clone(),
            margin,
            notifier,
            settings.retry,
        )
        .with_settle_delay(settings.settle_delay)
        .with_requeue_on_balance_failure(settings.requeue_on_balance_failure);

        Ok(Self {
            exchange: session.name.clone(),
            assets: settings.assets,
            interval: settings.interval,
            scanner,
            executor,
            watchlist: Mutex::new(Watchlist::new()),
            poll_guard: Mutex::new(()),
        })
    }

    pub fn instance_id(&self) -> String {
        format!("deposit-watcher-{}-[{}]", self.exchange, self.assets.join(","))
    }

    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    /// Currently watched deposits of `asset`, oldest first.
    pub async fn tracked(&self, asset: &str) -> Vec<Deposit> {
        self.watchlist
            .lock()
            .await
            .tracked(asset)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn watermark(&self, asset: &str) -> Option<DateTime<Utc>> {
        self.watchlist.lock().await.watermark(asset)
    }

    /// Poll every asset once, using the current time as the window end.
    pub async fn check_deposits(&self, cancel: &CancellationToken) -> Result<PollReport, SweepError> {
        self.check_deposits_at(Utc::now(), cancel).await
    }

    /// Poll every asset once with the history window ending at `now`.
    pub async fn check_deposits_at(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<PollReport, SweepError> {
        let _guard = self
            .poll_guard
            .try_lock()
            .map_err(|_| SweepError::PollInProgress)?;

        let poll_id = Uuid::new_v4().to_string();
        let span = info_span!("poll", poll_id = %poll_id, exchange = %self.exchange);

        let report = async move {
            let mut report = PollReport {
                poll_id,
                ..PollReport::default()
            };
            // one limiter for all balance queries of this poll
            let mut limiter = RateLimiter::for_balance_queries();

            for asset in &self.assets {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break;
                }

                match self.check_asset(asset, now, &mut limiter, cancel).await {
                    Ok(outcome) => {
                        let cancelled = outcome.transfer.as_ref().is_some_and(|t| t.cancelled);
                        report.assets.push(outcome);
                        if cancelled {
                            report.cancelled = true;
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(asset = %asset, error = %e, "Deposit poll interrupted");
                        report.cancelled = true;
                        break;
                    }
                }
            }

            report
        }
        .instrument(span)
        .await;

        Ok(report)
    }

    /// `Err` only on cancellation; a scan failure is recorded in the outcome.
    async fn check_asset(
        &self,
        asset: &str,
        now: DateTime<Utc>,
        limiter: &mut RateLimiter,
        cancel: &CancellationToken,
    ) -> Result<AssetOutcome, SweepError> {
        debug!(asset, "Checking deposits");

        let mut outcome = AssetOutcome {
            asset: asset.to_string(),
            ..AssetOutcome::default()
        };

        let events = match self.scanner.scan(asset, now, cancel).await {
            Ok(events) => events,
            Err(SweepError::Cancelled) => return Err(SweepError::Cancelled),
            Err(e) => {
                error!(asset, error = %e, "Unable to scan deposit history");
                outcome.scan_error = Some(e.to_string());
                return Ok(outcome);
            }
        };
        outcome.scanned = events.len();

        let released = {
            let mut watchlist = self.watchlist.lock().await;
            outcome.reconcile = watchlist.reconcile(asset, &events);
            watchlist.release_ready(asset)
        };
        outcome.released = released.len();

        if released.is_empty() {
            debug!(asset, "No released deposit");
            return Ok(outcome);
        }

        let transfer = self
            .executor
            .execute_batch(asset, released, limiter, cancel)
            .await;

        if !transfer.requeue.is_empty() {
            let mut watchlist = self.watchlist.lock().await;
            for deposit in transfer.requeue.iter().cloned() {
                watchlist.requeue(deposit);
            }
        }

        outcome.transfer = Some(transfer);
        Ok(outcome)
    }

    /// Poll immediately, then every `interval`, until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            instance = %self.instance_id(),
            interval_secs = self.interval.as_secs(),
            "Deposit watcher started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.check_deposits(&cancel).await {
                        Ok(report) => log_poll_report(&report),
                        Err(SweepError::PollInProgress) => {
                            warn!("Previous deposit poll still running, skipping tick");
                        }
                        Err(e) => error!(error = %e, "Deposit poll failed"),
                    }
                }
            }
        }

        info!(instance = %self.instance_id(), "Deposit watcher stopped");
    }
}

/// Log a one-line summary of a poll.
fn log_poll_report(report: &PollReport) {
    let scan_failures = report.assets.iter().filter(|a| a.scan_error.is_some()).count();
    info!(
        poll_id = %report.poll_id,
        assets = report.assets.len(),
        scan_failures,
        transfers = report.transfers(),
        cancelled = report.cancelled,
        "Deposit poll complete"
    );
}
