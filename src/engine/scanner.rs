//! Deposit history scanner.
//!
//! Re-queries a fixed trailing window on every poll. Windows overlap on
//! purpose: a deposit's pending -> success transition shows up on a later
//! poll without any cursor being kept.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::exchange::DepositHistoryService;
use crate::retry::RetryPolicy;
use crate::types::{Deposit, SweepError};

/// Trailing window covered by each history query.
pub const DEFAULT_LOOKBACK_HOURS: i64 = 4;

pub struct HistoryScanner {
    service: Arc<dyn DepositHistoryService>,
    retry: RetryPolicy,
    lookback: Duration,
}

impl HistoryScanner {
    pub fn new(service: Arc<dyn DepositHistoryService>, retry: RetryPolicy) -> Self {
        Self {
            service,
            retry,
            lookback: Duration::hours(DEFAULT_LOOKBACK_HOURS),
        }
    }

    pub fn lookback(&self) -> Duration {
        self.lookback
    }

    /// Deposits of `asset` in `[now - lookback, now]`, oldest first.
    pub async fn scan(
        &self,
        asset: &str,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Deposit>, SweepError> {
        let since = now - self.lookback;
        debug!(asset, %since, until = %now, "Scanning deposit history");

        let operation = format!("query {asset} deposit history");
        let mut deposits = self
            .retry
            .run(&operation, cancel, || {
                self.service.query_deposit_history(asset, since, now)
            })
            .await?;

        // stable: same-time records keep the exchange's order
        deposits.sort_by_key(|d| d.time);
        Ok(deposits)
    }
}
