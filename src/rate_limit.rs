//! Single-token rate limiter for balance queries.
//!
//! The first `acquire` returns immediately; every later one waits until
//! `interval` has passed since the previous token was handed out.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::types::SweepError;

/// One spot balance query per 3 seconds.
pub const BALANCE_QUERY_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    /// Limiter used for the balance checks of one poll.
    pub fn for_balance_queries() -> Self {
        Self::new(BALANCE_QUERY_INTERVAL)
    }

    /// Wait for the next token, or bail out when `cancel` fires.
    pub async fn acquire(&mut self, cancel: &CancellationToken) -> Result<(), SweepError> {
        if cancel.is_cancelled() {
            return Err(SweepError::Cancelled);
        }

        if let Some(last) = self.last {
            let ready_at = last + self.interval;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SweepError::Cancelled),
                _ = tokio::time::sleep_until(ready_at) => {}
            }
        }

        self.last = Some(Instant::now());
        Ok(())
    }
}
