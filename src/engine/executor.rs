//! Transfer executor.
//!
//! Moves released deposits from the spot account into the margin account.
//! Each transfer is capped at the currently available spot balance, since
//! part of a deposit may already have been spent or locked by the time it
//! settles.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::exchange::{MarginTransferService, SpotAccountService};
use crate::notify::{Notification, Notifier};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::types::{Deposit, SweepError, TransferDirection};

// ---------------------------------------------------------------------------
// Execution result
// ---------------------------------------------------------------------------

/// Outcome of one asset's transfer batch.
#[derive(Debug, Clone, Default)]
pub struct TransferReport {
    pub transferred: Vec<CompletedTransfer>,
    pub skipped: Vec<SkippedDeposit>,
    pub failed: Vec<FailedTransfer>,
    /// Deposits to put back on the watchlist.
    pub requeue: Vec<Deposit>,
    /// The batch stopped early on cancellation.
    pub cancelled: bool,
}

impl TransferReport {
    pub fn total_transferred(&self) -> Decimal {
        self.transferred.iter().map(|t| t.amount).sum()
    }
}

#[derive(Debug, Clone)]
pub struct CompletedTransfer {
    pub deposit: Deposit,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    InsufficientBalance { available: Decimal },
    BalanceQueryFailed(String),
}

#[derive(Debug, Clone)]
pub struct SkippedDeposit {
    pub deposit: Deposit,
    pub reason: SkipReason,
}

#[derive(Debug, Clone)]
pub struct FailedTransfer {
    pub deposit: Deposit,
    pub amount: Decimal,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct TransferExecutor {
    spot_account: Option<Arc<dyn SpotAccountService>>,
    margin: Arc<dyn MarginTransferService>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    settle_delay: Duration,
    requeue_on_balance_failure: bool,
}

impl TransferExecutor {
    pub fn new(
        spot_account: Option<Arc<dyn SpotAccountService>>,
        margin: Arc<dyn MarginTransferService>,
        notifier: Arc<dyn Notifier>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            spot_account,
            margin,
            notifier,
            retry,
            settle_delay: Duration::from_secs(3),
            requeue_on_balance_failure: false,
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_requeue_on_balance_failure(mut self, requeue: bool) -> Self {
        self.requeue_on_balance_failure = requeue;
        self
    }

    /// Transfer every released deposit of `asset`.
    ///
    /// Balance and transfer failures only affect their own deposit.
    /// Cancellation stops the batch; transfers already made stand.
    pub async fn execute_batch(
        &self,
        asset: &str,
        deposits: Vec<Deposit>,
        limiter: &mut RateLimiter,
        cancel: &CancellationToken,
    ) -> TransferReport {
        let mut report = TransferReport::default();

        if deposits.is_empty() {
            return report;
        }

        info!(asset, count = deposits.len(), "Found succeeded deposits");

        if !self.settle_delay.is_zero() {
            info!(asset, delay_ms = self.settle_delay.as_millis() as u64, "Delaying transfer");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    return report;
                }
                _ = tokio::time::sleep(self.settle_delay) => {}
            }
        }

        for deposit in deposits {
            match self.execute_one(deposit, limiter, cancel, &mut report).await {
                Ok(()) => {}
                Err(SweepError::Cancelled) => {
                    warn!(asset, "Transfer batch cancelled");
                    report.cancelled = true;
                    break;
                }
                Err(e) => error!(asset, error = %e, "Unexpected transfer error"),
            }
        }

        info!(
            asset,
            transferred = report.transferred.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            total = %report.total_transferred(),
            "Transfer batch complete"
        );

        report
    }

    async fn execute_one(
        &self,
        deposit: Deposit,
        limiter: &mut RateLimiter,
        cancel: &CancellationToken,
        report: &mut TransferReport,
    ) -> Result<(), SweepError> {
        info!(object = %deposit.object_id(), %deposit, "Found succeeded deposit");

        limiter.acquire(cancel).await?;

        let mut amount = deposit.amount;

        // the margin account balance is not usable here; spot only
        if let Some(spot) = &self.spot_account {
            let operation = format!("query {} spot balance", deposit.asset);
            let result = self
                .retry
                .run(&operation, cancel, || spot.query_spot_balance(&deposit.asset))
                .await;
            let balance = match result {
                Ok(balance) => balance,
                Err(SweepError::Cancelled) => return Err(SweepError::Cancelled),
                Err(e) => {
                    error!(asset = %deposit.asset, txid = %deposit.transaction_id, error = %e, "Unable to query spot account");
                    self.notifier
                        .notify(&Notification::BalanceQueryFailed {
                            asset: deposit.asset.clone(),
                            transaction_id: deposit.transaction_id.clone(),
                            deposit_amount: deposit.amount,
                            error: e.to_string(),
                        })
                        .await;
                    if self.requeue_on_balance_failure {
                        report.requeue.push(deposit.clone());
                    }
                    report.skipped.push(SkippedDeposit {
                        deposit,
                        reason: SkipReason::BalanceQueryFailed(e.to_string()),
                    });
                    return Ok(());
                }
            };

            match balance {
                Some(bal) => {
                    info!(asset = %deposit.asset, available = %bal.available, locked = %bal.locked, "Spot account balance");
                    amount = amount.min(bal.available);

                    if amount <= Decimal::ZERO {
                        self.notifier
                            .notify(&Notification::InsufficientBalance {
                                asset: deposit.asset.clone(),
                                transaction_id: deposit.transaction_id.clone(),
                                deposit_amount: deposit.amount,
                                available: bal.available,
                                currency: bal.currency.clone(),
                            })
                            .await;
                        report.skipped.push(SkippedDeposit {
                            deposit,
                            reason: SkipReason::InsufficientBalance {
                                available: bal.available,
                            },
                        });
                        return Ok(());
                    }
                }
                None => {
                    error!(asset = %deposit.asset, "Unexpected error: spot balance not found");
                }
            }
        }

        self.notifier
            .notify(&Notification::TransferInitiated {
                asset: deposit.asset.clone(),
                transaction_id: deposit.transaction_id.clone(),
                deposit_amount: deposit.amount,
                transfer_amount: amount,
            })
            .await;

        let operation = format!("transfer {} into margin", deposit.asset);
        let result = self
            .retry
            .run(&operation, cancel, || {
                self.margin
                    .transfer_margin_account_asset(&deposit.asset, amount, TransferDirection::In)
            })
            .await;

        match result {
            Ok(()) => {
                info!(asset = %deposit.asset, txid = %deposit.transaction_id, %amount, "Transferred deposit into the margin account");
                report.transferred.push(CompletedTransfer { deposit, amount });
                Ok(())
            }
            Err(SweepError::Cancelled) => Err(SweepError::Cancelled),
            Err(e) => {
                error!(asset = %deposit.asset, txid = %deposit.transaction_id, error = %e, "Unable to transfer deposit asset into the margin account");
                self.notifier
                    .notify(&Notification::TransferFailed {
                        asset: deposit.asset.clone(),
                        transaction_id: deposit.transaction_id.clone(),
                        amount,
                        error: e.to_string(),
                    })
                    .await;
                report.failed.push(FailedTransfer {
                    deposit,
                    amount,
                    reason: e.to_string(),
                });
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
