//! Deposit watchlist.
//!
//! Tracks deposits between first sighting and release, plus a per-asset
//! watermark of the latest deposit time already seen. The watermark is what
//! separates history that predates the watcher (already settled, ignored)
//! from deposits that settle while being watched.
//!
//! Reconciling the same or an overlapping window again never changes the
//! outcome: a tracked id is refreshed in place, and a success deposit that
//! was ignored or released sits at or below the watermark so it is never
//! picked up as new.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::gate::is_release_ready;
use crate::types::{short_txid, Deposit, DepositStatus};

/// Deposits are unique per (asset, transaction id) within one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DepositKey {
    asset: String,
    transaction_id: String,
}

impl DepositKey {
    fn of(deposit: &Deposit) -> Self {
        Self {
            asset: deposit.asset.clone(),
            transaction_id: deposit.transaction_id.clone(),
        }
    }
}

/// What one `reconcile` call decided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Newly tracked deposits.
    pub added: usize,
    /// Tracked deposits refreshed with a newer report.
    pub updated: usize,
    /// Success deposits treated as pre-existing history.
    pub ignored: usize,
    /// Tracked deposits removed after turning rejected or cancelled.
    pub dropped: usize,
}

#[derive(Debug, Default)]
pub struct Watchlist {
    deposits: HashMap<DepositKey, Deposit>,
    last_seen: HashMap<String, DateTime<Utc>>,
}

impl Watchlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.deposits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deposits.is_empty()
    }

    pub fn contains(&self, asset: &str, transaction_id: &str) -> bool {
        self.get(asset, transaction_id).is_some()
    }

    pub fn get(&self, asset: &str, transaction_id: &str) -> Option<&Deposit> {
        self.deposits.get(&DepositKey {
            asset: asset.to_string(),
            transaction_id: transaction_id.to_string(),
        })
    }

    /// Latest deposit time processed for `asset`, if any scan has seen one.
    pub fn watermark(&self, asset: &str) -> Option<DateTime<Utc>> {
        self.last_seen.get(asset).copied()
    }

    /// Tracked deposits of `asset`, oldest first.
    pub fn tracked(&self, asset: &str) -> Vec<&Deposit> {
        let mut tracked: Vec<&Deposit> = self
            .deposits
            .values()
            .filter(|d| d.asset == asset)
            .collect();
        tracked.sort_by(|a, b| (a.time, &a.transaction_id).cmp(&(b.time, &b.transaction_id)));
        tracked
    }

    /// Fold one history window for `asset` into the watchlist.
    pub fn reconcile(&mut self, asset: &str, events: &[Deposit]) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        let mut ordered: Vec<&Deposit> = events.iter().filter(|d| d.asset == asset).collect();
        ordered.sort_by_key(|d| d.time);

        let watermark = self.watermark(asset);

        for deposit in &ordered {
            debug!(asset, txid = %deposit.transaction_id, status = %deposit.status, "Checking deposit");

            let key = DepositKey::of(deposit);
            if self.deposits.contains_key(&key) {
                if deposit.status.is_terminal_failure() {
                    info!(
                        asset,
                        txid = %short_txid(&deposit.transaction_id),
                        status = %deposit.status,
                        "Watched deposit will never settle, dropping"
                    );
                    self.deposits.remove(&key);
                    summary.dropped += 1;
                } else {
                    self.deposits.insert(key, (*deposit).clone());
                    summary.updated += 1;
                }
                continue;
            }

            match deposit.status {
                DepositStatus::Success => match watermark {
                    Some(last) if deposit.time > last => {
                        info!(asset, txid = %deposit.transaction_id, "Adding new success deposit");
                        self.deposits.insert(key, (*deposit).clone());
                        summary.added += 1;
                    }
                    _ => {
                        info!(asset, txid = %deposit.transaction_id, %deposit, "Ignored success deposit");
                        summary.ignored += 1;
                    }
                },
                DepositStatus::Pending | DepositStatus::Credited => {
                    info!(asset, txid = %deposit.transaction_id, status = %deposit.status, "Adding pending deposit");
                    self.deposits.insert(key, (*deposit).clone());
                    summary.added += 1;
                }
                DepositStatus::Rejected | DepositStatus::Cancelled => {
                    debug!(asset, txid = %deposit.transaction_id, status = %deposit.status, "Skipping unsettled deposit");
                }
            }
        }

        if let Some(latest) = ordered.last().map(|d| d.time) {
            let next = watermark.map_or(latest, |last| last.max(latest));
            self.last_seen.insert(asset.to_string(), next);
        }

        summary
    }

    /// Remove and return every success deposit of `asset` that passes the
    /// confirmation gate, ordered by time then transaction id.
    pub fn release_ready(&mut self, asset: &str) -> Vec<Deposit> {
        let mut ready: Vec<DepositKey> = Vec::new();

        for (key, deposit) in &self.deposits {
            if deposit.asset != asset || deposit.status != DepositStatus::Success {
                continue;
            }

            if is_release_ready(deposit) {
                ready.push(key.clone());
            } else {
                let (current, required) = deposit.current_confirmation();
                info!(
                    asset,
                    txid = %deposit.transaction_id,
                    unlock_confirm = deposit.unlock_confirm,
                    current,
                    required,
                    "Unlock confirmation not reached, skip this round"
                );
            }
        }

        let mut released: Vec<Deposit> = ready
            .into_iter()
            .filter_map(|key| self.deposits.remove(&key))
            .collect();
        released.sort_by(|a, b| (a.time, &a.transaction_id).cmp(&(b.time, &b.transaction_id)));

        for deposit in &released {
            info!(asset, txid = %deposit.transaction_id, amount = %deposit.amount, "Releasing deposit");
        }

        released
    }

    /// Put a released deposit back so the next poll considers it again.
    pub fn requeue(&mut self, deposit: Deposit) {
        info!(asset = %deposit.asset, txid = %deposit.transaction_id, "Requeueing deposit");
        self.deposits.insert(DepositKey::of(&deposit), deposit);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
