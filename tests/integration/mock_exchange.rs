//! Mock exchange for integration testing.
//!
//! Provides a deterministic exchange implementing every collaborator trait.
//! The deposit history, balances, and failures are fully controllable from
//! test code, and every transfer and notification is recorded.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use margin_sweep::exchange::{
    DepositHistoryService, ExchangeSession, MarginTransferService, SpotAccountService,
};
use margin_sweep::notify::{Notification, Notifier};
use margin_sweep::types::{Balance, Deposit, DepositStatus, TransferDirection};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedTransfer {
    pub asset: String,
    pub amount: Decimal,
    pub direction: TransferDirection,
}

#[derive(Default)]
struct MockState {
    history: Vec<Deposit>,
    balances: HashMap<String, Decimal>,
    transfers: Vec<RecordedTransfer>,
    failing_history: HashSet<String>,
    balance_error: Option<String>,
    transfer_error: Option<String>,
    history_delay: Option<Duration>,
}

/// A mock exchange for deterministic testing. All state is in-memory.
#[derive(Default)]
pub struct MockExchange {
    state: Mutex<MockState>,
    history_calls: AtomicUsize,
    balance_calls: AtomicUsize,
}

impl MockExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn session(self: &Arc<Self>) -> ExchangeSession {
        ExchangeSession::from_client("mock", self.clone())
    }

    /// Replace what the next history queries report.
    pub fn set_history(&self, deposits: Vec<Deposit>) {
        self.state.lock().unwrap().history = deposits;
    }

    pub fn set_balance(&self, asset: &str, available: Decimal) {
        self.state
            .lock()
            .unwrap()
            .balances
            .insert(asset.to_string(), available);
    }

    pub fn fail_history_for(&self, asset: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_history
            .insert(asset.to_string());
    }

    pub fn set_balance_error(&self, msg: Option<&str>) {
        self.state.lock().unwrap().balance_error = msg.map(String::from);
    }

    pub fn set_transfer_error(&self, msg: Option<&str>) {
        self.state.lock().unwrap().transfer_error = msg.map(String::from);
    }

    pub fn set_history_delay(&self, delay: Duration) {
        self.state.lock().unwrap().history_delay = Some(delay);
    }

    pub fn transfers(&self) -> Vec<RecordedTransfer> {
        self.state.lock().unwrap().transfers.clone()
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    pub fn balance_calls(&self) -> usize {
        self.balance_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DepositHistoryService for MockExchange {
    async fn query_deposit_history(
        &self,
        asset: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Deposit>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.state.lock().unwrap().history_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock().unwrap();
        if state.failing_history.contains(asset) {
            return Err(anyhow!("history endpoint unavailable for {asset}"));
        }

        // the real endpoint filters by coin but not always by status or order
        Ok(state
            .history
            .iter()
            .filter(|d| d.asset == asset && d.time >= since && d.time <= until)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SpotAccountService for MockExchange {
    async fn query_spot_balance(&self, asset: &str) -> Result<Option<Balance>> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        if let Some(ref msg) = state.balance_error {
            return Err(anyhow!("{msg}"));
        }
        Ok(state.balances.get(asset).map(|available| Balance {
            currency: asset.to_string(),
            available: *available,
            locked: Decimal::ZERO,
        }))
    }
}

#[async_trait]
impl MarginTransferService for MockExchange {
    async fn transfer_margin_account_asset(
        &self,
        asset: &str,
        amount: Decimal,
        direction: TransferDirection,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(ref msg) = state.transfer_error {
            return Err(anyhow!("{msg}"));
        }
        state.transfers.push(RecordedTransfer {
            asset: asset.to_string(),
            amount,
            direction,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) {
        self.sent.lock().unwrap().push(notification.clone());
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn deposit(
    asset: &str,
    txid: &str,
    status: DepositStatus,
    amount: Decimal,
    time: DateTime<Utc>,
) -> Deposit {
    Deposit {
        exchange: "mock".to_string(),
        asset: asset.to_string(),
        amount,
        address: format!("{asset}-deposit-address"),
        address_tag: String::new(),
        transaction_id: txid.to_string(),
        status,
        confirmation: String::new(),
        unlock_confirm: 0,
        time,
    }
}

pub fn confirming(
    asset: &str,
    txid: &str,
    status: DepositStatus,
    amount: Decimal,
    confirmation: &str,
    unlock_confirm: u32,
    time: DateTime<Utc>,
) -> Deposit {
    Deposit {
        confirmation: confirmation.to_string(),
        unlock_confirm,
        ..deposit(asset, txid, status, amount, time)
    }
}
