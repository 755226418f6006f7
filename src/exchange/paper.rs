//! Paper exchange.
//!
//! In-memory exchange seeded from a JSON fixture, used for dry runs of the
//! watcher binary. Transfers move funds from the spot balance into a margin
//! balance. With `simulateConfirmations` set, every history query advances
//! pending deposits by one confirmation and flips them to success once the
//! required count is reached.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};

use super::{DepositHistoryService, MarginTransferService, SpotAccountService};
use crate::types::{Balance, Deposit, DepositStatus, TransferDirection};

// ---------------------------------------------------------------------------
// Fixture format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaperFixture {
    #[serde(default)]
    pub spot_balances: HashMap<String, Decimal>,
    #[serde(default)]
    pub deposits: Vec<FixtureDeposit>,
    #[serde(default)]
    pub simulate_confirmations: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureDeposit {
    pub asset: String,
    pub amount: Decimal,
    #[serde(default)]
    pub address: String,
    #[serde(rename = "transactionID")]
    pub transaction_id: String,
    pub status: DepositStatus,
    #[serde(default)]
    pub confirmation: String,
    #[serde(default)]
    pub unlock_confirm: u32,
    /// Absolute deposit time. Takes precedence over `minutesAgo`.
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    /// Deposit time relative to when the fixture is loaded.
    #[serde(default)]
    pub minutes_ago: i64,
}

impl FixtureDeposit {
    fn into_deposit(self, exchange: &str, loaded_at: DateTime<Utc>) -> Deposit {
        Deposit {
            exchange: exchange.to_string(),
            asset: self.asset,
            amount: self.amount,
            address: self.address,
            address_tag: String::new(),
            transaction_id: self.transaction_id,
            status: self.status,
            confirmation: self.confirmation,
            unlock_confirm: self.unlock_confirm,
            time: self
                .time
                .unwrap_or_else(|| loaded_at - Duration::minutes(self.minutes_ago)),
        }
    }
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

/// A completed paper transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct PaperTransfer {
    pub asset: String,
    pub amount: Decimal,
    pub direction: TransferDirection,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PaperState {
    deposits: Vec<Deposit>,
    spot: HashMap<String, Decimal>,
    margin: HashMap<String, Decimal>,
    transfers: Vec<PaperTransfer>,
}

#[derive(Debug)]
pub struct PaperExchange {
    name: String,
    simulate_confirmations: bool,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            simulate_confirmations: false,
            state: Mutex::new(PaperState::default()),
        }
    }

    pub fn from_fixture(name: &str, fixture: PaperFixture) -> Self {
        let loaded_at = Utc::now();
        let deposits = fixture
            .deposits
            .into_iter()
            .map(|d| d.into_deposit(name, loaded_at))
            .collect();

        Self {
            name: name.to_string(),
            simulate_confirmations: fixture.simulate_confirmations,
            state: Mutex::new(PaperState {
                deposits,
                spot: fixture.spot_balances,
                ..PaperState::default()
            }),
        }
    }

    /// Load a fixture from a JSON file.
    pub fn load(name: &str, path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            bail!("Paper exchange fixture not found: {path}");
        }
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read paper fixture {path}"))?;
        let fixture: PaperFixture = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse paper fixture {path}"))?;

        let exchange = Self::from_fixture(name, fixture);
        info!(
            path,
            deposits = exchange.lock()?.deposits.len(),
            "Paper exchange loaded"
        );
        Ok(exchange)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record a new deposit, crediting the spot balance on success.
    pub fn push_deposit(&self, deposit: Deposit) -> Result<()> {
        let mut state = self.lock()?;
        if deposit.status == DepositStatus::Success {
            *state.spot.entry(deposit.asset.clone()).or_default() += deposit.amount;
        }
        state.deposits.push(deposit);
        Ok(())
    }

    pub fn set_spot_balance(&self, asset: &str, amount: Decimal) -> Result<()> {
        self.lock()?.spot.insert(asset.to_string(), amount);
        Ok(())
    }

    pub fn spot_balance(&self, asset: &str) -> Result<Decimal> {
        Ok(self.lock()?.spot.get(asset).copied().unwrap_or_default())
    }

    pub fn margin_balance(&self, asset: &str) -> Result<Decimal> {
        Ok(self.lock()?.margin.get(asset).copied().unwrap_or_default())
    }

    pub fn transfers(&self) -> Result<Vec<PaperTransfer>> {
        Ok(self.lock()?.transfers.clone())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PaperState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("paper exchange state poisoned"))
    }
}

/// Advance a pending deposit by one confirmation.
fn advance_confirmation(deposit: &mut Deposit, spot: &mut HashMap<String, Decimal>) {
    if deposit.status != DepositStatus::Pending {
        return;
    }

    let (current, required) = deposit.current_confirmation();
    if required == 0 {
        return;
    }

    let next = (current + 1).min(required);
    deposit.confirmation = format!("{next}/{required}");
    if next >= required {
        deposit.status = DepositStatus::Success;
        *spot.entry(deposit.asset.clone()).or_default() += deposit.amount;
    }
}

#[async_trait]
impl DepositHistoryService for PaperExchange {
    async fn query_deposit_history(
        &self,
        asset: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Deposit>> {
        let mut state = self.lock()?;
        let PaperState { deposits, spot, .. } = &mut *state;

        if self.simulate_confirmations {
            for d in deposits.iter_mut().filter(|d| d.asset == asset) {
                advance_confirmation(d, spot);
            }
        }

        let found: Vec<Deposit> = deposits
            .iter()
            .filter(|d| d.asset == asset && d.time >= since && d.time <= until)
            .cloned()
            .collect();

        debug!(asset, count = found.len(), "Paper deposit history");
        Ok(found)
    }
}

#[async_trait]
impl SpotAccountService for PaperExchange {
    async fn query_spot_balance(&self, asset: &str) -> Result<Option<Balance>> {
        let state = self.lock()?;
        Ok(state.spot.get(asset).map(|available| Balance {
            currency: asset.to_string(),
            available: *available,
            locked: Decimal::ZERO,
        }))
    }
}

#[async_trait]
impl MarginTransferService for PaperExchange {
    async fn transfer_margin_account_asset(
        &self,
        asset: &str,
        amount: Decimal,
        direction: TransferDirection,
    ) -> Result<()> {
        if amount <= Decimal::ZERO {
            bail!("Transfer amount must be positive, got {amount}");
        }

        let mut state = self.lock()?;
        let PaperState { spot, margin, transfers, .. } = &mut *state;
        let (from, to) = match direction {
            TransferDirection::In => (spot, margin),
            TransferDirection::Out => (margin, spot),
        };

        let available = from.get(asset).copied().unwrap_or_default();
        if available < amount {
            bail!("Insufficient {asset} balance: need {amount}, have {available}");
        }

        *from.entry(asset.to_string()).or_default() -= amount;
        *to.entry(asset.to_string()).or_default() += amount;
        transfers.push(PaperTransfer {
            asset: asset.to_string(),
            amount,
            direction,
            at: Utc::now(),
        });

        info!(asset, %amount, %direction, "Paper margin transfer");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
