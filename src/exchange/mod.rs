//! Exchange integrations.
//!
//! Defines the collaborator traits the sweeper needs from an exchange
//! session and provides:
//! - `PaperExchange`: in-memory exchange seeded from a JSON fixture

pub mod paper;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::types::{Balance, Deposit, SweepError, TransferDirection};

/// Deposit history lookup.
///
/// Records may come back in any order and overlapping windows may return
/// the same deposit again.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DepositHistoryService: Send + Sync {
    async fn query_deposit_history(
        &self,
        asset: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Deposit>>;
}

/// Spot (holding) account lookup.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpotAccountService: Send + Sync {
    /// Balance of `asset` in the spot account, `None` if the account holds
    /// no entry for it.
    async fn query_spot_balance(&self, asset: &str) -> Result<Option<Balance>>;
}

/// Spot <-> margin account transfers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarginTransferService: Send + Sync {
    async fn transfer_margin_account_asset(
        &self,
        asset: &str,
        amount: Decimal,
        direction: TransferDirection,
    ) -> Result<()>;
}

/// The capabilities one exchange connection offers.
///
/// An exchange that cannot do something leaves that slot empty.
#[derive(Clone)]
pub struct ExchangeSession {
    pub name: String,
    pub history: Option<Arc<dyn DepositHistoryService>>,
    pub spot_account: Option<Arc<dyn SpotAccountService>>,
    pub margin_transfer: Option<Arc<dyn MarginTransferService>>,
}

impl ExchangeSession {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            history: None,
            spot_account: None,
            margin_transfer: None,
        }
    }

    /// Session backed by one client that implements every capability.
    pub fn from_client<C>(name: impl Into<String>, client: Arc<C>) -> Self
    where
        C: DepositHistoryService + SpotAccountService + MarginTransferService + 'static,
    {
        let history: Arc<dyn DepositHistoryService> = client.clone();
        let spot_account: Arc<dyn SpotAccountService> = client.clone();
        let margin_transfer: Arc<dyn MarginTransferService> = client;
        Self {
            name: name.into(),
            history: Some(history),
            spot_account: Some(spot_account),
            margin_transfer: Some(margin_transfer),
        }
    }

    pub fn with_history(mut self, service: Arc<dyn DepositHistoryService>) -> Self {
        self.history = Some(service);
        self
    }

    pub fn with_spot_account(mut self, service: Arc<dyn SpotAccountService>) -> Self {
        self.spot_account = Some(service);
        self
    }

    pub fn with_margin_transfer(mut self, service: Arc<dyn MarginTransferService>) -> Self {
        self.margin_transfer = Some(service);
        self
    }

    pub fn require_history(&self) -> Result<Arc<dyn DepositHistoryService>, SweepError> {
        self.history.clone().ok_or_else(|| SweepError::UnsupportedCapability {
            exchange: self.name.clone(),
            capability: "deposit history query",
        })
    }

    pub fn require_margin_transfer(&self) -> Result<Arc<dyn MarginTransferService>, SweepError> {
        self.margin_transfer
            .clone()
            .ok_or_else(|| SweepError::UnsupportedCapability {
                exchange: self.name.clone(),
                capability: "margin transfer",
            })
    }
}

impl std::fmt::Debug for ExchangeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeSession")
            .field("name", &self.name)
            .field("history", &self.history.is_some())
            .field("spot_account", &self.spot_account.is_some())
            .field("margin_transfer", &self.margin_transfer.is_some())
            .finish()
    }
}
