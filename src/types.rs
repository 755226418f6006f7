//! Shared types for the deposit sweeper.
//!
//! Deposit records as reported by an exchange, account balances, and the
//! crate-wide error type. Engine and exchange modules both depend on these,
//! so nothing here reaches back into either.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Deposit
// ---------------------------------------------------------------------------

/// Deposit status as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepositStatus {
    Pending,
    /// Credited to the account but not yet withdrawable.
    Credited,
    Success,
    Rejected,
    #[serde(rename = "canceled")]
    Cancelled,
}

impl DepositStatus {
    /// Rejected and cancelled deposits never lead to a transfer.
    pub fn is_terminal_failure(self) -> bool {
        matches!(self, DepositStatus::Rejected | DepositStatus::Cancelled)
    }
}

impl fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DepositStatus::Pending => "pending",
            DepositStatus::Credited => "credited",
            DepositStatus::Success => "success",
            DepositStatus::Rejected => "rejected",
            DepositStatus::Cancelled => "canceled",
        };
        write!(f, "{s}")
    }
}

/// A single inbound deposit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deposit {
    #[serde(default)]
    pub exchange: String,
    pub asset: String,
    pub amount: Decimal,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub address_tag: String,
    /// Unique per (exchange, asset).
    #[serde(rename = "transactionID")]
    pub transaction_id: String,
    pub status: DepositStatus,
    /// Confirmation progress, formatted "current/required", e.g. "7/16".
    #[serde(default)]
    pub confirmation: String,
    /// Confirmations required before the balance unlocks.
    #[serde(default)]
    pub unlock_confirm: u32,
    pub time: DateTime<Utc>,
}

impl Deposit {
    /// Parse the confirmation string into `(current, required)`.
    ///
    /// Missing or malformed data yields `(0, 0)`; each side is parsed
    /// on its own, so `"x/16"` gives `(0, 16)`. Whitespace is not
    /// stripped: `" 3/16"` gives `(0, 16)`.
    pub fn current_confirmation(&self) -> (u32, u32) {
        if self.confirmation.is_empty() {
            return (0, 0);
        }

        let mut parts = self.confirmation.split('/');
        let (Some(current), Some(required)) = (parts.next(), parts.next()) else {
            return (0, 0);
        };

        (
            current.parse().unwrap_or(0),
            required.parse().unwrap_or(0),
        )
    }

    pub fn object_id(&self) -> String {
        format!(
            "deposit-{}-{}-{}-{}",
            self.exchange, self.asset, self.address, self.transaction_id
        )
    }
}

impl fmt::Display for Deposit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} deposit {} {} <- ", self.exchange, self.asset, self.amount)?;

        if self.address_tag.is_empty() {
            write!(f, "{} at {}", self.address, self.time.to_rfc3339())?;
        } else {
            write!(
                f,
                "{} (tag: {}) at {}",
                self.address,
                self.address_tag,
                self.time.to_rfc3339()
            )?;
        }

        if !self.transaction_id.is_empty() {
            write!(f, " txID: {}", short_txid(&self.transaction_id))?;
        }

        write!(f, " status: {}", self.status)
    }
}

/// Shorten long transaction hashes to `head…tail` for log lines.
pub fn short_txid(txid: &str) -> String {
    let chars: Vec<char> = txid.chars().collect();
    if chars.len() <= 12 {
        return txid.to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// Balance of one currency in an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    pub available: Decimal,
    #[serde(default)]
    pub locked: Decimal,
}

/// Direction of a spot <-> margin transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    /// Spot -> margin.
    In,
    /// Margin -> spot.
    Out,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::In => write!(f, "IN"),
            TransferDirection::Out => write!(f, "OUT"),
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors surfaced by the sweeper core.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("Exchange session {exchange} does not support {capability}")]
    UnsupportedCapability {
        exchange: String,
        capability: &'static str,
    },

    #[error("{operation} failed after {attempts} attempts: {message}")]
    Transient {
        operation: String,
        attempts: u32,
        message: String,
    },

    #[error("Cancellation requested")]
    Cancelled,

    #[error("A deposit poll is already in progress")]
    PollInProgress,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SweepError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SweepError::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
