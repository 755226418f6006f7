//! Operator notifications.
//!
//! The executor reports insufficient balances, transfer starts, and
//! failures through a `Notifier`. `TracingNotifier` only logs;
//! `TelegramNotifier` also pushes the message to a Telegram chat.
//! Delivery problems are logged and never propagated.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::retry::RetryPolicy;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Something an operator should hear about.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A released deposit could not be moved because the spot balance is empty.
    InsufficientBalance {
        asset: String,
        transaction_id: String,
        deposit_amount: Decimal,
        available: Decimal,
        currency: String,
    },
    /// A margin transfer is about to be issued.
    TransferInitiated {
        asset: String,
        transaction_id: String,
        deposit_amount: Decimal,
        transfer_amount: Decimal,
    },
    TransferFailed {
        asset: String,
        transaction_id: String,
        amount: Decimal,
        error: String,
    },
    BalanceQueryFailed {
        asset: String,
        transaction_id: String,
        deposit_amount: Decimal,
        error: String,
    },
}

impl Notification {
    pub fn asset(&self) -> &str {
        match self {
            Notification::InsufficientBalance { asset, .. }
            | Notification::TransferInitiated { asset, .. }
            | Notification::TransferFailed { asset, .. }
            | Notification::BalanceQueryFailed { asset, .. } => asset,
        }
    }

    pub fn transaction_id(&self) -> &str {
        match self {
            Notification::InsufficientBalance { transaction_id, .. }
            | Notification::TransferInitiated { transaction_id, .. }
            | Notification::TransferFailed { transaction_id, .. }
            | Notification::BalanceQueryFailed { transaction_id, .. } => transaction_id,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Notification::TransferFailed { .. } | Notification::BalanceQueryFailed { .. }
        )
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::InsufficientBalance {
                asset,
                transaction_id,
                deposit_amount,
                available,
                currency,
            } => write!(
                f,
                "Found succeeded deposit {deposit_amount} {asset} ({transaction_id}), but the balance \
                 {available} {currency} is insufficient, skip transferring"
            ),
            Notification::TransferInitiated {
                asset,
                transaction_id,
                deposit_amount,
                transfer_amount,
            } => write!(
                f,
                "Found succeeded deposit {deposit_amount} {asset} ({transaction_id}), transferring \
                 {transfer_amount} {asset} into the margin account"
            ),
            Notification::TransferFailed {
                asset,
                transaction_id,
                amount,
                error,
            } => write!(
                f,
                "Failed to transfer {amount} {asset} ({transaction_id}) into the margin account: {error}"
            ),
            Notification::BalanceQueryFailed {
                asset,
                transaction_id,
                deposit_amount,
                error,
            } => write!(
                f,
                "Unable to query {asset} spot balance for deposit {deposit_amount} {asset} ({transaction_id}): {error}"
            ),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification);
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: &Notification) {
        if notification.is_failure() {
            warn!(
                asset = notification.asset(),
                txid = notification.transaction_id(),
                "{notification}"
            );
        } else {
            info!(
                asset = notification.asset(),
                txid = notification.transaction_id(),
                "{notification}"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Telegram
// ---------------------------------------------------------------------------

pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    bot_token: SecretString,
    chat_id: String,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl TelegramNotifier {
    pub fn new(
        bot_token: SecretString,
        chat_id: String,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build Telegram HTTP client")?;

        Ok(Self {
            client,
            api_base: TELEGRAM_API_BASE.to_string(),
            bot_token,
            chat_id,
            retry: RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_secs(2),
                max_backoff: Duration::from_secs(8),
            },
            cancel,
        })
    }

    /// Point the client at a different API host (local bot API server).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn send_url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.bot_token.expose_secret()
        )
    }

    async fn send_message(&self, text: &str) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(self.send_url())
            .json(&json!({
                "chat_id": self.chat_id,
                "text": text,
                "disable_web_page_preview": true,
            }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Telegram API error {status}: {body}");
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, notification: &Notification) {
        TracingNotifier.notify(notification).await;

        let text = notification.to_string();
        if let Err(e) = self
            .retry
            .run("telegram send", &self.cancel, || self.send_message(&text))
            .await
        {
            warn!(error = %e, "Failed to deliver Telegram notification");
        }
    }
}
