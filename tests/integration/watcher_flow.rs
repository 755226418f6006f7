use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use margin_sweep::engine::watcher::{DepositWatcher, WatcherSettings};
use margin_sweep::notify::Notification;
use margin_sweep::retry::RetryPolicy;
use margin_sweep::types::{DepositStatus, SweepError, TransferDirection};

use crate::mock_exchange::{confirming, deposit, MockExchange, RecordedTransfer, RecordingNotifier};

fn settings(assets: &[&str]) -> WatcherSettings {
    WatcherSettings {
        assets: assets.iter().map(|a| a.to_string()).collect(),
        interval: Duration::from_secs(300),
        settle_delay: Duration::ZERO,
        requeue_on_balance_failure: false,
        retry: RetryPolicy::no_retry(),
    }
}

fn watcher(
    exchange: &Arc<MockExchange>,
    settings: WatcherSettings,
) -> (DepositWatcher, Arc<RecordingNotifier>) {
    let notifier = RecordingNotifier::new();
    let watcher = DepositWatcher::new(&exchange.session(), settings, notifier.clone()).unwrap();
    (watcher, notifier)
}

#[tokio::test(start_paused = true)]
async fn usdt_pending_deposit_is_transferred_once_confirmed() {
    let exchange = MockExchange::new();
    exchange.set_balance("USDT", dec!(150));
    let (watcher, notifier) = watcher(&exchange, settings(&["USDT"]));
    let cancel = CancellationToken::new();

    let now = Utc::now();
    let at = now - ChronoDuration::minutes(10);

    exchange.set_history(vec![confirming(
        "USDT", "tx1", DepositStatus::Pending, dec!(100), "3/16", 16, at,
    )]);
    let first = watcher.check_deposits_at(now, &cancel).await.unwrap();
    assert_eq!(first.transfers(), 0);
    assert_eq!(watcher.tracked("USDT").await.len(), 1);
    assert!(exchange.transfers().is_empty());

    exchange.set_history(vec![confirming(
        "USDT", "tx1", DepositStatus::Success, dec!(100), "16/16", 16, at,
    )]);
    let second = watcher
        .check_deposits_at(now + ChronoDuration::minutes(5), &cancel)
        .await
        .unwrap();
    assert_eq!(second.transfers(), 1);
    assert_eq!(
        exchange.transfers(),
        vec![RecordedTransfer {
            asset: "USDT".into(),
            amount: dec!(100),
            direction: TransferDirection::In,
        }]
    );
    assert!(watcher.tracked("USDT").await.is_empty());
    assert!(matches!(
        notifier.sent().as_slice(),
        [Notification::TransferInitiated { transfer_amount, .. }] if *transfer_amount == dec!(100)
    ));

    // the overlapping window keeps reporting tx1
    let third = watcher
        .check_deposits_at(now + ChronoDuration::minutes(10), &cancel)
        .await
        .unwrap();
    assert_eq!(third.transfers(), 0);
    assert_eq!(exchange.transfers().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn btc_success_seen_on_first_scan_is_never_watched() {
    let exchange = MockExchange::new();
    exchange.set_balance("BTC", dec!(5));
    let (watcher, _) = watcher(&exchange, settings(&["BTC"]));
    let cancel = CancellationToken::new();
    let now = Utc::now();

    exchange.set_history(vec![deposit(
        "BTC",
        "tx2",
        DepositStatus::Success,
        dec!(1),
        now - ChronoDuration::minutes(30),
    )]);

    for minutes in [0, 5, 10] {
        let report = watcher
            .check_deposits_at(now + ChronoDuration::minutes(minutes), &cancel)
            .await
            .unwrap();
        assert_eq!(report.transfers(), 0);
    }

    assert!(watcher.tracked("BTC").await.is_empty());
    assert!(exchange.transfers().is_empty());
    assert_eq!(exchange.balance_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn new_success_after_first_scan_is_transferred() {
    let exchange = MockExchange::new();
    exchange.set_balance("USDT", dec!(1000));
    let (watcher, _) = watcher(&exchange, settings(&["USDT"]));
    let cancel = CancellationToken::new();
    let now = Utc::now();

    let old = deposit("USDT", "old", DepositStatus::Success, dec!(10), now - ChronoDuration::hours(2));
    exchange.set_history(vec![old.clone()]);
    watcher.check_deposits_at(now, &cancel).await.unwrap();

    let fresh = deposit("USDT", "fresh", DepositStatus::Success, dec!(25), now + ChronoDuration::minutes(1));
    // exchange returns newest first
    exchange.set_history(vec![fresh, old]);

    let later = now + ChronoDuration::minutes(5);
    let report = watcher.check_deposits_at(later, &cancel).await.unwrap();
    assert_eq!(report.transfers(), 1);

    // identical window again: no duplicate
    let again = watcher.check_deposits_at(later, &cancel).await.unwrap();
    assert_eq!(again.transfers(), 0);

    assert_eq!(exchange.transfers().len(), 1);
    assert_eq!(exchange.transfers()[0].amount, dec!(25));
}

#[tokio::test(start_paused = true)]
async fn history_failure_skips_only_that_asset() {
    let exchange = MockExchange::new();
    exchange.set_balance("BTC", dec!(2));
    exchange.fail_history_for("USDT");
    let (watcher, _) = watcher(&exchange, settings(&["USDT", "BTC"]));
    let cancel = CancellationToken::new();
    let now = Utc::now();
    let at = now - ChronoDuration::minutes(3);

    exchange.set_history(vec![deposit("BTC", "b1", DepositStatus::Pending, dec!(0.5), at)]);
    let first = watcher.check_deposits_at(now, &cancel).await.unwrap();
    assert!(first.outcome("USDT").unwrap().scan_error.is_some());
    assert_eq!(first.outcome("BTC").unwrap().reconcile.added, 1);

    exchange.set_history(vec![deposit("BTC", "b1", DepositStatus::Success, dec!(0.5), at)]);
    let second = watcher.check_deposits_at(now, &cancel).await.unwrap();
    assert!(!second.cancelled);
    assert!(second.outcome("USDT").unwrap().scan_error.is_some());
    assert_eq!(second.transfers(), 1);
    assert_eq!(exchange.transfers()[0].asset, "BTC");
}

#[tokio::test(start_paused = true)]
async fn empty_balance_sends_insufficient_notice() {
    let exchange = MockExchange::new();
    exchange.set_balance("USDT", dec!(0));
    let (watcher, notifier) = watcher(&exchange, settings(&["USDT"]));
    let cancel = CancellationToken::new();
    let now = Utc::now();
    let at = now - ChronoDuration::minutes(1);

    exchange.set_history(vec![deposit("USDT", "tx", DepositStatus::Pending, dec!(100), at)]);
    watcher.check_deposits_at(now, &cancel).await.unwrap();
    exchange.set_history(vec![deposit("USDT", "tx", DepositStatus::Success, dec!(100), at)]);
    let report = watcher.check_deposits_at(now, &cancel).await.unwrap();

    assert_eq!(report.transfers(), 0);
    assert!(exchange.transfers().is_empty());
    assert!(matches!(
        notifier.sent().as_slice(),
        [Notification::InsufficientBalance { deposit_amount, .. }] if *deposit_amount == dec!(100)
    ));
}

#[tokio::test(start_paused = true)]
async fn balance_failure_requeues_when_enabled() {
    let exchange = MockExchange::new();
    exchange.set_balance("USDT", dec!(500));
    let mut s = settings(&["USDT"]);
    s.requeue_on_balance_failure = true;
    let (watcher, _) = watcher(&exchange, s);
    let cancel = CancellationToken::new();
    let now = Utc::now();
    let at = now - ChronoDuration::minutes(1);

    exchange.set_history(vec![deposit("USDT", "tx", DepositStatus::Pending, dec!(100), at)]);
    watcher.check_deposits_at(now, &cancel).await.unwrap();

    exchange.set_history(vec![deposit("USDT", "tx", DepositStatus::Success, dec!(100), at)]);
    exchange.set_balance_error(Some("spot account timeout"));
    let failed = watcher.check_deposits_at(now, &cancel).await.unwrap();
    assert_eq!(failed.transfers(), 0);
    assert_eq!(watcher.tracked("USDT").await.len(), 1);

    exchange.set_balance_error(None);
    let retried = watcher.check_deposits_at(now, &cancel).await.unwrap();
    assert_eq!(retried.transfers(), 1);
    assert_eq!(exchange.transfers().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn balance_failure_drops_deposit_by_default() {
    let exchange = MockExchange::new();
    exchange.set_balance("USDT", dec!(500));
    let (watcher, _) = watcher(&exchange, settings(&["USDT"]));
    let cancel = CancellationToken::new();
    let now = Utc::now();
    let at = now - ChronoDuration::minutes(1);

    exchange.set_history(vec![deposit("USDT", "tx", DepositStatus::Pending, dec!(100), at)]);
    watcher.check_deposits_at(now, &cancel).await.unwrap();

    exchange.set_history(vec![deposit("USDT", "tx", DepositStatus::Success, dec!(100), at)]);
    exchange.set_balance_error(Some("spot account timeout"));
    watcher.check_deposits_at(now, &cancel).await.unwrap();
    assert!(watcher.tracked("USDT").await.is_empty());

    exchange.set_balance_error(None);
    let report = watcher.check_deposits_at(now, &cancel).await.unwrap();
    assert_eq!(report.transfers(), 0);
    assert!(exchange.transfers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn transfer_failure_is_not_retried_next_poll() {
    let exchange = MockExchange::new();
    exchange.set_balance("USDT", dec!(500));
    exchange.set_transfer_error(Some("margin disabled"));
    let (watcher, notifier) = watcher(&exchange, settings(&["USDT"]));
    let cancel = CancellationToken::new();
    let now = Utc::now();
    let at = now - ChronoDuration::minutes(1);

    exchange.set_history(vec![deposit("USDT", "tx", DepositStatus::Pending, dec!(100), at)]);
    watcher.check_deposits_at(now, &cancel).await.unwrap();
    exchange.set_history(vec![deposit("USDT", "tx", DepositStatus::Success, dec!(100), at)]);

    let report = watcher.check_deposits_at(now, &cancel).await.unwrap();
    let transfer = report.outcome("USDT").unwrap().transfer.as_ref().unwrap();
    assert_eq!(transfer.failed.len(), 1);
    assert!(notifier.sent().iter().any(|n| n.is_failure()));

    exchange.set_transfer_error(None);
    let next = watcher.check_deposits_at(now, &cancel).await.unwrap();
    assert_eq!(next.transfers(), 0);
}

#[tokio::test(start_paused = true)]
async fn overlapping_polls_are_refused() {
    let exchange = MockExchange::new();
    exchange.set_history_delay(Duration::from_secs(10));
    let (watcher, _) = watcher(&exchange, settings(&["USDT"]));
    let watcher = Arc::new(watcher);
    let cancel = CancellationToken::new();

    let first = {
        let watcher = watcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { watcher.check_deposits(&cancel).await })
    };

    while exchange.history_calls() == 0 {
        tokio::task::yield_now().await;
    }

    let second = watcher.check_deposits(&cancel).await;
    assert!(matches!(second, Err(SweepError::PollInProgress)));

    assert!(first.await.unwrap().is_ok());
    assert!(watcher.check_deposits(&cancel).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_settle_delay_ends_poll() {
    let exchange = MockExchange::new();
    exchange.set_balance("USDT", dec!(500));
    let mut s = settings(&["USDT", "BTC"]);
    s.settle_delay = Duration::from_secs(60);
    let (watcher, _) = watcher(&exchange, s);
    let watcher = Arc::new(watcher);
    let cancel = CancellationToken::new();
    let now = Utc::now();
    let at = now - ChronoDuration::minutes(1);

    exchange.set_history(vec![deposit("USDT", "tx", DepositStatus::Pending, dec!(100), at)]);
    watcher.check_deposits_at(now, &cancel).await.unwrap();
    exchange.set_history(vec![deposit("USDT", "tx", DepositStatus::Success, dec!(100), at)]);
    let calls_before = exchange.history_calls();

    let poll = {
        let watcher = watcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { watcher.check_deposits_at(now, &cancel).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();

    let report = poll.await.unwrap().unwrap();
    assert!(report.cancelled);
    assert!(exchange.transfers().is_empty());
    // BTC was never scanned
    assert_eq!(exchange.history_calls(), calls_before + 1);
}

#[tokio::test(start_paused = true)]
async fn run_polls_immediately_then_on_interval() {
    let exchange = MockExchange::new();
    let (watcher, _) = watcher(&exchange, settings(&["USDT", "BTC"]));
    let watcher = Arc::new(watcher);
    let cancel = CancellationToken::new();

    let handle = {
        let watcher = watcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { watcher.run(cancel).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(exchange.history_calls(), 2);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(exchange.history_calls(), 4);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn missing_balance_entry_transfers_full_amount() {
    let exchange = MockExchange::new();
    let (watcher, _) = watcher(&exchange, settings(&["USDT"]));
    let cancel = CancellationToken::new();
    let now = Utc::now();
    let at = now - ChronoDuration::minutes(1);

    exchange.set_history(vec![deposit("USDT", "tx", DepositStatus::Pending, dec!(100), at)]);
    watcher.check_deposits_at(now, &cancel).await.unwrap();
    exchange.set_history(vec![deposit("USDT", "tx", DepositStatus::Success, dec!(100), at)]);
    let report = watcher.check_deposits_at(now, &cancel).await.unwrap();

    assert_eq!(report.transfers(), 1);
    assert_eq!(exchange.balance_calls(), 1);
    assert_eq!(exchange.transfers()[0].amount, dec!(100));
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_batch_keeps_completed_transfers() {
    let exchange = MockExchange::new();
    exchange.set_balance("USDT", dec!(1000));
    let (watcher, _) = watcher(&exchange, settings(&["USDT"]));
    let watcher = Arc::new(watcher);
    let cancel = CancellationToken::new();
    let now = Utc::now();
    let first_at = now - ChronoDuration::minutes(2);
    let second_at = now - ChronoDuration::minutes(1);

    exchange.set_history(vec![
        deposit("USDT", "a", DepositStatus::Pending, dec!(1), first_at),
        deposit("USDT", "b", DepositStatus::Pending, dec!(2), second_at),
    ]);
    watcher.check_deposits_at(now, &cancel).await.unwrap();
    exchange.set_history(vec![
        deposit("USDT", "a", DepositStatus::Success, dec!(1), first_at),
        deposit("USDT", "b", DepositStatus::Success, dec!(2), second_at),
    ]);

    let poll = {
        let watcher = watcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { watcher.check_deposits_at(now, &cancel).await })
    };

    // "b" is waiting on the balance query limiter
    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();

    let report = poll.await.unwrap().unwrap();
    assert!(report.cancelled);
    assert_eq!(report.transfers(), 1);
    assert_eq!(
        exchange.transfers(),
        vec![RecordedTransfer {
            asset: "USDT".into(),
            amount: dec!(1),
            direction: TransferDirection::In,
        }]
    );
}
