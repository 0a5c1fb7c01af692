use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wallet_ledger::errors::NotifierError;
use wallet_ledger::models::{
    BalanceHistory, CurrencyId, TransferCompleted, UserId, WalletId,
};
use wallet_ledger::notifier::{ChannelNotifier, EventLogNotifier, Notifier};
use wallet_ledger::storage::{LedgerStore, TxHandle};
use wallet_ledger::{
    Amount, ChangeType, EngineConfig, InMemoryStore, Page, StoreError, Transaction,
    TransactionStatus, TransferEngine, TransferError,
};

const USDT: CurrencyId = 1;
const BTC: CurrencyId = 2;

fn amount(value: Decimal) -> Amount {
    Amount::new(value)
}

async fn engine_with(wallets: &[(UserId, CurrencyId, Decimal)]) -> TransferEngine {
    let engine = TransferEngine::in_memory(Arc::new(InMemoryStore::new()));
    for (user, currency, balance) in wallets {
        engine
            .open_wallet(*user, *currency, amount(*balance))
            .await
            .unwrap();
    }
    engine
}

async fn balance(engine: &TransferEngine, user: UserId, currency: CurrencyId) -> Decimal {
    engine
        .get_wallet(user, currency)
        .await
        .unwrap()
        .balance
        .as_decimal()
}

async fn transaction_count(engine: &TransferEngine, user: UserId) -> u64 {
    engine.get_transactions_for_user(user, None).await.unwrap().1
}

// ============================================================================
// SUCCESSFUL TRANSFERS
// ============================================================================

#[tokio::test]
async fn test_transfer_moves_balance() {
    let engine = engine_with(&[(1, USDT, dec!(1000)), (2, USDT, dec!(0))]).await;

    let tx = engine.transfer(1, 2, USDT, amount(dec!(100))).await.unwrap();

    assert_eq!(balance(&engine, 1, USDT).await, dec!(900));
    assert_eq!(balance(&engine, 2, USDT).await, dec!(100));

    let (txs, total) = engine.get_transactions_for_user(1, None).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].status, TransactionStatus::Completed);
    assert_eq!(txs[0].status.as_str(), "completed");
    assert_eq!(txs[0], tx);
    assert_eq!(tx.from_user_id, 1);
    assert_eq!(tx.to_user_id, 2);
    assert_eq!(tx.currency_id, USDT);
}

#[tokio::test]
async fn test_transaction_hash_and_signature() {
    let engine = engine_with(&[(1, USDT, dec!(1000)), (2, USDT, dec!(0))]).await;

    let tx = engine.transfer(1, 2, USDT, amount(dec!(50))).await.unwrap();

    // SHA-256 hex digest
    assert_eq!(tx.hash.len(), 64);
    assert!(tx.hash.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(tx.signature.starts_with("SIG-1-2-50-"));

    let found = engine.get_transaction_by_hash(&tx.hash).await.unwrap();
    assert_eq!(found.id, tx.id);

    let missing = engine.get_transaction_by_hash("").await;
    assert_eq!(missing, Err(TransferError::TransactionNotFound));
}

#[tokio::test]
async fn test_balance_history_recorded() {
    let engine = engine_with(&[(1, USDT, dec!(1000)), (2, USDT, dec!(500))]).await;

    let tx = engine.transfer(1, 2, USDT, amount(dec!(200))).await.unwrap();

    let alice = engine.balance_history_for_user(1).await.unwrap();
    assert_eq!(alice.len(), 1);
    assert_eq!(alice[0].change_type, ChangeType::Debit);
    assert_eq!(alice[0].amount, amount(dec!(200)));
    assert_eq!(alice[0].balance_before, amount(dec!(1000)));
    assert_eq!(alice[0].balance_after, amount(dec!(800)));

    let bob = engine.balance_history_for_user(2).await.unwrap();
    assert_eq!(bob.len(), 1);
    assert_eq!(bob[0].change_type, ChangeType::Credit);
    assert_eq!(bob[0].amount, amount(dec!(200)));
    assert_eq!(bob[0].balance_before, amount(dec!(500)));
    assert_eq!(bob[0].balance_after, amount(dec!(700)));

    // Both sides point at the same transaction
    assert_eq!(alice[0].transaction_id, tx.id);
    assert_eq!(bob[0].transaction_id, tx.id);

    let alice_wallet = engine.get_wallet(1, USDT).await.unwrap();
    assert_eq!(alice[0].wallet_id, alice_wallet.id);
}

#[tokio::test]
async fn test_transfer_entire_balance() {
    let engine = engine_with(&[(1, USDT, dec!(250.5)), (2, USDT, dec!(0))]).await;

    engine.transfer(1, 2, USDT, amount(dec!(250.5))).await.unwrap();

    assert_eq!(balance(&engine, 1, USDT).await, Decimal::ZERO);
    assert_eq!(balance(&engine, 2, USDT).await, dec!(250.5));
}

#[tokio::test]
async fn test_fractional_amounts_are_exact() {
    let engine = engine_with(&[(1, USDT, dec!(1)), (2, USDT, dec!(0))]).await;

    engine.transfer(1, 2, USDT, amount(dec!(0.1))).await.unwrap();
    engine.transfer(1, 2, USDT, amount(dec!(0.2))).await.unwrap();

    assert_eq!(balance(&engine, 1, USDT).await, dec!(0.7));
    assert_eq!(balance(&engine, 2, USDT).await, dec!(0.3));
}

#[tokio::test]
async fn test_multiple_sequential_transfers() {
    let engine = engine_with(&[
        (1, USDT, dec!(1000)),
        (2, USDT, dec!(0)),
        (3, USDT, dec!(0)),
    ])
    .await;

    engine.transfer(1, 2, USDT, amount(dec!(300))).await.unwrap();
    engine.transfer(1, 3, USDT, amount(dec!(200))).await.unwrap();
    engine.transfer(2, 3, USDT, amount(dec!(100))).await.unwrap();

    assert_eq!(balance(&engine, 1, USDT).await, dec!(500));
    assert_eq!(balance(&engine, 2, USDT).await, dec!(200));
    assert_eq!(balance(&engine, 3, USDT).await, dec!(300));

    assert_eq!(transaction_count(&engine, 1).await, 2);
    assert_eq!(transaction_count(&engine, 2).await, 2);
    assert_eq!(transaction_count(&engine, 3).await, 2);
}

#[tokio::test]
async fn test_history_chain_per_wallet() {
    let engine = engine_with(&[(1, USDT, dec!(1000)), (2, USDT, dec!(0))]).await;

    for value in [dec!(100), dec!(250), dec!(75)] {
        engine.transfer(1, 2, USDT, amount(value)).await.unwrap();
    }
    engine.transfer(2, 1, USDT, amount(dec!(25))).await.unwrap();

    let wallet = engine.get_wallet(1, USDT).await.unwrap();
    let mut chain = engine.balance_history_for_wallet(wallet.id).await.unwrap();
    assert_eq!(chain.len(), 4);

    // Newest first; walk it oldest first
    chain.reverse();
    assert_eq!(chain[0].balance_before, amount(dec!(1000)));
    for pair in chain.windows(2) {
        assert_eq!(pair[1].balance_before, pair[0].balance_after);
    }
    assert_eq!(chain[3].change_type, ChangeType::Credit);
    assert_eq!(chain[3].balance_after, wallet.balance);
    assert_eq!(wallet.balance, amount(dec!(600)));
}

// ============================================================================
// REJECTED TRANSFERS
// ============================================================================

#[tokio::test]
async fn test_insufficient_balance_leaves_no_trace() {
    let engine = engine_with(&[(1, USDT, dec!(100)), (2, USDT, dec!(0))]).await;

    let result = engine.transfer(1, 2, USDT, amount(dec!(200))).await;

    assert_eq!(
        result,
        Err(TransferError::InsufficientBalance {
            available: amount(dec!(100)),
            requested: amount(dec!(200)),
        })
    );
    assert_eq!(balance(&engine, 1, USDT).await, dec!(100));
    assert_eq!(balance(&engine, 2, USDT).await, dec!(0));
    assert_eq!(transaction_count(&engine, 1).await, 0);
    assert!(engine.balance_history_for_user(1).await.unwrap().is_empty());
    assert!(engine.balance_history_for_user(2).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_same_account_transfer_rejected() {
    let engine = engine_with(&[(1, USDT, dec!(1000))]).await;

    for value in [dec!(100), dec!(0), dec!(-5), dec!(5000)] {
        let result = engine.transfer(1, 1, USDT, amount(value)).await;
        assert_eq!(result, Err(TransferError::SameAccountTransfer));
    }
    assert_eq!(balance(&engine, 1, USDT).await, dec!(1000));
    assert_eq!(transaction_count(&engine, 1).await, 0);
}

#[tokio::test]
async fn test_non_positive_amounts_rejected() {
    let engine = engine_with(&[(1, USDT, dec!(1000)), (2, USDT, dec!(0))]).await;

    let negative = engine.transfer(1, 2, USDT, amount(dec!(-50))).await;
    let zero = engine.transfer(1, 2, USDT, amount(dec!(0))).await;

    assert_eq!(negative, Err(TransferError::InvalidAmount));
    assert_eq!(zero, Err(TransferError::InvalidAmount));
    assert_eq!(balance(&engine, 1, USDT).await, dec!(1000));
    assert_eq!(transaction_count(&engine, 1).await, 0);
    assert!(engine.balance_history_for_user(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_source_wallet() {
    let engine = engine_with(&[(2, USDT, dec!(0))]).await;

    let result = engine.transfer(1, 2, USDT, amount(dec!(10))).await;

    assert_eq!(
        result,
        Err(TransferError::WalletNotFound {
            user_id: 1,
            currency_id: USDT
        })
    );
}

#[tokio::test]
async fn test_missing_destination_wallet() {
    let engine = engine_with(&[(1, USDT, dec!(100))]).await;

    let result = engine.transfer(1, 2, USDT, amount(dec!(10))).await;

    assert_eq!(
        result,
        Err(TransferError::WalletNotFound {
            user_id: 2,
            currency_id: USDT
        })
    );
    assert_eq!(balance(&engine, 1, USDT).await, dec!(100));
}

#[tokio::test]
async fn test_currency_mismatch_is_wallet_not_found() {
    // Both users only hold USDT; the request asks for BTC
    let engine = engine_with(&[(1, USDT, dec!(1000)), (2, USDT, dec!(0))]).await;

    let result = engine.transfer(1, 2, BTC, amount(dec!(10))).await;

    assert!(matches!(
        result,
        Err(TransferError::WalletNotFound {
            currency_id: BTC,
            ..
        })
    ));
    assert_eq!(balance(&engine, 1, USDT).await, dec!(1000));
}

#[tokio::test]
async fn test_wallets_in_other_currencies_untouched() {
    let engine = engine_with(&[
        (1, USDT, dec!(1000)),
        (1, BTC, dec!(2)),
        (2, USDT, dec!(0)),
        (2, BTC, dec!(0)),
    ])
    .await;

    engine.transfer(1, 2, BTC, amount(dec!(0.5))).await.unwrap();

    assert_eq!(balance(&engine, 1, BTC).await, dec!(1.5));
    assert_eq!(balance(&engine, 2, BTC).await, dec!(0.5));
    assert_eq!(balance(&engine, 1, USDT).await, dec!(1000));
    assert_eq!(engine.wallets_for_user(1).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_error_codes() {
    assert_eq!(TransferError::InvalidAmount.code(), "INVALID_AMOUNT");
    assert_eq!(TransferError::SameAccountTransfer.code(), "SAME_ACCOUNT_TRANSFER");
    assert_eq!(
        TransferError::WalletNotFound {
            user_id: 1,
            currency_id: 1
        }
        .code(),
        "WALLET_NOT_FOUND"
    );
    assert_eq!(
        TransferError::InsufficientBalance {
            available: Amount::ZERO,
            requested: Amount::from_int(1)
        }
        .code(),
        "INSUFFICIENT_BALANCE"
    );
    assert_eq!(TransferError::DeadlineExceeded.code(), "TRANSACTION_FAILED");
    assert_eq!(
        TransferError::Persistence(StoreError::Unavailable("down".into())).code(),
        "INTERNAL_ERROR"
    );
}

// ============================================================================
// PERSISTENCE FAILURE & ROLLBACK
// ============================================================================

/// Ledger that refuses audit rows, so the transfer fails after both wallets
/// were already staged.
struct FailingHistoryLedger {
    inner: Arc<InMemoryStore>,
}

#[async_trait]
impl LedgerStore for FailingHistoryLedger {
    async fn create_transaction(
        &self,
        transaction: Transaction,
        tx: Option<&mut TxHandle>,
    ) -> Result<Transaction, StoreError> {
        self.inner.create_transaction(transaction, tx).await
    }

    async fn create_balance_history(
        &self,
        _entry: BalanceHistory,
        _tx: Option<&mut TxHandle>,
    ) -> Result<BalanceHistory, StoreError> {
        Err(StoreError::Unavailable("history table offline".into()))
    }

    async fn find_by_hash(&self, hash: &str) -> Result<Transaction, StoreError> {
        self.inner.find_by_hash(hash).await
    }

    async fn list_by_user(
        &self,
        user_id: UserId,
        page: Option<Page>,
    ) -> Result<Vec<Transaction>, StoreError> {
        LedgerStore::list_by_user(self.inner.as_ref(), user_id, page).await
    }

    async fn count_by_user(&self, user_id: UserId) -> Result<u64, StoreError> {
        self.inner.count_by_user(user_id).await
    }

    async fn history_by_user(&self, user_id: UserId) -> Result<Vec<BalanceHistory>, StoreError> {
        self.inner.history_by_user(user_id).await
    }

    async fn history_by_wallet(
        &self,
        wallet_id: WalletId,
    ) -> Result<Vec<BalanceHistory>, StoreError> {
        self.inner.history_by_wallet(wallet_id).await
    }
}

#[tokio::test]
async fn test_persistence_failure_rolls_back_everything() {
    let store = Arc::new(InMemoryStore::new());
    let healthy = TransferEngine::in_memory(store.clone());
    healthy.open_wallet(1, USDT, amount(dec!(1000))).await.unwrap();
    healthy.open_wallet(2, USDT, amount(dec!(0))).await.unwrap();

    let broken = TransferEngine::new(
        store.clone(),
        store.clone(),
        Arc::new(FailingHistoryLedger {
            inner: store.clone(),
        }),
    );

    let result = broken.transfer(1, 2, USDT, amount(dec!(100))).await;
    assert_eq!(
        result,
        Err(TransferError::Persistence(StoreError::Unavailable(
            "history table offline".into()
        )))
    );

    assert_eq!(balance(&healthy, 1, USDT).await, dec!(1000));
    assert_eq!(balance(&healthy, 2, USDT).await, dec!(0));
    assert_eq!(transaction_count(&healthy, 1).await, 0);

    // Row locks were released by the rollback
    let retry = tokio::time::timeout(
        Duration::from_secs(5),
        healthy.transfer(1, 2, USDT, amount(dec!(100))),
    )
    .await
    .expect("row locks still held after rollback");
    assert!(retry.is_ok());
    assert_eq!(balance(&healthy, 1, USDT).await, dec!(900));
}

// ============================================================================
// QUERIES & PROVISIONING
// ============================================================================

#[tokio::test]
async fn test_transactions_paginated_newest_first() {
    let engine = engine_with(&[(1, USDT, dec!(1000)), (2, USDT, dec!(0))]).await;

    for value in 1..=5 {
        engine
            .transfer(1, 2, USDT, Amount::from_int(value))
            .await
            .unwrap();
    }

    let (first_page, total) = engine
        .get_transactions_for_user(2, Some(Page::new(0, 2)))
        .await
        .unwrap();
    assert_eq!(total, 5);
    assert_eq!(first_page.len(), 2);
    assert_eq!(first_page[0].amount, Amount::from_int(5));
    assert_eq!(first_page[1].amount, Amount::from_int(4));

    let (last_page, total) = engine
        .get_transactions_for_user(2, Some(Page::from_page_number(3, 2)))
        .await
        .unwrap();
    assert_eq!(total, 5);
    assert_eq!(last_page.len(), 1);
    assert_eq!(last_page[0].amount, Amount::from_int(1));

    let (beyond, _) = engine
        .get_transactions_for_user(2, Some(Page::new(10, 2)))
        .await
        .unwrap();
    assert!(beyond.is_empty());
}

#[tokio::test]
async fn test_unpaged_listing_uses_configured_page_size() {
    let engine = engine_with(&[(1, USDT, dec!(1000)), (2, USDT, dec!(0))]).await;

    for _ in 0..25 {
        engine.transfer(1, 2, USDT, amount(dec!(1))).await.unwrap();
    }

    let (txs, total) = engine.get_transactions_for_user(1, None).await.unwrap();
    assert_eq!(txs.len(), 20);
    assert_eq!(total, 25);

    // A zero limit falls back to the page size, an oversized one is capped
    let (zero, _) = engine
        .get_transactions_for_user(1, Some(Page::new(0, 0)))
        .await
        .unwrap();
    assert_eq!(zero.len(), 20);
    let (large, _) = engine
        .get_transactions_for_user(1, Some(Page::new(0, 500)))
        .await
        .unwrap();
    assert_eq!(large.len(), 25);

    let engine = engine.with_config(EngineConfig {
        page_size: 5,
        max_page_size: 10,
        ..EngineConfig::default()
    });
    let (small, total) = engine.get_transactions_for_user(2, None).await.unwrap();
    assert_eq!(small.len(), 5);
    assert_eq!(total, 25);
    let (capped, _) = engine
        .get_transactions_for_user(2, Some(Page::new(20, 50)))
        .await
        .unwrap();
    assert_eq!(capped.len(), 5);

    let (far, _) = engine
        .get_transactions_for_user(2, Some(Page::from_page_number(usize::MAX, 10)))
        .await
        .unwrap();
    assert!(far.is_empty());
}

#[tokio::test]
async fn test_provision_wallet_uses_defaults() {
    let engine = TransferEngine::in_memory(Arc::new(InMemoryStore::new()));

    let wallet = engine.provision_wallet(7, None).await.unwrap();
    assert_eq!(wallet.user_id, 7);
    assert_eq!(wallet.currency_id, engine.config().default_currency);
    assert_eq!(wallet.balance, amount(dec!(1000)));

    let duplicate = engine.provision_wallet(7, None).await;
    assert!(matches!(
        duplicate,
        Err(TransferError::Persistence(StoreError::DuplicateWallet {
            user_id: 7,
            ..
        }))
    ));

    let second_currency = engine.provision_wallet(7, Some(BTC)).await.unwrap();
    assert_eq!(second_currency.currency_id, BTC);
    assert_ne!(second_currency.id, wallet.id);
}

#[tokio::test]
async fn test_open_wallet_rejects_negative_balance() {
    let engine = TransferEngine::in_memory(Arc::new(InMemoryStore::new()));

    let result = engine.open_wallet(1, USDT, amount(dec!(-1))).await;

    assert_eq!(result, Err(TransferError::InvalidAmount));
    assert!(engine.get_wallet(1, USDT).await.is_err());
}

// ============================================================================
// NOTIFICATIONS
// ============================================================================

#[tokio::test]
async fn test_channel_notifier_receives_committed_transfer() {
    let (notifier, mut events) = ChannelNotifier::new(8);
    let engine = engine_with(&[(1, USDT, dec!(1000)), (2, USDT, dec!(0))])
        .await
        .with_notifier(Arc::new(notifier));

    let tx = engine.transfer(1, 2, USDT, amount(dec!(10))).await.unwrap();

    let event = events.try_recv().unwrap();
    assert_eq!(event.hash, tx.hash);
    assert_eq!(event.from_user_id, 1);
    assert_eq!(event.to_user_id, 2);
    assert_eq!(event.amount, amount(dec!(10)));

    // Rejected transfers publish nothing
    let _ = engine.transfer(1, 2, USDT, amount(dec!(5000))).await;
    assert!(events.try_recv().is_err());
}

struct BrokenNotifier;

#[async_trait]
impl Notifier for BrokenNotifier {
    async fn notify(&self, _event: &TransferCompleted) -> Result<(), NotifierError> {
        Err(NotifierError::ChannelClosed)
    }
}

#[tokio::test]
async fn test_notifier_failure_does_not_fail_transfer() {
    let engine = engine_with(&[(1, USDT, dec!(1000)), (2, USDT, dec!(0))])
        .await
        .with_notifier(Arc::new(BrokenNotifier));

    let result = engine.transfer(1, 2, USDT, amount(dec!(10))).await;

    assert!(result.is_ok());
    assert_eq!(balance(&engine, 2, USDT).await, dec!(10));
}

#[tokio::test]
async fn test_full_channel_does_not_block_transfers() {
    let (notifier, _events) = ChannelNotifier::new(1);
    let engine = engine_with(&[(1, USDT, dec!(1000)), (2, USDT, dec!(0))])
        .await
        .with_notifier(Arc::new(notifier));

    for _ in 0..3 {
        engine.transfer(1, 2, USDT, amount(dec!(1))).await.unwrap();
    }
    assert_eq!(balance(&engine, 2, USDT).await, dec!(3));
}

#[tokio::test]
async fn test_event_log_notifier_records_each_transfer() {
    let temp_dir = TempDir::new().unwrap();
    let log_path = temp_dir.path().join("events.jsonl");

    let notifier = Arc::new(EventLogNotifier::new(&log_path).await.unwrap());
    let engine = engine_with(&[(1, USDT, dec!(1000)), (2, USDT, dec!(0))])
        .await
        .with_notifier(notifier.clone());

    let first = engine.transfer(1, 2, USDT, amount(dec!(12.5))).await.unwrap();
    let second = engine.transfer(2, 1, USDT, amount(dec!(2.5))).await.unwrap();
    let _ = engine.transfer(1, 1, USDT, amount(dec!(1))).await;

    let events = notifier.replay().await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].hash, first.hash);
    assert_eq!(events[0].amount, amount(dec!(12.5)));
    assert_eq!(events[1].hash, second.hash);

    // Reopening appends rather than truncates
    let reopened = EventLogNotifier::new(&log_path).await.unwrap();
    assert_eq!(reopened.replay().await.unwrap().len(), 2);
}
