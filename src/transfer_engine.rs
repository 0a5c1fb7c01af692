use crate::config::EngineConfig;
use crate::errors::{StoreError, TransferError};
use crate::memory_store::InMemoryStore;
use crate::models::{
    Amount, BalanceHistory, ChangeType, CurrencyId, Page, Transaction, TransferCompleted,
    TransferRequest, UserId, Wallet, WalletId,
};
use crate::notifier::{NoopNotifier, Notifier};
use crate::storage::{LedgerStore, TxHandle, UnitOfWork, WalletStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle of a single transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Validating,
    LockingWallets,
    Mutating,
    Persisting,
    Committed,
    Rejected,
    RolledBack,
}

/// Moves value between wallets of the same currency.
///
/// The engine keeps no mutable state of its own. All mutual exclusion comes
/// from the wallet store's row locks, taken inside each call's own
/// transaction, so clones can be shared freely across tasks.
#[derive(Clone)]
pub struct TransferEngine {
    unit_of_work: Arc<dyn UnitOfWork>,
    wallets: Arc<dyn WalletStore>,
    ledger: Arc<dyn LedgerStore>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
}

impl TransferEngine {
    pub fn new(
        unit_of_work: Arc<dyn UnitOfWork>,
        wallets: Arc<dyn WalletStore>,
        ledger: Arc<dyn LedgerStore>,
    ) -> Self {
        Self {
            unit_of_work,
            wallets,
            ledger,
            notifier: Arc::new(NoopNotifier),
            config: EngineConfig::default(),
        }
    }

    /// Engine backed by a single in-memory store for all three roles.
    pub fn in_memory(store: Arc<InMemoryStore>) -> Self {
        Self::new(store.clone(), store.clone(), store)
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Atomically move `amount` from one user's wallet to another's.
    ///
    /// Honors `transfer_timeout_ms` from the config when set.
    pub async fn transfer(
        &self,
        from_user_id: UserId,
        to_user_id: UserId,
        currency_id: CurrencyId,
        amount: Amount,
    ) -> Result<Transaction, TransferError> {
        let request = TransferRequest {
            from_user_id,
            to_user_id,
            currency_id,
            amount,
        };
        self.execute(&request, self.config.transfer_timeout()).await
    }

    pub async fn transfer_request(
        &self,
        request: &TransferRequest,
    ) -> Result<Transaction, TransferError> {
        self.execute(request, self.config.transfer_timeout()).await
    }

    /// Like `transfer`, but gives up with `DeadlineExceeded` if the wallets
    /// can't be locked and the ledger rows staged within `deadline`. Nothing
    /// is applied in that case. Commit itself is never interrupted.
    pub async fn transfer_with_deadline(
        &self,
        request: &TransferRequest,
        deadline: Duration,
    ) -> Result<Transaction, TransferError> {
        self.execute(request, Some(deadline)).await
    }

    async fn execute(
        &self,
        request: &TransferRequest,
        deadline: Option<Duration>,
    ) -> Result<Transaction, TransferError> {
        if let Err(e) = Self::validate(request) {
            debug!(
                state = ?TransferState::Rejected,
                from_user_id = request.from_user_id,
                to_user_id = request.to_user_id,
                error = %e,
                "Transfer rejected"
            );
            return Err(e);
        }

        let prepared = match deadline {
            Some(limit) => match tokio::time::timeout(limit, self.prepare(request)).await {
                Ok(result) => result,
                Err(_) => {
                    // The timed-out future owned the handle; dropping it rolled back.
                    warn!(
                        state = ?TransferState::RolledBack,
                        from_user_id = request.from_user_id,
                        to_user_id = request.to_user_id,
                        deadline_ms = limit.as_millis() as u64,
                        "Transfer deadline exceeded"
                    );
                    return Err(TransferError::DeadlineExceeded);
                }
            },
            None => self.prepare(request).await,
        };
        let (handle, transaction) = prepared?;

        if let Err(e) = self.unit_of_work.commit(handle).await {
            warn!(
                state = ?TransferState::RolledBack,
                from_user_id = request.from_user_id,
                to_user_id = request.to_user_id,
                error = %e,
                "Transfer commit failed"
            );
            return Err(TransferError::Persistence(e));
        }

        info!(
            state = ?TransferState::Committed,
            hash = %transaction.hash,
            from_user_id = transaction.from_user_id,
            to_user_id = transaction.to_user_id,
            currency_id = transaction.currency_id,
            amount = %transaction.amount,
            "Transfer committed"
        );

        self.publish(&transaction).await;
        Ok(transaction)
    }

    fn validate(request: &TransferRequest) -> Result<(), TransferError> {
        if request.from_user_id == request.to_user_id {
            return Err(TransferError::SameAccountTransfer);
        }
        if !request.amount.is_positive() {
            return Err(TransferError::InvalidAmount);
        }
        Ok(())
    }

    /// Opens the transaction and stages every write. On failure the handle is
    /// rolled back before the error is returned.
    async fn prepare(
        &self,
        request: &TransferRequest,
    ) -> Result<(TxHandle, Transaction), TransferError> {
        let mut handle = self.unit_of_work.begin().await?;

        match self.stage(request, &mut handle).await {
            Ok(transaction) => Ok((handle, transaction)),
            Err(e) => {
                debug!(
                    state = ?TransferState::RolledBack,
                    tx_id = handle.id(),
                    error = %e,
                    "Rolling back transfer"
                );
                self.unit_of_work.rollback(handle).await;
                Err(e)
            }
        }
    }

    async fn stage(
        &self,
        request: &TransferRequest,
        handle: &mut TxHandle,
    ) -> Result<Transaction, TransferError> {
        let TransferRequest {
            from_user_id,
            to_user_id,
            currency_id,
            amount,
        } = *request;

        debug!(state = ?TransferState::LockingWallets, tx_id = handle.id(), "Locking wallets");
        // Always lock the lower user id first so A->B and B->A can't deadlock.
        let (first, second) = if from_user_id < to_user_id {
            (from_user_id, to_user_id)
        } else {
            (to_user_id, from_user_id)
        };
        let first_wallet = self.lock_wallet(first, currency_id, handle).await?;
        let second_wallet = self.lock_wallet(second, currency_id, handle).await?;
        let (mut source, mut destination) = if first == from_user_id {
            (first_wallet, second_wallet)
        } else {
            (second_wallet, first_wallet)
        };

        debug!(state = ?TransferState::Mutating, tx_id = handle.id(), "Applying balances");
        // Checked against the locked row, not any earlier unlocked read.
        if source.balance.less_than(&amount) {
            return Err(TransferError::InsufficientBalance {
                available: source.balance,
                requested: amount,
            });
        }
        let source_before = source.balance;
        let destination_before = destination.balance;
        source.balance = source
            .balance
            .checked_sub(amount)
            .ok_or(TransferError::BalanceOverflow)?;
        destination.balance = destination
            .balance
            .checked_add(amount)
            .ok_or(TransferError::BalanceOverflow)?;

        debug!(state = ?TransferState::Persisting, tx_id = handle.id(), "Writing ledger entries");
        self.wallets.update(&source, Some(&mut *handle)).await?;
        self.wallets.update(&destination, Some(&mut *handle)).await?;

        let transaction = Transaction::completed(
            from_user_id,
            to_user_id,
            currency_id,
            amount,
            Utc::now(),
        );
        let transaction = self
            .ledger
            .create_transaction(transaction, Some(&mut *handle))
            .await?;

        let debit = BalanceHistory::record(&source, &transaction, ChangeType::Debit, source_before);
        let credit = BalanceHistory::record(
            &destination,
            &transaction,
            ChangeType::Credit,
            destination_before,
        );
        self.ledger
            .create_balance_history(debit, Some(&mut *handle))
            .await?;
        self.ledger
            .create_balance_history(credit, Some(&mut *handle))
            .await?;

        Ok(transaction)
    }

    async fn lock_wallet(
        &self,
        user_id: UserId,
        currency_id: CurrencyId,
        handle: &mut TxHandle,
    ) -> Result<Wallet, TransferError> {
        self.wallets
            .get_by_user_for_update(user_id, currency_id, handle)
            .await
            .map_err(|e| wallet_error(e, user_id, currency_id))
    }

    async fn publish(&self, transaction: &Transaction) {
        let event = TransferCompleted::from(transaction);
        if let Err(e) = self.notifier.notify(&event).await {
            warn!(hash = %event.hash, error = %e, "Failed to publish transfer notification");
        }
    }

    /// Open the default-currency wallet for a newly provisioned user.
    pub async fn provision_wallet(
        &self,
        user_id: UserId,
        currency_id: Option<CurrencyId>,
    ) -> Result<Wallet, TransferError> {
        let currency_id = currency_id.unwrap_or(self.config.default_currency);
        self.open_wallet(user_id, currency_id, self.config.default_balance)
            .await
    }

    pub async fn open_wallet(
        &self,
        user_id: UserId,
        currency_id: CurrencyId,
        balance: Amount,
    ) -> Result<Wallet, TransferError> {
        if balance.is_negative() {
            return Err(TransferError::InvalidAmount);
        }
        let wallet = self
            .wallets
            .create(Wallet::new(user_id, currency_id, balance), None)
            .await?;
        debug!(
            wallet_id = wallet.id,
            user_id,
            currency_id,
            balance = %wallet.balance,
            "Wallet opened"
        );
        Ok(wallet)
    }

    pub async fn get_wallet(
        &self,
        user_id: UserId,
        currency_id: CurrencyId,
    ) -> Result<Wallet, TransferError> {
        self.wallets
            .get_by_user(user_id, currency_id)
            .await
            .map_err(|e| wallet_error(e, user_id, currency_id))
    }

    pub async fn wallets_for_user(&self, user_id: UserId) -> Result<Vec<Wallet>, TransferError> {
        Ok(self.wallets.list_for_user(user_id).await?)
    }

    // TODO: stream instead of collecting once wallets outgrow memory
    pub async fn all_wallets(&self) -> Result<Vec<Wallet>, TransferError> {
        Ok(self.wallets.list_all().await?)
    }

    /// Transactions the user sent or received, newest first, plus the total
    /// count regardless of paging. Without a page the first `page_size`
    /// entries are returned; a zero limit also means `page_size`.
    pub async fn get_transactions_for_user(
        &self,
        user_id: UserId,
        page: Option<Page>,
    ) -> Result<(Vec<Transaction>, u64), TransferError> {
        let page = self.clamp_page(page.unwrap_or(Page::new(0, self.config.page_size)));
        let transactions = self.ledger.list_by_user(user_id, Some(page)).await?;
        let total = self.ledger.count_by_user(user_id).await?;
        Ok((transactions, total))
    }

    fn clamp_page(&self, page: Page) -> Page {
        let max = self.config.max_page_size.max(1);
        let limit = match page.limit {
            0 => self.config.page_size,
            n => n,
        };
        Page::new(page.offset, limit.clamp(1, max))
    }

    pub async fn get_transaction_by_hash(&self, hash: &str) -> Result<Transaction, TransferError> {
        self.ledger.find_by_hash(hash).await.map_err(|e| match e {
            StoreError::TransactionNotFound => TransferError::TransactionNotFound,
            other => TransferError::Persistence(other),
        })
    }

    pub async fn balance_history_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<BalanceHistory>, TransferError> {
        Ok(self.ledger.history_by_user(user_id).await?)
    }

    pub async fn balance_history_for_wallet(
        &self,
        wallet_id: WalletId,
    ) -> Result<Vec<BalanceHistory>, TransferError> {
        Ok(self.ledger.history_by_wallet(wallet_id).await?)
    }
}

fn wallet_error(error: StoreError, user_id: UserId, currency_id: CurrencyId) -> TransferError {
    match error {
        StoreError::WalletNotFound => TransferError::WalletNotFound {
            user_id,
            currency_id,
        },
        other => TransferError::Persistence(other),
    }
}
