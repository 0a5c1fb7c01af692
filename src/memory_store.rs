use crate::errors::StoreError;
use crate::models::{
    BalanceHistory, CurrencyId, HistoryId, Page, Transaction, TransactionId, UserId, Wallet,
    WalletId, WalletKey,
};
use crate::storage::{LedgerStore, PendingWrite, TxHandle, UnitOfWork, WalletStore};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

type RowLock = tokio::sync::Mutex<()>;

#[derive(Default)]
struct Tables {
    wallets: BTreeMap<WalletId, Wallet>,
    wallet_index: HashMap<WalletKey, WalletId>,
    transactions: BTreeMap<TransactionId, Transaction>,
    hash_index: HashMap<String, TransactionId>,
    histories: BTreeMap<HistoryId, BalanceHistory>,
}

impl Tables {
    fn wallet(&self, key: &WalletKey) -> Option<&Wallet> {
        self.wallet_index
            .get(key)
            .and_then(|id| self.wallets.get(id))
    }

    /// Checks a whole write set against committed state before any of it is
    /// applied, so a commit is all or nothing.
    fn validate(&self, writes: &[PendingWrite]) -> Result<(), StoreError> {
        let mut new_wallets: HashMap<WalletKey, WalletId> = HashMap::new();
        let mut new_hashes: HashSet<&str> = HashSet::new();
        let mut new_transactions: HashSet<TransactionId> = HashSet::new();

        for write in writes {
            match write {
                PendingWrite::Wallet(wallet) => {
                    if let Some(existing) = self.wallets.get(&wallet.id) {
                        if existing.key() != wallet.key() {
                            return Err(StoreError::WalletNotFound);
                        }
                        continue;
                    }
                    let key = wallet.key();
                    let taken = self.wallet_index.get(&key).is_some_and(|id| *id != wallet.id)
                        || new_wallets.get(&key).is_some_and(|id| *id != wallet.id);
                    if taken {
                        return Err(StoreError::DuplicateWallet {
                            user_id: key.user_id,
                            currency_id: key.currency_id,
                        });
                    }
                    new_wallets.insert(key, wallet.id);
                }
                PendingWrite::Transaction(tx) => {
                    if self.hash_index.contains_key(&tx.hash) || !new_hashes.insert(&tx.hash) {
                        return Err(StoreError::DuplicateHash(tx.hash.clone()));
                    }
                    new_transactions.insert(tx.id);
                }
                PendingWrite::History(entry) => {
                    let wallet_known = self.wallets.contains_key(&entry.wallet_id)
                        || new_wallets.values().any(|id| *id == entry.wallet_id);
                    if !wallet_known {
                        return Err(StoreError::WalletNotFound);
                    }
                    let tx_known = self.transactions.contains_key(&entry.transaction_id)
                        || new_transactions.contains(&entry.transaction_id);
                    if !tx_known {
                        return Err(StoreError::TransactionNotFound);
                    }
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, write: PendingWrite) {
        match write {
            PendingWrite::Wallet(wallet) => {
                self.wallet_index.insert(wallet.key(), wallet.id);
                self.wallets.insert(wallet.id, wallet);
            }
            PendingWrite::Transaction(tx) => {
                self.hash_index.insert(tx.hash.clone(), tx.id);
                self.transactions.insert(tx.id, tx);
            }
            PendingWrite::History(entry) => {
                self.histories.insert(entry.id, entry);
            }
        }
    }
}

/// Transactional in-memory store with pessimistic row locks on wallets.
///
/// Every wallet row has its own async mutex. A `TxHandle` keeps the guards it
/// acquired until it commits, rolls back, or is dropped. Committed state sits
/// behind a plain mutex that is only held for short synchronous sections,
/// never across an await.
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<WalletKey, Arc<RowLock>>>,
    next_tx_id: AtomicU64,
    next_wallet_id: AtomicU64,
    next_transaction_id: AtomicU64,
    next_history_id: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            row_locks: Mutex::new(HashMap::new()),
            next_tx_id: AtomicU64::new(1),
            next_wallet_id: AtomicU64::new(1),
            next_transaction_id: AtomicU64::new(1),
            next_history_id: AtomicU64::new(1),
        }
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("table lock poisoned".to_string()))
    }

    fn row_lock(&self, key: WalletKey) -> Result<Arc<RowLock>, StoreError> {
        let mut locks = self
            .row_locks
            .lock()
            .map_err(|_| StoreError::Unavailable("row lock table poisoned".to_string()))?;
        Ok(locks.entry(key).or_default().clone())
    }

    /// Drops the lock entry for a row nobody holds or waits on. Clones are
    /// only made under the table mutex, so a count of one is stable here.
    fn prune_row_lock(&self, key: &WalletKey) {
        if let Ok(mut locks) = self.row_locks.lock() {
            if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(key);
            }
        }
    }

    /// Number of wallet rows with a live lock entry.
    pub fn row_lock_count(&self) -> usize {
        self.row_locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    async fn lock_row(&self, key: WalletKey, handle: &mut TxHandle) -> Result<(), StoreError> {
        if handle.holds_lock(&key) {
            return Ok(());
        }
        let lock = self.row_lock(key)?;
        let guard = lock.lock_owned().await;
        handle.hold_lock(key, guard);
        Ok(())
    }

    fn committed_wallet(&self, key: &WalletKey) -> Result<Option<Wallet>, StoreError> {
        Ok(self.tables()?.wallet(key).cloned())
    }

    fn hash_exists(&self, hash: &str) -> Result<bool, StoreError> {
        Ok(self.tables()?.hash_index.contains_key(hash))
    }

    fn commit_writes(&self, writes: Vec<PendingWrite>) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        tables.validate(&writes)?;
        for write in writes {
            tables.apply(write);
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UnitOfWork for InMemoryStore {
    async fn begin(&self) -> Result<TxHandle, StoreError> {
        Ok(TxHandle::new(self.next_tx_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn commit(&self, mut handle: TxHandle) -> Result<(), StoreError> {
        let writes = handle.take_writes();
        let staged = writes.len();
        let result = self.commit_writes(writes);
        match &result {
            Ok(()) => debug!(tx_id = handle.id(), writes = staged, "Transaction committed"),
            Err(e) => debug!(tx_id = handle.id(), error = %e, "Commit rejected"),
        }
        // Row locks go only after the new state is visible.
        drop(handle);
        result
    }

    async fn rollback(&self, mut handle: TxHandle) {
        let discarded = handle.take_writes().len();
        debug!(
            tx_id = handle.id(),
            discarded,
            locks = handle.locked_rows(),
            "Transaction rolled back"
        );
    }
}

#[async_trait]
impl WalletStore for InMemoryStore {
    async fn get_by_user(
        &self,
        user_id: UserId,
        currency_id: CurrencyId,
    ) -> Result<Wallet, StoreError> {
        self.committed_wallet(&WalletKey::new(user_id, currency_id))?
            .ok_or(StoreError::WalletNotFound)
    }

    async fn get_by_user_for_update(
        &self,
        user_id: UserId,
        currency_id: CurrencyId,
        tx: &mut TxHandle,
    ) -> Result<Wallet, StoreError> {
        let key = WalletKey::new(user_id, currency_id);
        let newly_locked = !tx.holds_lock(&key);
        self.lock_row(key, tx).await?;

        if let Some(wallet) = tx.staged_wallet(&key) {
            return Ok(wallet.clone());
        }
        match self.committed_wallet(&key)? {
            Some(wallet) => Ok(wallet),
            None => {
                // Nothing to protect; don't keep other writers waiting on a phantom row.
                if newly_locked {
                    tx.release_lock(&key);
                    self.prune_row_lock(&key);
                }
                Err(StoreError::WalletNotFound)
            }
        }
    }

    async fn create(
        &self,
        mut wallet: Wallet,
        tx: Option<&mut TxHandle>,
    ) -> Result<Wallet, StoreError> {
        wallet.id = self.next_wallet_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        wallet.created_at = now;
        wallet.updated_at = now;

        let key = wallet.key();
        let duplicate = StoreError::DuplicateWallet {
            user_id: key.user_id,
            currency_id: key.currency_id,
        };
        match tx {
            Some(handle) => {
                if self.committed_wallet(&key)?.is_some() || handle.staged_wallet(&key).is_some() {
                    return Err(duplicate);
                }
                handle.stage(PendingWrite::Wallet(wallet.clone()));
            }
            None => self.commit_writes(vec![PendingWrite::Wallet(wallet.clone())])?,
        }
        Ok(wallet)
    }

    async fn update(&self, wallet: &Wallet, tx: Option<&mut TxHandle>) -> Result<(), StoreError> {
        let mut wallet = wallet.clone();
        wallet.updated_at = Utc::now();
        let key = wallet.key();

        match tx {
            Some(handle) => {
                let newly_locked = !handle.holds_lock(&key);
                self.lock_row(key, handle).await?;
                let known_id = match handle.staged_wallet(&key) {
                    Some(staged) => Some(staged.id),
                    None => self.committed_wallet(&key)?.map(|w| w.id),
                };
                if known_id != Some(wallet.id) {
                    if newly_locked && known_id.is_none() {
                        handle.release_lock(&key);
                        self.prune_row_lock(&key);
                    }
                    return Err(StoreError::WalletNotFound);
                }
                handle.stage(PendingWrite::Wallet(wallet));
            }
            None => {
                // Implicit single-statement transaction.
                let lock = self.row_lock(key)?;
                let guard = lock.lock().await;
                let known_id = self.committed_wallet(&key)?.map(|w| w.id);
                if known_id != Some(wallet.id) {
                    drop(guard);
                    drop(lock);
                    if known_id.is_none() {
                        self.prune_row_lock(&key);
                    }
                    return Err(StoreError::WalletNotFound);
                }
                self.commit_writes(vec![PendingWrite::Wallet(wallet)])?;
            }
        }
        Ok(())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Wallet>, StoreError> {
        let tables = self.tables()?;
        Ok(tables
            .wallets
            .values()
            .filter(|w| w.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<Wallet>, StoreError> {
        Ok(self.tables()?.wallets.values().cloned().collect())
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn create_transaction(
        &self,
        mut transaction: Transaction,
        tx: Option<&mut TxHandle>,
    ) -> Result<Transaction, StoreError> {
        transaction.id = self.next_transaction_id.fetch_add(1, Ordering::SeqCst);
        match tx {
            Some(handle) => {
                if self.hash_exists(&transaction.hash)? {
                    return Err(StoreError::DuplicateHash(transaction.hash));
                }
                handle.stage(PendingWrite::Transaction(transaction.clone()));
            }
            None => self.commit_writes(vec![PendingWrite::Transaction(transaction.clone())])?,
        }
        Ok(transaction)
    }

    async fn create_balance_history(
        &self,
        mut entry: BalanceHistory,
        tx: Option<&mut TxHandle>,
    ) -> Result<BalanceHistory, StoreError> {
        entry.id = self.next_history_id.fetch_add(1, Ordering::SeqCst);
        match tx {
            Some(handle) => handle.stage(PendingWrite::History(entry.clone())),
            None => self.commit_writes(vec![PendingWrite::History(entry.clone())])?,
        }
        Ok(entry)
    }

    async fn find_by_hash(&self, hash: &str) -> Result<Transaction, StoreError> {
        let tables = self.tables()?;
        let found = tables
            .hash_index
            .get(hash)
            .and_then(|id| tables.transactions.get(id))
            .cloned();
        found.ok_or(StoreError::TransactionNotFound)
    }

    async fn list_by_user(
        &self,
        user_id: UserId,
        page: Option<Page>,
    ) -> Result<Vec<Transaction>, StoreError> {
        let mut matching: Vec<Transaction> = {
            let tables = self.tables()?;
            tables
                .transactions
                .values()
                .filter(|tx| tx.involves(user_id))
                .cloned()
                .collect()
        };
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        Ok(match page {
            Some(page) => matching
                .into_iter()
                .skip(page.offset)
                .take(page.limit)
                .collect(),
            None => matching,
        })
    }

    async fn count_by_user(&self, user_id: UserId) -> Result<u64, StoreError> {
        let tables = self.tables()?;
        Ok(tables
            .transactions
            .values()
            .filter(|tx| tx.involves(user_id))
            .count() as u64)
    }

    async fn history_by_user(&self, user_id: UserId) -> Result<Vec<BalanceHistory>, StoreError> {
        let tables = self.tables()?;
        Ok(tables
            .histories
            .values()
            .rev()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn history_by_wallet(
        &self,
        wallet_id: WalletId,
    ) -> Result<Vec<BalanceHistory>, StoreError> {
        let tables = self.tables()?;
        Ok(tables
            .histories
            .values()
            .rev()
            .filter(|entry| entry.wallet_id == wallet_id)
            .cloned()
            .collect())
    }
}
