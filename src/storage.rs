use crate::errors::StoreError;
use crate::models::{
    BalanceHistory, CurrencyId, Page, Transaction, UserId, Wallet, WalletId, WalletKey,
};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::OwnedMutexGuard;

pub type TxId = u64;

/// A write staged inside an open transaction, applied on commit.
#[derive(Debug, Clone)]
pub enum PendingWrite {
    /// Insert when the id is new to the store, full-row update otherwise.
    Wallet(Wallet),
    Transaction(Transaction),
    History(BalanceHistory),
}

/// An open unit of work: the row locks it holds plus its staged writes.
///
/// Dropping a handle without committing is a rollback: staged writes are
/// discarded and every row lock is released.
pub struct TxHandle {
    id: TxId,
    row_locks: HashMap<WalletKey, OwnedMutexGuard<()>>,
    writes: Vec<PendingWrite>,
}

impl TxHandle {
    pub fn new(id: TxId) -> Self {
        Self {
            id,
            row_locks: HashMap::new(),
            writes: Vec::new(),
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn holds_lock(&self, key: &WalletKey) -> bool {
        self.row_locks.contains_key(key)
    }

    pub fn hold_lock(&mut self, key: WalletKey, guard: OwnedMutexGuard<()>) {
        self.row_locks.insert(key, guard);
    }

    pub fn release_lock(&mut self, key: &WalletKey) {
        self.row_locks.remove(key);
    }

    pub fn locked_rows(&self) -> usize {
        self.row_locks.len()
    }

    pub fn stage(&mut self, write: PendingWrite) {
        self.writes.push(write);
    }

    pub fn staged_writes(&self) -> &[PendingWrite] {
        &self.writes
    }

    pub fn take_writes(&mut self) -> Vec<PendingWrite> {
        std::mem::take(&mut self.writes)
    }

    /// Latest in-transaction version of a wallet, if this handle wrote it.
    pub fn staged_wallet(&self, key: &WalletKey) -> Option<&Wallet> {
        self.writes.iter().rev().find_map(|write| match write {
            PendingWrite::Wallet(wallet) if wallet.key() == *key => Some(wallet),
            _ => None,
        })
    }
}

impl Drop for TxHandle {
    fn drop(&mut self) {
        if !self.writes.is_empty() {
            tracing::debug!(
                tx_id = self.id,
                discarded = self.writes.len(),
                "Transaction dropped without commit, rolling back"
            );
        }
    }
}

#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn begin(&self) -> Result<TxHandle, StoreError>;
    async fn commit(&self, handle: TxHandle) -> Result<(), StoreError>;
    async fn rollback(&self, handle: TxHandle);
}

#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Plain read of committed state, no lock.
    async fn get_by_user(
        &self,
        user_id: UserId,
        currency_id: CurrencyId,
    ) -> Result<Wallet, StoreError>;

    /// Takes the row's exclusive lock for the lifetime of `tx`, waiting for
    /// any other holder to commit or roll back first.
    async fn get_by_user_for_update(
        &self,
        user_id: UserId,
        currency_id: CurrencyId,
        tx: &mut TxHandle,
    ) -> Result<Wallet, StoreError>;

    async fn create(&self, wallet: Wallet, tx: Option<&mut TxHandle>)
        -> Result<Wallet, StoreError>;

    async fn update(&self, wallet: &Wallet, tx: Option<&mut TxHandle>) -> Result<(), StoreError>;

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Wallet>, StoreError>;

    async fn list_all(&self) -> Result<Vec<Wallet>, StoreError>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn create_transaction(
        &self,
        transaction: Transaction,
        tx: Option<&mut TxHandle>,
    ) -> Result<Transaction, StoreError>;

    async fn create_balance_history(
        &self,
        entry: BalanceHistory,
        tx: Option<&mut TxHandle>,
    ) -> Result<BalanceHistory, StoreError>;

    async fn find_by_hash(&self, hash: &str) -> Result<Transaction, StoreError>;

    /// Transactions sent or received by the user, newest first.
    async fn list_by_user(
        &self,
        user_id: UserId,
        page: Option<Page>,
    ) -> Result<Vec<Transaction>, StoreError>;

    async fn count_by_user(&self, user_id: UserId) -> Result<u64, StoreError>;

    async fn history_by_user(&self, user_id: UserId) -> Result<Vec<BalanceHistory>, StoreError>;

    async fn history_by_wallet(
        &self,
        wallet_id: WalletId,
    ) -> Result<Vec<BalanceHistory>, StoreError>;
}
