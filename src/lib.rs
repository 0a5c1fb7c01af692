pub mod cli;
pub mod config;
pub mod csv_io;
pub mod errors;
pub mod memory_store;
pub mod models;
pub mod notifier;
pub mod server;
pub mod storage;
pub mod transfer_engine;

pub use config::EngineConfig;
pub use errors::{NotifierError, StoreError, TransferError};
pub use memory_store::InMemoryStore;
pub use models::{Amount, BalanceHistory, ChangeType, Page, Transaction, TransactionStatus, Wallet};
pub use transfer_engine::{TransferEngine, TransferState};
