use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

pub type UserId = u64;
pub type CurrencyId = u32;
pub type WalletId = u64;
pub type TransactionId = u64;
pub type HistoryId = u64;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

/// Exact decimal money value. All balance arithmetic goes through here so
/// nothing ever touches binary floating point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(Decimal);

impl Amount {
    pub const ZERO: Amount = Amount(Decimal::ZERO);

    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    pub fn from_int(value: i64) -> Self {
        Self(Decimal::from(value))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    pub fn less_than(&self, other: &Amount) -> bool {
        self.0 < other.0
    }

    /// `None` on overflow.
    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    /// `None` on overflow.
    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Canonical form with trailing zeros stripped, so `100.00` and `100`
    /// fingerprint identically.
    pub fn canonical(&self) -> String {
        self.0.normalize().to_string()
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl FromStr for Amount {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s.trim()).map(Amount)
    }
}

impl From<Decimal> for Amount {
    fn from(value: Decimal) -> Self {
        Self(value)
    }
}

// Always a string on the wire: CSV and JSON number paths would go through f64.
impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalletKey {
    pub user_id: UserId,
    pub currency_id: CurrencyId,
}

impl WalletKey {
    pub fn new(user_id: UserId, currency_id: CurrencyId) -> Self {
        Self {
            user_id,
            currency_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub user_id: UserId,
    pub currency_id: CurrencyId,
    pub balance: Amount,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Unsaved wallet; the store assigns `id` on create.
    pub fn new(user_id: UserId, currency_id: CurrencyId, balance: Amount) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            user_id,
            currency_id,
            balance,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> WalletKey {
        WalletKey::new(self.user_id, self.currency_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub currency_id: CurrencyId,
    pub amount: Amount,
    pub hash: String,
    pub signature: String,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// A completed transfer record, fingerprinted from its own fields.
    pub fn completed(
        from_user_id: UserId,
        to_user_id: UserId,
        currency_id: CurrencyId,
        amount: Amount,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            from_user_id,
            to_user_id,
            currency_id,
            amount,
            hash: generate_hash(from_user_id, to_user_id, amount, created_at),
            signature: generate_signature(from_user_id, to_user_id, amount, created_at),
            status: TransactionStatus::Completed,
            created_at,
        }
    }

    pub fn involves(&self, user_id: UserId) -> bool {
        self.from_user_id == user_id || self.to_user_id == user_id
    }
}

/// SHA-256 over `from|to|amount|created_at`, hex encoded (64 chars).
pub fn generate_hash(
    from_user_id: UserId,
    to_user_id: UserId,
    amount: Amount,
    created_at: DateTime<Utc>,
) -> String {
    let fingerprint = format!(
        "{}|{}|{}|{}",
        from_user_id,
        to_user_id,
        amount.canonical(),
        created_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
    );
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    hex::encode(hasher.finalize())
}

/// Integrity token, not a cryptographic signature.
pub fn generate_signature(
    from_user_id: UserId,
    to_user_id: UserId,
    amount: Amount,
    created_at: DateTime<Utc>,
) -> String {
    format!(
        "SIG-{}-{}-{}-{}",
        from_user_id,
        to_user_id,
        amount.canonical(),
        created_at.timestamp_millis()
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Debit,
    Credit,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Debit => "debit",
            ChangeType::Credit => "credit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceHistory {
    pub id: HistoryId,
    pub user_id: UserId,
    pub wallet_id: WalletId,
    pub transaction_id: TransactionId,
    pub change_type: ChangeType,
    pub amount: Amount,
    pub balance_before: Amount,
    pub balance_after: Amount,
    pub created_at: DateTime<Utc>,
}

impl BalanceHistory {
    /// Audit entry for a wallet that has already been mutated in memory.
    pub fn record(
        wallet: &Wallet,
        transaction: &Transaction,
        change_type: ChangeType,
        balance_before: Amount,
    ) -> Self {
        Self {
            id: 0,
            user_id: wallet.user_id,
            wallet_id: wallet.id,
            transaction_id: transaction.id,
            change_type,
            amount: transaction.amount,
            balance_before,
            balance_after: wallet.balance,
            created_at: transaction.created_at,
        }
    }
}

/// Payload handed to the notifier once a transfer has committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferCompleted {
    pub hash: String,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub currency_id: CurrencyId,
    pub amount: Amount,
    pub timestamp: String,
}

impl From<&Transaction> for TransferCompleted {
    fn from(tx: &Transaction) -> Self {
        Self {
            hash: tx.hash.clone(),
            from_user_id: tx.from_user_id,
            to_user_id: tx.to_user_id,
            currency_id: tx.currency_id,
            amount: tx.amount,
            timestamp: tx.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransferRequest {
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub currency_id: CurrencyId,
    pub amount: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    /// 1-based page number; size falls back to the default when zero and is
    /// capped at `MAX_PAGE_SIZE`.
    pub fn from_page_number(page: usize, page_size: usize) -> Self {
        let page = page.max(1);
        let limit = match page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };
        Self {
            offset: (page - 1).saturating_mul(limit),
            limit,
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(0, DEFAULT_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowKind {
    Open,
    Transfer,
}

/// One line of the batch input CSV.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerRow {
    #[serde(rename = "type")]
    pub kind: RowKind,
    pub user: UserId,
    #[serde(default)]
    pub counterparty: Option<UserId>,
    pub currency: CurrencyId,
    #[serde(default)]
    pub amount: Option<Amount>,
}

#[derive(Debug)]
pub struct WalletOutput {
    pub user: UserId,
    pub currency: CurrencyId,
    pub balance: Amount,
}

impl From<&Wallet> for WalletOutput {
    fn from(wallet: &Wallet) -> Self {
        Self {
            user: wallet.user_id,
            currency: wallet.currency_id,
            balance: wallet.balance,
        }
    }
}
