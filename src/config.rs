//! Engine configuration.
//!
//! Every field has a default, so an empty (or partial) TOML file is valid.

use crate::models::{Amount, CurrencyId, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Currency a newly provisioned user's wallet is opened in.
    pub default_currency: CurrencyId,
    /// Opening balance for a provisioned wallet.
    pub default_balance: Amount,
    /// Upper bound on the locking and persisting phase of a transfer.
    /// Unset means transfers wait on row locks indefinitely.
    pub transfer_timeout_ms: Option<u64>,
    pub page_size: usize,
    pub max_page_size: usize,
    pub notify_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_currency: 1,
            default_balance: Amount::new(Decimal::ONE_THOUSAND),
            transfer_timeout_ms: None,
            page_size: DEFAULT_PAGE_SIZE,
            max_page_size: MAX_PAGE_SIZE,
            notify_channel_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Load config from the given TOML file path.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        if config.default_balance.is_negative() {
            anyhow::bail!("default_balance must not be negative");
        }
        Ok(config)
    }

    pub fn transfer_timeout(&self) -> Option<Duration> {
        self.transfer_timeout_ms.map(Duration::from_millis)
    }
}
