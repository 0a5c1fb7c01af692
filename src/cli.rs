use crate::config::EngineConfig;
use crate::csv_io::{stream_rows, write_wallets};
use crate::errors::TransferError;
use crate::memory_store::InMemoryStore;
use crate::models::{LedgerRow, RowKind, WalletOutput};
use crate::notifier::EventLogNotifier;
use crate::transfer_engine::TransferEngine;
use anyhow::Result;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::BufReader;

pub async fn run(
    input_path: PathBuf,
    events_path: Option<PathBuf>,
    config: EngineConfig,
) -> Result<()> {
    let mut engine = TransferEngine::in_memory(Arc::new(InMemoryStore::new())).with_config(config);
    if let Some(path) = events_path {
        engine = engine.with_notifier(Arc::new(EventLogNotifier::new(path).await?));
    }

    let file = File::open(&input_path).await?;
    let reader = BufReader::new(file);
    let mut stream = stream_rows(reader);

    while let Some(result) = stream.next().await {
        match result {
            Ok(row) => {
                // Rejected rows leave the ledger untouched; keep going
                if let Err(e) = apply_row(&engine, row).await {
                    tracing::debug!(code = e.code(), error = %e, "Row rejected");
                }
            }
            Err(_) => {
                // Ignore parse errors
            }
        }
    }

    write_wallets(tokio::io::stdout(), sorted_wallets(&engine).await?).await?;

    Ok(())
}

/// Apply one input row to the engine.
pub async fn apply_row(engine: &TransferEngine, row: LedgerRow) -> Result<(), TransferError> {
    match row.kind {
        RowKind::Open => {
            let balance = row.amount.unwrap_or(engine.config().default_balance);
            engine.open_wallet(row.user, row.currency, balance).await?;
        }
        RowKind::Transfer => {
            // A missing counterparty is treated as a self-transfer and rejected
            let to = row.counterparty.unwrap_or(row.user);
            let amount = row.amount.ok_or(TransferError::InvalidAmount)?;
            engine.transfer(row.user, to, row.currency, amount).await?;
        }
    }
    Ok(())
}

/// All wallets ordered by (user, currency) for stable output.
pub async fn sorted_wallets(engine: &TransferEngine) -> Result<Vec<WalletOutput>> {
    let mut wallets: Vec<WalletOutput> = engine
        .all_wallets()
        .await?
        .iter()
        .map(WalletOutput::from)
        .collect();
    wallets.sort_by_key(|w| (w.user, w.currency));
    Ok(wallets)
}
