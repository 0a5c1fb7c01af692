use crate::cli::{apply_row, sorted_wallets};
use crate::config::EngineConfig;
use crate::csv_io::{stream_rows, write_wallets};
use crate::memory_store::InMemoryStore;
use crate::notifier::ChannelNotifier;
use crate::transfer_engine::TransferEngine;
use anyhow::Result;
use futures::StreamExt;
use std::sync::Arc;
use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

pub async fn run(bind: String, max_connections: usize, config: EngineConfig) -> Result<()> {
    tracing::info!("Server mode: binding to {}", bind);

    let (notifier, mut events) = ChannelNotifier::new(config.notify_channel_capacity);
    let engine = TransferEngine::in_memory(Arc::new(InMemoryStore::new()))
        .with_config(config)
        .with_notifier(Arc::new(notifier));

    // Stand-in for a message bus consumer
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::info!(
                hash = %event.hash,
                from_user_id = event.from_user_id,
                to_user_id = event.to_user_id,
                amount = %event.amount,
                "tx.created"
            );
        }
    });

    let listener = TcpListener::bind(&bind).await?;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    tracing::info!("Listening on {}, max {} connections", bind, max_connections);

    loop {
        let permit = semaphore.clone().acquire_owned().await?;
        let (socket, addr) = listener.accept().await?;
        tracing::info!("Accepted connection from {}", addr);

        let engine = engine.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, engine).await {
                tracing::error!("Connection {} error: {}", addr, e);
            }
            drop(permit);
        });
    }
}

async fn handle_connection(socket: TcpStream, engine: TransferEngine) -> Result<()> {
    let (reader, writer) = socket.into_split();
    let reader = BufReader::new(reader);

    let mut stream = stream_rows(reader);

    while let Some(result) = stream.next().await {
        match result {
            Ok(row) => {
                if let Err(e) = apply_row(&engine, row).await {
                    tracing::debug!(code = e.code(), error = %e, "Row rejected");
                }
            }
            Err(e) => {
                tracing::warn!("CSV parse error: {}", e);
            }
        }
    }

    // Reply with the balances as of end of stream
    let writer = BufWriter::new(writer);
    write_wallets(writer, sorted_wallets(&engine).await?).await?;

    Ok(())
}
