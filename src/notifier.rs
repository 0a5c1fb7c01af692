use crate::errors::NotifierError;
use crate::models::TransferCompleted;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;

/// Receives a notice for every committed transfer. Failures are reported back
/// to the engine, which only logs them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &TransferCompleted) -> Result<(), NotifierError>;
}

pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _event: &TransferCompleted) -> Result<(), NotifierError> {
        Ok(())
    }
}

/// Hands events to a bounded channel without ever waiting on the consumer.
#[derive(Clone)]
pub struct ChannelNotifier {
    sender: mpsc::Sender<TransferCompleted>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TransferCompleted>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, event: &TransferCompleted) -> Result<(), NotifierError> {
        self.sender
            .try_send(event.clone())
            .map_err(|e| match e {
                TrySendError::Full(_) => NotifierError::ChannelFull,
                TrySendError::Closed(_) => NotifierError::ChannelClosed,
            })
    }
}

/// Append-only JSON-lines log of completed transfers.
pub struct EventLogNotifier {
    path: PathBuf,
    writer: Mutex<File>,
}

impl EventLogNotifier {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, NotifierError> {
        let path = path.as_ref().to_path_buf();
        // Create file if doesn't exist, append if exists
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every recorded event back, skipping lines that don't parse.
    pub async fn replay(&self) -> Result<Vec<TransferCompleted>, NotifierError> {
        let file = File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TransferCompleted>(&line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "Skipping malformed event line");
                }
            }
        }

        Ok(events)
    }
}

#[async_trait]
impl Notifier for EventLogNotifier {
    async fn notify(&self, event: &TransferCompleted) -> Result<(), NotifierError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}
