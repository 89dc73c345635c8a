use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::utils::error::Result;

pub mod memory;
pub mod registry;
pub mod sqlite;
pub mod subscriber;
pub mod update_task;

pub use memory::MemoryStream;
pub use registry::TaskRegistry;
pub use sqlite::SqliteStream;
pub use subscriber::{TaskJob, TaskSubscriber};
pub use update_task::{Task, TaskMessage, UpdateWebsiteTask};

/// One entry of a stream as delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: String,
    pub values: HashMap<String, String>,
}

/// Identity of a reader: entries are load-balanced between the consumers of
/// one group, and every group sees every entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerGroup {
    pub stream: String,
    pub group: String,
    pub consumer: String,
}

/// Append-only stream with consumer groups and per-group pending lists.
/// Delivery is at-least-once: an entry stays pending for its consumer until
/// acknowledged, and is handed out again on resubscription or once it has
/// been idle for too long.
#[async_trait]
pub trait DurableStream: Send + Sync {
    async fn publish(&self, stream: &str, values: HashMap<String, String>) -> Result<String>;

    async fn acknowledge(&self, group: &ConsumerGroup, id: &str) -> Result<()>;

    /// Create the group if missing. New groups start at the beginning of the stream.
    async fn ensure_group(&self, group: &ConsumerGroup) -> Result<()>;

    /// Entries delivered to this consumer and not yet acknowledged, oldest first.
    async fn read_pending(&self, group: &ConsumerGroup) -> Result<Vec<StreamMessage>>;

    /// Take over entries of the group, this consumer's own included, that have
    /// been pending for longer than `min_idle`.
    async fn claim_idle(&self, group: &ConsumerGroup, min_idle: Duration) -> Result<Vec<StreamMessage>>;

    /// Next undelivered entry for the group, recorded as pending for this consumer.
    async fn read_next(&self, group: &ConsumerGroup) -> Result<Option<StreamMessage>>;

    /// Park until new entries may be available.
    async fn wait_for_entries(&self);

    fn claim_idle_after(&self) -> Duration;

    /// Forward entries into `sink` until `cancel` fires or the sink closes:
    /// own pending entries first, then entries idle for too long, then
    /// new ones.
    async fn subscribe(
        &self,
        group: &ConsumerGroup,
        cancel: CancellationToken,
        sink: mpsc::Sender<StreamMessage>,
    ) -> Result<()> {
        self.ensure_group(group).await?;

        let pending = self.read_pending(group).await?;
        if !pending.is_empty() {
            tracing::info!(stream = %group.stream, "redelivering {} pending entries", pending.len());
        }
        if !forward(pending, &cancel, &sink).await {
            return Ok(());
        }

        while !cancel.is_cancelled() {
            let claimed = match self.claim_idle(group, self.claim_idle_after()).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    tracing::error!(stream = %group.stream, "fail to claim idle entries: {}", e);
                    Vec::new()
                }
            };
            if !forward(claimed, &cancel, &sink).await {
                break;
            }

            match self.read_next(group).await {
                Ok(Some(message)) => {
                    if !forward(vec![message], &cancel, &sink).await {
                        break;
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.wait_for_entries() => {}
                    }
                }
                Err(e) => {
                    tracing::error!(stream = %group.stream, "fail to read stream: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.wait_for_entries() => {}
                    }
                }
            }
        }

        tracing::debug!(stream = %group.stream, consumer = %group.consumer, "subscription ended");
        Ok(())
    }
}

/// Returns false once the subscription should end. Entries that could not be
/// handed over stay pending and are redelivered later.
async fn forward(
    messages: Vec<StreamMessage>,
    cancel: &CancellationToken,
    sink: &mpsc::Sender<StreamMessage>,
) -> bool {
    for message in messages {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            sent = sink.send(message) => {
                if sent.is_err() {
                    return false;
                }
            }
        }
    }
    true
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
