use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::diff_engine::{ContentDiffEngine, UpdateOutcome};
use crate::executor::CompletionHook;
use crate::models::TrackedPage;
use crate::stream::{ConsumerGroup, DurableStream, StreamMessage};
use crate::utils::error::{AppError, Result};

pub const TASK_NAME_FIELD: &str = "task_name";
pub const PAGE_FIELD: &str = "web";

const STREAM_PREFIX: &str = "web_history";
const GROUP_NAME: &str = "web_history_workers";

/// A stream message on its way to the worker pool. `release` lets the task
/// relay the next message once this one has been handled.
pub struct TaskMessage {
    pub task_name: String,
    pub message: StreamMessage,
    pub release: CompletionHook,
}

impl fmt::Debug for TaskMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{task: {}, message: {}}}", self.task_name, self.message.id)
    }
}

/// Stream-backed unit of work for one host class.
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    /// Start relaying stream messages into `sink` in the background.
    async fn subscribe(&self, sink: mpsc::Sender<TaskMessage>) -> Result<()>;

    /// Stop relaying. Messages not yet handed over stay pending in the stream.
    async fn unsubscribe(&self) -> Result<()>;

    async fn publish(&self, page: &TrackedPage) -> Result<()>;

    async fn execute(&self, cancel: &CancellationToken, message: TaskMessage) -> Result<()>;
}

pub struct UpdateWebsiteTask {
    name: String,
    stream: Arc<dyn DurableStream>,
    group: ConsumerGroup,
    engine: ContentDiffEngine,
    cooldown: Duration,
    subscription: CancellationToken,
    tracker: TaskTracker,
}

impl UpdateWebsiteTask {
    pub fn new(
        name: &str,
        consumer: &str,
        stream: Arc<dyn DurableStream>,
        engine: ContentDiffEngine,
        cooldown: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            group: ConsumerGroup {
                stream: format!("{}:{}", STREAM_PREFIX, name),
                group: GROUP_NAME.to_string(),
                consumer: consumer.to_string(),
            },
            stream,
            engine,
            cooldown,
            subscription: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn group(&self) -> &ConsumerGroup {
        &self.group
    }

    fn decode(message: &StreamMessage) -> Result<TrackedPage> {
        let payload = message
            .values
            .get(PAGE_FIELD)
            .ok_or_else(|| AppError::InvalidParams(format!("message {} has no page", message.id)))?;
        serde_json::from_str(payload)
            .map_err(|e| AppError::InvalidParams(format!("message {}: {}", message.id, e)))
    }

    async fn acknowledge(&self, message: &StreamMessage) -> Result<()> {
        self.stream.acknowledge(&self.group, &message.id).await?;
        tracing::debug!(task = %self.name, "acknowledged message {}", message.id);
        Ok(())
    }
}

#[async_trait]
impl Task for UpdateWebsiteTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self, sink: mpsc::Sender<TaskMessage>) -> Result<()> {
        let (relay_tx, mut relay_rx) = mpsc::channel::<StreamMessage>(1);

        let stream = Arc::clone(&self.stream);
        let group = self.group.clone();
        let cancel = self.subscription.clone();
        self.tracker.spawn(async move {
            if let Err(e) = stream.subscribe(&group, cancel, relay_tx).await {
                tracing::error!(stream = %group.stream, "stream subscription failed: {}", e);
            }
        });

        // One message of this class in flight at a time
        let in_flight = Arc::new(Semaphore::new(1));
        let task_name = self.name.clone();
        let cancel = self.subscription.clone();
        self.tracker.spawn(async move {
            loop {
                let permit = tokio::select! {
                    _ = cancel.cancelled() => break,
                    permit = Arc::clone(&in_flight).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = relay_rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };

                let task_message = TaskMessage {
                    task_name: task_name.clone(),
                    message,
                    release: CompletionHook::new(move || drop(permit)),
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = sink.send(task_message) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            relay_rx.close();
            tracing::debug!(task = %task_name, "relay stopped");
        });

        tracing::info!(task = %self.name, stream = %self.group.stream, "subscribed");
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.subscription.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!(task = %self.name, "unsubscribed");
        Ok(())
    }

    async fn publish(&self, page: &TrackedPage) -> Result<()> {
        let values = HashMap::from([
            (TASK_NAME_FIELD.to_string(), self.name.clone()),
            (PAGE_FIELD.to_string(), serde_json::to_string(page)?),
        ]);
        let id = self.stream.publish(&self.group.stream, values).await?;
        tracing::debug!(task = %self.name, url = %page.url, "published as {}", id);
        Ok(())
    }

    async fn execute(&self, cancel: &CancellationToken, message: TaskMessage) -> Result<()> {
        let TaskMessage {
            message, release, ..
        } = message;
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let mut page = match Self::decode(&message) {
            Ok(page) => page,
            Err(e) => {
                // Undecodable payloads are acknowledged so they are never redelivered
                tracing::error!(task = %self.name, "dropping message {}: {}", message.id, e);
                self.acknowledge(&message).await?;
                return Err(e);
            }
        };

        let outcome = self.engine.update(&mut page).await;

        tokio::select! {
            _ = tokio::time::sleep(self.cooldown) => {}
            _ = cancel.cancelled() => {}
        }

        let result = match outcome {
            UpdateOutcome::FetchFailed { message: reason } => Err(AppError::Fetch {
                url: page.url.clone(),
                message: reason,
            }),
            UpdateOutcome::PersistFailed { message: reason, .. } => Err(AppError::Persistence(reason)),
            UpdateOutcome::ExtractionFailed { message: reason } => {
                tracing::warn!(task = %self.name, url = %page.url, "acknowledging unextractable page: {}", reason);
                self.acknowledge(&message).await
            }
            UpdateOutcome::Unchanged | UpdateOutcome::Updated(_) => self.acknowledge(&message).await,
        };

        release.fire();
        result
    }
}
