use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

use crate::executor::{Job, JobContext, JobExec, JobTrigger};
use crate::jobs::{PublisherSlot, Scheduler};
use crate::stream::{Task, TaskMessage, TaskRegistry};
use crate::utils::error::{AppError, Result};

/// Runs one relayed stream message through its task.
pub struct TaskJob {
    task: Arc<dyn Task>,
}

impl TaskJob {
    pub fn new(task: Arc<dyn Task>) -> Self {
        Self { task }
    }
}

#[async_trait]
impl Job for TaskJob {
    type Params = TaskMessage;

    fn name(&self) -> &'static str {
        "stream_task"
    }

    async fn execute(&self, ctx: JobContext, message: TaskMessage) -> Result<()> {
        self.task.execute(&ctx.cancel, message).await
    }
}

/// Feeds every registered task's messages into the executor.
pub struct TaskSubscriber {
    registry: TaskRegistry,
    sender: Mutex<Option<mpsc::Sender<JobExec>>>,
    publisher: PublisherSlot,
    forwarders: TaskTracker,
}

impl TaskSubscriber {
    pub fn new(registry: TaskRegistry) -> Self {
        let (sender, receiver) = mpsc::channel(1);
        Self {
            registry,
            sender: Mutex::new(Some(sender)),
            publisher: PublisherSlot::new(receiver),
            forwarders: TaskTracker::new(),
        }
    }
}

#[async_trait]
impl Scheduler for TaskSubscriber {
    fn name(&self) -> &'static str {
        "stream_subscriber"
    }

    async fn start(&self) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(AppError::SchedulerStopped)?;

        for task in self.registry.tasks().await {
            let (sink, mut messages) = mpsc::channel::<TaskMessage>(1);
            task.subscribe(sink).await?;

            let job = Arc::new(TaskJob::new(Arc::clone(&task)));
            let sender = sender.clone();
            self.forwarders.spawn(async move {
                while let Some(message) = messages.recv().await {
                    if sender.send(JobExec::new(Arc::clone(&job), message)).await.is_err() {
                        break;
                    }
                }
            });
        }

        tracing::info!("subscribed to tasks {:?}", self.registry.task_names().await);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        for task in self.registry.tasks().await {
            if let Err(e) = task.unsubscribe().await {
                tracing::warn!("error unsubscribing task {}: {}", task.name(), e);
            }
        }

        self.forwarders.close();
        self.forwarders.wait().await;
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tracing::info!("stream subscriber stopped");
        Ok(())
    }

    fn publisher(&self) -> Result<JobTrigger> {
        self.publisher.take(self.name())
    }
}
