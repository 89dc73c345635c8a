use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::counter;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::utils::error::{AppError, Result};

/// Receiving end of a producer. The executor drains it until every sender is
/// dropped.
pub type JobTrigger = mpsc::Receiver<JobExec>;

/// Per-execution context handed to a job.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A unit of work with a statically known parameter type.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    type Params: Send + fmt::Debug + 'static;

    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: JobContext, params: Self::Params) -> Result<()>;
}

type RunFn = Box<dyn FnOnce(JobContext) -> BoxFuture<'static, Result<()>> + Send>;

/// A job bound to its parameters, ready to be queued.
pub struct JobExec {
    name: &'static str,
    params: String,
    run: RunFn,
}

impl JobExec {
    pub fn new<J: Job>(job: Arc<J>, params: J::Params) -> Self {
        Self {
            name: job.name(),
            params: format!("{:?}", params),
            run: Box::new(move |ctx| async move { job.execute(ctx, params).await }.boxed()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn params(&self) -> &str {
        &self.params
    }

    pub async fn run(self, ctx: JobContext) -> Result<()> {
        (self.run)(ctx).await
    }
}

impl fmt::Debug for JobExec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobExec")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

/// Callback run exactly once when a job is done with a shared resource.
/// Dropping an unfired hook fires it, so a job that errors out or panics
/// still releases what it holds.
pub struct CompletionHook(Option<Box<dyn FnOnce() + Send>>);

impl CompletionHook {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub fn noop() -> Self {
        Self(None)
    }

    pub fn fire(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Drop for CompletionHook {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl fmt::Debug for CompletionHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() { "CompletionHook(pending)" } else { "CompletionHook(done)" })
    }
}

/// Bounded worker pool fed by any number of registered producers.
pub struct JobExecutor {
    worker_count: usize,
    triggers: Mutex<Vec<JobTrigger>>,
    started: AtomicBool,
    cancel: CancellationToken,
    publishers: TaskTracker,
    workers: TaskTracker,
}

impl JobExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            worker_count: config.worker_count.max(1),
            triggers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            publishers: TaskTracker::new(),
            workers: TaskTracker::new(),
        }
    }

    /// Attach a producer. Only allowed before [`JobExecutor::start`].
    pub fn register(&self, trigger: JobTrigger) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(AppError::Internal("executor already started".to_string()));
        }
        self.triggers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(trigger);
        Ok(())
    }

    /// Token handed to every job; cancelling it makes pending jobs bail out early.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Spawn the fan-in tasks and the workers, then return.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AppError::Internal("executor already started".to_string()));
        }

        let triggers: Vec<JobTrigger> = self
            .triggers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let (queue_tx, queue_rx) = mpsc::channel::<JobExec>(self.worker_count);

        for mut trigger in triggers {
            let queue_tx = queue_tx.clone();
            self.publishers.spawn(async move {
                while let Some(job) = trigger.recv().await {
                    if queue_tx.send(job).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(queue_tx);
        self.publishers.close();

        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        for worker in 0..self.worker_count {
            let queue_rx = Arc::clone(&queue_rx);
            let cancel = self.cancel.clone();
            self.workers.spawn(async move {
                loop {
                    let next = queue_rx.lock().await.recv().await;
                    match next {
                        Some(job) => Self::execute(job, cancel.clone()).await,
                        None => break,
                    }
                }
                tracing::debug!("worker {} exited", worker);
            });
        }
        self.workers.close();

        tracing::info!("job executor started with {} workers", self.worker_count);
        Ok(())
    }

    /// Block until every producer is exhausted and every worker has exited.
    pub async fn wait(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        self.publishers.wait().await;
        self.workers.wait().await;
    }

    /// Wait for producers to finish emitting, then for the queue to drain and
    /// all in-flight jobs to complete. Producers must be stopped first or this
    /// never returns.
    pub async fn stop(&self) -> Result<()> {
        tracing::info!("stopping job executor");
        self.wait().await;
        tracing::info!("job executor stopped");
        Ok(())
    }

    async fn execute(job: JobExec, cancel: CancellationToken) {
        let ctx = JobContext {
            job_id: Uuid::new_v4(),
            cancel,
        };
        let name = job.name();
        let span = tracing::info_span!("job", job = name, job_uuid = %ctx.job_id, params = %job.params());

        async move {
            tracing::debug!("job started");
            let status = match tokio::spawn(job.run(ctx).in_current_span()).await {
                Ok(Ok(())) => {
                    tracing::info!("job succeeded");
                    "success"
                }
                Ok(Err(e)) if e.is_cancelled() => {
                    tracing::warn!("job cancelled");
                    "cancelled"
                }
                Ok(Err(e)) => {
                    tracing::error!("job failed: {}", e);
                    "failure"
                }
                Err(e) => {
                    tracing::error!("job panicked: {}", e);
                    "panic"
                }
            };
            counter!("web_history_jobs_total", "job" => name, "status" => status).increment(1);
        }
        .instrument(span)
        .await
    }
}
