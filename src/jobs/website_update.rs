use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::diff_engine::ContentDiffEngine;
use crate::executor::{CompletionHook, Job, JobContext, JobExec, JobTrigger};
use crate::jobs::{PageDispatcher, PublisherSlot, Scheduler};
use crate::models::TrackedPage;
use crate::utils::error::{AppError, Result};

pub struct WebsiteUpdateParams {
    pub page: TrackedPage,
    pub release: CompletionHook,
}

impl fmt::Debug for WebsiteUpdateParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{id: {}, url: {}}}", self.page.id, self.page.url)
    }
}

/// Checks and persists one page, then holds its host for the cool-down
/// interval before releasing it.
pub struct WebsiteUpdateJob {
    engine: ContentDiffEngine,
    sleep_interval: Duration,
}

impl WebsiteUpdateJob {
    pub fn new(engine: ContentDiffEngine, sleep_interval: Duration) -> Self {
        Self {
            engine,
            sleep_interval,
        }
    }
}

#[async_trait]
impl Job for WebsiteUpdateJob {
    type Params = WebsiteUpdateParams;

    fn name(&self) -> &'static str {
        "website_update"
    }

    async fn execute(&self, ctx: JobContext, params: WebsiteUpdateParams) -> Result<()> {
        let WebsiteUpdateParams { mut page, release } = params;
        if ctx.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        self.engine.update(&mut page).await;

        tokio::select! {
            _ = tokio::time::sleep(self.sleep_interval) => {}
            _ = ctx.cancel.cancelled() => {}
        }
        release.fire();
        Ok(())
    }
}

/// Lazily created per-host locks. Entries are never removed.
#[derive(Default)]
struct HostLocks(Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>);

impl HostLocks {
    fn get(&self, host: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(host.to_string()).or_default())
    }
}

/// Turns update requests into jobs while keeping at most one job per host in
/// flight. The host lock is taken before the job is queued and released by
/// the job itself once it is done.
pub struct WebsiteUpdateScheduler {
    job: Arc<WebsiteUpdateJob>,
    sender: Mutex<Option<mpsc::Sender<JobExec>>>,
    publisher: PublisherSlot,
    host_locks: HostLocks,
    stopped: CancellationToken,
    dispatches: TaskTracker,
}

impl WebsiteUpdateScheduler {
    pub fn new(job: WebsiteUpdateJob) -> Self {
        let (sender, receiver) = mpsc::channel(1);
        Self {
            job: Arc::new(job),
            sender: Mutex::new(Some(sender)),
            publisher: PublisherSlot::new(receiver),
            host_locks: HostLocks::default(),
            stopped: CancellationToken::new(),
            dispatches: TaskTracker::new(),
        }
    }

    /// Queue an update for `page` without waiting for its host to be free.
    pub fn deploy_job(&self, page: TrackedPage) -> Result<()> {
        if self.stopped.is_cancelled() {
            return Err(AppError::SchedulerStopped);
        }
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(AppError::SchedulerStopped)?;

        let host = page.host();
        let lock = self.host_locks.get(&host);
        let job = Arc::clone(&self.job);

        self.dispatches.spawn(async move {
            let guard = lock.lock_owned().await;
            tracing::debug!(host = %host, url = %page.url, "host acquired");

            let release = CompletionHook::new(move || drop(guard));
            let url = page.url.clone();
            if sender.send(JobExec::new(job, WebsiteUpdateParams { page, release })).await.is_err() {
                tracing::warn!(url = %url, "job queue closed, update dropped");
            }
        });

        Ok(())
    }
}

#[async_trait]
impl PageDispatcher for WebsiteUpdateScheduler {
    async fn dispatch(&self, page: TrackedPage) -> Result<()> {
        self.deploy_job(page)
    }
}

#[async_trait]
impl Scheduler for WebsiteUpdateScheduler {
    fn name(&self) -> &'static str {
        "website_update"
    }

    async fn start(&self) -> Result<()> {
        tracing::info!("website update scheduler started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.cancel();
        self.dispatches.close();
        self.dispatches.wait().await;
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tracing::info!("website update scheduler stopped");
        Ok(())
    }

    fn publisher(&self) -> Result<JobTrigger> {
        self.publisher.take(self.name())
    }
}
