use async_trait::async_trait;
use chrono::{DateTime, Datelike, Days, Utc, Weekday};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::SchedulerConfig;
use crate::executor::{Job, JobContext, JobExec, JobTrigger};
use crate::jobs::{PageDispatcher, PublisherSlot, Scheduler};
use crate::repository::Repository;
use crate::utils::error::{AppError, Result};

/// Next full-rescan time after `last_run`: the coming `weekday` at `hour`
/// o'clock UTC. A target one day away or less (including today) rolls to the
/// following week. Without a previous run the rescan is due `now`.
pub fn next_run_time(
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    weekday: Weekday,
    hour: u32,
) -> DateTime<Utc> {
    let Some(last_run) = last_run else {
        return now;
    };

    let mut days_later = weekday.num_days_from_sunday() as i64
        - last_run.weekday().num_days_from_sunday() as i64;
    if days_later <= 1 {
        days_later += 7;
    }

    let date = last_run.date_naive() + Days::new(days_later as u64);
    date.and_hms_opt(hour.min(23), 0, 0)
        .unwrap_or_default()
        .and_utc()
}

#[derive(Debug)]
pub struct BatchUpdateParams;

/// Requests an update for every tracked page.
pub struct BatchUpdateJob {
    repo: Arc<dyn Repository>,
    dispatcher: Arc<dyn PageDispatcher>,
}

impl BatchUpdateJob {
    pub fn new(repo: Arc<dyn Repository>, dispatcher: Arc<dyn PageDispatcher>) -> Self {
        Self { repo, dispatcher }
    }
}

#[async_trait]
impl Job for BatchUpdateJob {
    type Params = BatchUpdateParams;

    fn name(&self) -> &'static str {
        "batch_update"
    }

    async fn execute(&self, ctx: JobContext, _params: BatchUpdateParams) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let pages = self.repo.find_websites().await?;
        tracing::info!("dispatching {} pages for full rescan", pages.len());

        for page in pages {
            let url = page.url.clone();
            if let Err(e) = self.dispatcher.dispatch(page).await {
                tracing::error!(url = %url, "fail to deploy update job: {}", e);
            }
        }
        Ok(())
    }
}

/// Fires a [`BatchUpdateJob`] once a week.
pub struct WeeklyTrigger {
    job: Arc<BatchUpdateJob>,
    weekday: Weekday,
    hour: u32,
    exec_at_beginning: bool,
    sender: Mutex<Option<mpsc::Sender<JobExec>>>,
    publisher: PublisherSlot,
    stopped: CancellationToken,
    tracker: TaskTracker,
}

impl WeeklyTrigger {
    pub fn new(job: BatchUpdateJob, config: &SchedulerConfig) -> Result<Self> {
        let (sender, receiver) = mpsc::channel(1);
        Ok(Self {
            job: Arc::new(job),
            weekday: config.weekday()?,
            hour: config.rescan_hour,
            exec_at_beginning: config.exec_at_beginning,
            sender: Mutex::new(Some(sender)),
            publisher: PublisherSlot::new(receiver),
            stopped: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }
}

#[async_trait]
impl Scheduler for WeeklyTrigger {
    fn name(&self) -> &'static str {
        "batch_update"
    }

    async fn start(&self) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(AppError::SchedulerStopped)?;
        let job = Arc::clone(&self.job);
        let stopped = self.stopped.clone();
        let (weekday, hour) = (self.weekday, self.hour);
        let mut last_run = (!self.exec_at_beginning).then(Utc::now);

        self.tracker.spawn(async move {
            loop {
                let now = Utc::now();
                let next = next_run_time(last_run, now, weekday, hour);
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                tracing::info!("next full rescan at {}", next);

                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                last_run = Some(Utc::now());
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    sent = sender.send(JobExec::new(Arc::clone(&job), BatchUpdateParams)) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("weekly trigger loop exited");
        });

        tracing::info!("weekly rescan trigger started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tracing::info!("weekly rescan trigger stopped");
        Ok(())
    }

    fn publisher(&self) -> Result<JobTrigger> {
        self.publisher.take(self.name())
    }
}
