use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};

use crate::executor::JobTrigger;
use crate::models::TrackedPage;
use crate::utils::error::{AppError, Result};

pub mod batch_update;
pub mod website_update;

pub use batch_update::{BatchUpdateJob, WeeklyTrigger, next_run_time};
pub use website_update::{WebsiteUpdateJob, WebsiteUpdateParams, WebsiteUpdateScheduler};

/// A producer of jobs for the [`crate::executor::JobExecutor`].
#[async_trait]
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self) -> Result<()>;

    /// Stop producing. Once this returns the publisher is closed.
    async fn stop(&self) -> Result<()>;

    /// Receiving end to register with the executor. Can be taken once.
    fn publisher(&self) -> Result<JobTrigger>;
}

/// Something that accepts "please update this page" requests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageDispatcher: Send + Sync {
    async fn dispatch(&self, page: TrackedPage) -> Result<()>;
}

/// Holds a scheduler's publisher until the executor takes it.
pub(crate) struct PublisherSlot(Mutex<Option<JobTrigger>>);

impl PublisherSlot {
    pub(crate) fn new(trigger: JobTrigger) -> Self {
        Self(Mutex::new(Some(trigger)))
    }

    pub(crate) fn take(&self, scheduler: &str) -> Result<JobTrigger> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| AppError::Internal(format!("publisher of {} already taken", scheduler)))
    }
}
