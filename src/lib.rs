pub mod config;
pub mod diff_engine;
pub mod executor;
pub mod jobs;
pub mod models;
pub mod repository;
pub mod scraper;
pub mod shutdown;
pub mod stream;
pub mod utils;

// Re-export commonly used types
pub use config::AppConfig;
pub use diff_engine::{ContentDiffEngine, UpdateOutcome};
pub use executor::{Job, JobExec, JobExecutor};
pub use jobs::Scheduler;
pub use models::TrackedPage;
pub use repository::Repository;
pub use utils::error::AppError;

pub type Result<T> = std::result::Result<T, AppError>;
