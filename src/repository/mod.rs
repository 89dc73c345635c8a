use async_trait::async_trait;

use crate::models::{ExtractionRule, TrackedPage};
use crate::utils::error::Result;

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

/// Persistence contract used from inside job execution. Implementations must be
/// safe to call concurrently from every worker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Repository: Send + Sync {
    /// Store a new page. A page whose URL is already tracked is left as is,
    /// and the stored record is returned either way.
    async fn create_website(&self, page: &TrackedPage) -> Result<TrackedPage>;
    async fn update_website(&self, page: &TrackedPage) -> Result<()>;

    async fn find_websites(&self) -> Result<Vec<TrackedPage>>;
    async fn find_website(&self, id: &str) -> Result<TrackedPage>;

    /// Rule stored for `domain`, if any.
    async fn find_website_setting(&self, domain: &str) -> Result<Option<ExtractionRule>>;
}
