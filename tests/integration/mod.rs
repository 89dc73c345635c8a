// Shared fixtures for the integration tests: a local page server, engines
// wired to a real HTTP fetcher, and polling helpers for background workers.

pub mod scheduler_tests;
pub mod stream_tests;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use web_history::config::{DatabaseConfig, ExecutorConfig, FetcherConfig, SchedulerConfig};
use web_history::diff_engine::ContentDiffEngine;
use web_history::executor::JobExecutor;
use web_history::models::{ExtractionConfig, NewTrackedPage, TrackedPage};
use web_history::repository::{InMemoryRepository, Repository, SqliteRepository};
use web_history::scraper::{HttpFetcher, ReqwestFetcher};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub fn page_body(title: &str, dates: &[&str]) -> String {
    let items: String = dates
        .iter()
        .map(|date| format!("<li><a href=\"/{}\">{}</a></li>", date, date))
        .collect();
    format!(
        "<html><head><title>{}</title><script>var d = '1999-01-01';</script></head>\
         <body><h1>{}</h1><ul>{}</ul></body></html>",
        title, title, items
    )
}

pub async fn mount_page(server: &MockServer, route: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

pub async fn mount_status(server: &MockServer, route: &str, status: u16) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

pub fn fetcher_config(retry_attempts: usize) -> FetcherConfig {
    FetcherConfig {
        request_timeout: 5,
        retry_attempts,
        retry_delay_ms: 10,
        user_agent: "WebHistory-Test/1.0".to_string(),
    }
}

pub fn engine(repo: Arc<dyn Repository>) -> anyhow::Result<ContentDiffEngine> {
    let fetcher: Arc<dyn HttpFetcher> = Arc::new(ReqwestFetcher::new(fetcher_config(0))?);
    Ok(ContentDiffEngine::new(repo, fetcher))
}

pub fn tracked(url: String) -> TrackedPage {
    TrackedPage::new(NewTrackedPage { url }, ExtractionConfig::default())
}

pub fn memory_repo(pages: &[TrackedPage]) -> Arc<InMemoryRepository> {
    Arc::new(InMemoryRepository::new(pages.to_vec(), Vec::new()))
}

pub async fn sqlite_repo() -> anyhow::Result<Arc<SqliteRepository>> {
    let repo = SqliteRepository::connect(&DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
    })
    .await?;
    repo.migrate().await?;
    Ok(Arc::new(repo))
}

pub fn executor(worker_count: usize) -> Arc<JobExecutor> {
    Arc::new(JobExecutor::new(&ExecutorConfig { worker_count }))
}

pub fn scheduler_config(exec_at_beginning: bool) -> SchedulerConfig {
    SchedulerConfig {
        exec_at_beginning,
        sleep_interval_ms: 0,
        rescan_weekday: "Fri".to_string(),
        rescan_hour: 4,
    }
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

pub async fn stored_entries(repo: &dyn Repository, id: &str) -> Vec<String> {
    match repo.find_website(id).await {
        Ok(page) => page.entries(),
        Err(_) => Vec::new(),
    }
}
