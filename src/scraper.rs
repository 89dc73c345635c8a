use async_trait::async_trait;
use regex::{NoExpand, Regex};
use std::sync::LazyLock;
use tokio_retry::Retry;
use tokio_retry::strategy::FixedInterval;

use crate::config::FetcherConfig;
use crate::utils::error::{AppError, Result};

static LINE_BREAKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\r\n\t]").expect("line break regex"));
static IGNORED_BLOCKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(<script.*?/script>|<style.*?/style>|<path.*?/path>)")
        .expect("ignored block regex")
});
static TITLE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<(/?title.*?)>").expect("title tag regex"));
static TAG_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(<.*?>)+").expect("tag regex"));
static TITLE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[(/?title.*?)\]").expect("title marker regex"));

/// The only network capability the update pipeline needs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// Fetch `url` and return the response body.
    async fn get(&self, url: &str) -> Result<String>;
}

pub struct ReqwestFetcher {
    client: reqwest::Client,
    config: FetcherConfig,
}

impl ReqwestFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .pool_max_idle_per_host(0)
            .build()?;

        Ok(Self { client, config })
    }

    async fn get_once(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn get(&self, url: &str) -> Result<String> {
        let strategy =
            FixedInterval::from_millis(self.config.retry_delay_ms).take(self.config.retry_attempts);

        let mut trial = 0usize;
        Retry::spawn(strategy, || {
            trial += 1;
            let attempt = trial;
            async move {
                self.get_once(url).await.map_err(|e| {
                    tracing::warn!("fail to fetch website {} (trial {}): {}", url, attempt, e);
                    e
                })
            }
        })
        .await
        .map_err(|e| AppError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

/// Reduce a page body to a separator-delimited token stream. Script, style and
/// svg path blocks are dropped, every remaining run of tags becomes a single
/// separator, and `<title>` tags survive verbatim so the title stays findable.
pub fn prune_response(body: &str, separator: &str) -> String {
    let pruned = LINE_BREAKS.replace_all(body, "");
    let pruned = IGNORED_BLOCKS.replace_all(&pruned, "<delete/>");
    let pruned = TITLE_TAG.replace_all(&pruned, "[${1}]");
    let pruned = TAG_RUN.replace_all(&pruned, NoExpand(separator));
    let pruned = TITLE_MARKER.replace_all(&pruned, "<${1}>");

    let pruned = pruned.strip_prefix(separator).unwrap_or(&pruned);
    let pruned = pruned.strip_suffix(separator).unwrap_or(pruned);
    pruned.to_string()
}
