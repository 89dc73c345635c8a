use metrics::counter;
use std::sync::Arc;
use validator::Validate;

use crate::models::{
    DEFAULT_RULE_DOMAIN, ExtractionConfig, ExtractionRule, NewTrackedPage, TrackedPage,
    UNKNOWN_TITLE,
};
use crate::repository::Repository;
use crate::scraper::{HttpFetcher, prune_response};
use crate::utils::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageChange {
    pub title_changed: bool,
    pub content_changed: bool,
}

/// Result of comparing a fresh fetch against the stored page state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The page could not be fetched this time. Nothing is known about changes.
    FetchFailed { message: String },
    /// No usable extraction rule or the rule could not be applied.
    ExtractionFailed { message: String },
    Unchanged,
    Changed(PageChange),
}

/// Result of a full check-and-persist pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    FetchFailed { message: String },
    ExtractionFailed { message: String },
    Unchanged,
    Updated(PageChange),
    /// A change was detected and applied in memory but the write failed.
    PersistFailed { change: PageChange, message: String },
}

impl UpdateOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            UpdateOutcome::FetchFailed { .. } => "fetch_failed",
            UpdateOutcome::ExtractionFailed { .. } => "extraction_failed",
            UpdateOutcome::Unchanged => "unchanged",
            UpdateOutcome::Updated(_) => "updated",
            UpdateOutcome::PersistFailed { .. } => "persist_failed",
        }
    }
}

/// Content-changed rule. An empty extraction never counts as a change, and
/// only the overlapping prefix (bounded by `max_tracked_entries`) is compared,
/// so a longer list that starts with the stored entries is not a change
/// either. A first non-empty extraction for a page without entries is.
pub fn content_changed(current: &[String], new: &[String], max_tracked_entries: usize) -> bool {
    if new.is_empty() {
        return false;
    }
    if current.is_empty() {
        return true;
    }

    let bound = max_tracked_entries.min(current.len()).min(new.len());
    current[..bound] != new[..bound]
}

#[derive(Clone)]
pub struct ContentDiffEngine {
    repo: Arc<dyn Repository>,
    fetcher: Arc<dyn HttpFetcher>,
}

impl ContentDiffEngine {
    pub fn new(repo: Arc<dyn Repository>, fetcher: Arc<dyn HttpFetcher>) -> Self {
        Self { repo, fetcher }
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Fetch the page and apply any detected change to `page` in memory.
    /// Never persists.
    pub async fn check(&self, page: &mut TrackedPage) -> CheckOutcome {
        let body = match self.fetcher.get(&page.url).await {
            Ok(body) => body,
            Err(e) => {
                if page.title.is_empty() {
                    page.title = UNKNOWN_TITLE.to_string();
                }
                tracing::warn!(url = %page.url, "could not check page: {}", e);
                return CheckOutcome::FetchFailed {
                    message: e.to_string(),
                };
            }
        };

        let normalized = prune_response(&body, &page.extraction_config.separator);

        let rule = match self.resolve_rule(page).await {
            Ok(rule) => rule,
            Err(e) => {
                tracing::error!(url = %page.url, "fail to load extraction rule: {}", e);
                return CheckOutcome::ExtractionFailed {
                    message: e.to_string(),
                };
            }
        };

        let extraction = match rule.extract(&body, &normalized) {
            Ok(extraction) => extraction,
            Err(e) => {
                tracing::error!(url = %page.url, rule = %rule.domain, "fail to extract page: {}", e);
                return CheckOutcome::ExtractionFailed {
                    message: e.to_string(),
                };
            }
        };

        let entries = strip_separator(extraction.entries, &page.extraction_config.separator);
        if entries.is_empty() {
            counter!("web_history_empty_extractions_total").increment(1);
            tracing::warn!(url = %page.url, rule = %rule.domain, "extraction produced no entries");
        }
        // An empty title never replaces the stored one
        if extraction.title.is_empty() {
            counter!("web_history_empty_titles_total").increment(1);
            tracing::warn!(url = %page.url, rule = %rule.domain, "extraction produced no title");
        }

        let change = PageChange {
            title_changed: !extraction.title.is_empty() && extraction.title != page.title,
            content_changed: content_changed(
                &page.entries(),
                &entries,
                page.extraction_config.max_tracked_entries,
            ),
        };

        if !change.title_changed && !change.content_changed {
            tracing::debug!(url = %page.url, "page unchanged");
            return CheckOutcome::Unchanged;
        }

        if change.title_changed {
            tracing::info!(url = %page.url, "title changed: {:?} -> {:?}", page.title, extraction.title);
            page.title = extraction.title;
        }
        if change.content_changed {
            tracing::info!(url = %page.url, "content changed");
            page.set_entries(&entries);
        }
        page.touch();

        CheckOutcome::Changed(change)
    }

    /// Check the page and persist it when something changed. Failures are
    /// logged and reported through the outcome, never returned as errors.
    pub async fn update(&self, page: &mut TrackedPage) -> UpdateOutcome {
        let outcome = match self.check(page).await {
            CheckOutcome::FetchFailed { message } => UpdateOutcome::FetchFailed { message },
            CheckOutcome::ExtractionFailed { message } => UpdateOutcome::ExtractionFailed { message },
            CheckOutcome::Unchanged => UpdateOutcome::Unchanged,
            CheckOutcome::Changed(change) => match self.repo.update_website(page).await {
                Ok(()) => {
                    tracing::info!(url = %page.url, "page updated");
                    UpdateOutcome::Updated(change)
                }
                Err(e) => {
                    tracing::error!(url = %page.url, "fail to persist page: {}", e);
                    UpdateOutcome::PersistFailed {
                        change,
                        message: e.to_string(),
                    }
                }
            },
        };

        counter!("web_history_page_checks_total", "outcome" => outcome.label()).increment(1);
        outcome
    }

    /// Register a new page: check it right away, then store it.
    pub async fn register(
        &self,
        new_page: NewTrackedPage,
        extraction_config: ExtractionConfig,
    ) -> Result<TrackedPage> {
        new_page.validate()?;

        let mut page = TrackedPage::new(new_page, extraction_config);
        let outcome = self.check(&mut page).await;
        tracing::info!(url = %page.url, "registering page after check: {:?}", outcome);

        let stored = self.repo.create_website(&page).await?;
        if stored.id != page.id {
            tracing::info!(url = %stored.url, "page already tracked as {}", stored.id);
        }
        Ok(stored)
    }

    /// Rule for the page's hostname, else the stored `default` rule, else the
    /// built-in fallback.
    async fn resolve_rule(&self, page: &TrackedPage) -> Result<ExtractionRule> {
        if let Some(hostname) = page.hostname() {
            if let Some(rule) = self.repo.find_website_setting(&hostname).await? {
                return Ok(rule);
            }
        }

        Ok(self
            .repo
            .find_website_setting(DEFAULT_RULE_DOMAIN)
            .await?
            .unwrap_or_else(ExtractionRule::fallback))
    }
}

/// Entries are stored joined by the separator, so an entry must not contain it.
fn strip_separator(entries: Vec<String>, separator: &str) -> Vec<String> {
    entries
        .into_iter()
        .map(|entry| {
            if entry.contains(separator) {
                entry.replace(separator, " ").trim().to_string()
            } else {
                entry
            }
        })
        .filter(|entry| !entry.is_empty())
        .collect()
}
