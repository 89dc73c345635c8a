use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use url::{Host, Url};
use validator::Validate;

use crate::config::WebsiteConfig;
use crate::models::generate_id;

/// Placeholder title for pages that could never be fetched.
pub const UNKNOWN_TITLE: &str = "unknown";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractionConfig {
    pub separator: String,
    pub max_tracked_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackedPage {
    pub id: String,
    pub url: String,
    pub title: String,

    // Recent entries joined by `extraction_config.separator`, newest first
    pub raw_content: String,

    // Time of the last detected change, not of the last fetch
    pub last_update_time: DateTime<Utc>,

    pub extraction_config: ExtractionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewTrackedPage {
    #[validate(url)]
    pub url: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self::from(&WebsiteConfig::default())
    }
}

impl From<&WebsiteConfig> for ExtractionConfig {
    fn from(config: &WebsiteConfig) -> Self {
        Self {
            separator: config.separator.clone(),
            max_tracked_entries: config.max_tracked_entries,
        }
    }
}

impl TrackedPage {
    pub fn new(new_page: NewTrackedPage, extraction_config: ExtractionConfig) -> Self {
        Self {
            id: generate_id(),
            url: new_page.url,
            title: String::new(),
            raw_content: String::new(),
            last_update_time: Utc::now().trunc_subsecs(0),
            extraction_config,
        }
    }

    /// Coordination key: the last two labels of the hostname. IP hosts are used
    /// as-is, and an unparsable URL yields an empty key.
    pub fn host(&self) -> String {
        let Ok(url) = Url::parse(&self.url) else {
            return String::new();
        };

        match url.host() {
            Some(Host::Domain(domain)) => {
                let labels: Vec<&str> = domain.split('.').collect();
                labels[labels.len().saturating_sub(2)..].join(".")
            }
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => String::new(),
        }
    }

    /// Full hostname, used to look up the page's extraction rule.
    pub fn hostname(&self) -> Option<String> {
        Url::parse(&self.url)
            .ok()
            .and_then(|url| url.host_str().map(|h| h.to_string()))
    }

    pub fn entries(&self) -> Vec<String> {
        if self.raw_content.is_empty() {
            return Vec::new();
        }

        self.raw_content
            .split(self.extraction_config.separator.as_str())
            .map(|s| s.to_string())
            .collect()
    }

    pub fn set_entries(&mut self, entries: &[String]) {
        let bound = entries.len().min(self.extraction_config.max_tracked_entries);
        self.raw_content = entries[..bound].join(&self.extraction_config.separator);
    }

    pub fn touch(&mut self) {
        self.last_update_time = Utc::now().trunc_subsecs(0);
    }
}
