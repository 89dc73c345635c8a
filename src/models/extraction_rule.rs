use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

use crate::utils::error::{AppError, Result};

pub const DEFAULT_RULE_DOMAIN: &str = "default";

const FALLBACK_TITLE_REGEX: &str = r"(?i)<title[^>]*>(.*?)</title>";
const FALLBACK_CONTENT_REGEX: &str = r"(\d{4}[-/.]\d{1,2}[-/.]\d{1,2})";

/// How to pull a title and an ordered list of entries out of a fetched page.
///
/// Selectors run against the raw document, regexes against the normalized
/// stream produced by [`crate::scraper::prune_response`]. A selector wins over a
/// regex when both are set for the same field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ExtractionRule {
    pub domain: String,
    pub title_regex: Option<String>,
    pub content_regex: Option<String>,
    pub title_selector: Option<String>,
    pub entry_selector: Option<String>,
    pub focus_index_from: i32,
    pub focus_index_to: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub title: String,
    pub entries: Vec<String>,
}

impl ExtractionRule {
    /// Built-in rule used when neither the host nor `default` has a stored rule.
    pub fn fallback() -> Self {
        Self {
            domain: DEFAULT_RULE_DOMAIN.to_string(),
            title_regex: Some(FALLBACK_TITLE_REGEX.to_string()),
            content_regex: Some(FALLBACK_CONTENT_REGEX.to_string()),
            ..Default::default()
        }
    }

    pub fn extract(&self, raw: &str, normalized: &str) -> Result<Extraction> {
        let title = match (&self.title_selector, &self.title_regex) {
            (Some(selector), _) => collapse_whitespace(&select_texts(raw, selector)?.join(" ")),
            (None, Some(pattern)) => capture_all(normalized, pattern)?
                .into_iter()
                .next()
                .unwrap_or_default(),
            (None, None) => capture_all(normalized, FALLBACK_TITLE_REGEX)?
                .into_iter()
                .next()
                .unwrap_or_default(),
        };

        let entries = match (&self.entry_selector, &self.content_regex) {
            (Some(selector), _) => select_texts(raw, selector)?,
            (None, Some(pattern)) => capture_all(normalized, pattern)?,
            (None, None) => Vec::new(),
        };

        Ok(Extraction {
            title,
            entries: self.focus(entries),
        })
    }

    /// Apply the `[focus_index_from, focus_index_to)` window. Negative indices
    /// count from the end; a `to` of zero means through the end. When the
    /// resolved window is inverted the list is returned untouched.
    pub fn focus(&self, entries: Vec<String>) -> Vec<String> {
        let len = entries.len() as i64;
        let mut from = self.focus_index_from as i64;
        let mut to = self.focus_index_to as i64;

        if from < 0 {
            from = (len + from).max(0);
        } else if from > len {
            from = (len - 1).max(0);
        }

        if to <= 0 {
            to = len + to;
            if to < 0 {
                to = len;
            }
        } else if to > len {
            to = len;
        }

        if from <= to {
            entries[from as usize..to as usize].to_vec()
        } else {
            entries
        }
    }
}

fn capture_all(text: &str, pattern: &str) -> Result<Vec<String>> {
    let re = Regex::new(pattern).map_err(|e| AppError::Parse {
        message: format!("Invalid extraction regex '{}': {}", pattern, e),
    })?;

    Ok(re
        .captures_iter(text)
        .filter_map(|captures| captures.get(1).or_else(|| captures.get(0)))
        .map(|m| m.as_str().trim().to_string())
        .collect())
}

fn select_texts(raw: &str, selector: &str) -> Result<Vec<String>> {
    let document = Html::parse_document(raw);
    let css_selector = Selector::parse(selector).map_err(|e| AppError::Parse {
        message: format!("Invalid CSS selector '{}': {:?}", selector, e),
    })?;

    Ok(document
        .select(&css_selector)
        .map(|element| collapse_whitespace(&element.text().collect::<Vec<_>>().join(" ")))
        .filter(|text| !text.is_empty())
        .collect())
}

/// Stored entries are joined by the page separator, so each one stays on a single line.
fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
