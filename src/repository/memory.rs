use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::models::{ExtractionRule, TrackedPage};
use crate::repository::Repository;
use crate::utils::error::{AppError, Result};

#[derive(Default)]
pub struct InMemoryRepository {
    pages: RwLock<Vec<TrackedPage>>,
    settings: RwLock<HashMap<String, ExtractionRule>>,
}

impl InMemoryRepository {
    pub fn new(pages: Vec<TrackedPage>, settings: Vec<ExtractionRule>) -> Self {
        Self {
            pages: RwLock::new(pages),
            settings: RwLock::new(
                settings
                    .into_iter()
                    .map(|rule| (rule.domain.clone(), rule))
                    .collect(),
            ),
        }
    }

    pub async fn upsert_website_setting(&self, rule: &ExtractionRule) -> Result<()> {
        let mut settings = self.settings.write().await;
        settings.insert(rule.domain.clone(), rule.clone());
        Ok(())
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn create_website(&self, page: &TrackedPage) -> Result<TrackedPage> {
        let mut pages = self.pages.write().await;
        if let Some(existing) = pages.iter().find(|p| p.url == page.url) {
            return Ok(existing.clone());
        }
        pages.push(page.clone());
        Ok(page.clone())
    }

    async fn update_website(&self, page: &TrackedPage) -> Result<()> {
        let mut pages = self.pages.write().await;
        match pages.iter_mut().find(|p| p.id == page.id) {
            Some(stored) => {
                *stored = page.clone();
                Ok(())
            }
            None => Err(AppError::NotFound {
                resource: format!("website {}", page.id),
            }),
        }
    }

    async fn find_websites(&self) -> Result<Vec<TrackedPage>> {
        let pages = self.pages.read().await;
        Ok(pages.clone())
    }

    async fn find_website(&self, id: &str) -> Result<TrackedPage> {
        let pages = self.pages.read().await;
        pages
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| AppError::NotFound {
                resource: format!("website {}", id),
            })
    }

    async fn find_website_setting(&self, domain: &str) -> Result<Option<ExtractionRule>> {
        let settings = self.settings.read().await;
        Ok(settings.get(domain).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtractionConfig, NewTrackedPage};

    fn page(url: &str) -> TrackedPage {
        TrackedPage::new(NewTrackedPage { url: url.to_string() }, ExtractionConfig::default())
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let repo = InMemoryRepository::default();
        let page = page("https://example.com");

        repo.create_website(&page).await.unwrap();

        assert_eq!(repo.find_websites().await.unwrap(), vec![page.clone()]);
        assert_eq!(repo.find_website(&page.id).await.unwrap(), page);
        assert!(matches!(
            repo.find_website("missing").await,
            Err(AppError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_is_idempotent_per_url() {
        let repo = InMemoryRepository::default();
        let first = repo.create_website(&page("https://example.com")).await.unwrap();
        let second = repo.create_website(&page("https://example.com")).await.unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(repo.find_websites().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_website() {
        let mut page = page("https://example.com");
        let repo = InMemoryRepository::new(vec![page.clone()], vec![]);

        page.title = "Updated".to_string();
        repo.update_website(&page).await.unwrap();
        assert_eq!(repo.find_website(&page.id).await.unwrap().title, "Updated");

        let unknown = self::page("https://other.com");
        assert!(repo.update_website(&unknown).await.is_err());
    }

    #[tokio::test]
    async fn test_website_settings() {
        let rule = ExtractionRule {
            domain: "example.com".to_string(),
            ..Default::default()
        };
        let repo = InMemoryRepository::new(vec![], vec![rule.clone()]);

        assert_eq!(repo.find_website_setting("example.com").await.unwrap(), Some(rule));
        assert_eq!(repo.find_website_setting("other.com").await.unwrap(), None);

        repo.upsert_website_setting(&ExtractionRule::fallback()).await.unwrap();
        assert!(repo.find_website_setting("default").await.unwrap().is_some());
    }
}
