use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::config::DatabaseConfig;
use crate::models::{ExtractionConfig, ExtractionRule, TrackedPage};
use crate::repository::Repository;
use crate::utils::error::{AppError, Result};

const SCHEMA: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS websites (
        id TEXT PRIMARY KEY,
        url TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL DEFAULT '',
        raw_content TEXT NOT NULL DEFAULT '',
        last_update_time TIMESTAMP NOT NULL,
        separator TEXT NOT NULL,
        max_tracked_entries INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS website_settings (
        domain TEXT PRIMARY KEY,
        title_regex TEXT,
        content_regex TEXT,
        title_selector TEXT,
        entry_selector TEXT,
        focus_index_from INTEGER NOT NULL DEFAULT 0,
        focus_index_to INTEGER NOT NULL DEFAULT 0
    )
    "#,
];

#[derive(Debug, FromRow)]
struct WebsiteRow {
    id: String,
    url: String,
    title: String,
    raw_content: String,
    last_update_time: DateTime<Utc>,
    separator: String,
    max_tracked_entries: i64,
}

impl From<WebsiteRow> for TrackedPage {
    fn from(row: WebsiteRow) -> Self {
        Self {
            id: row.id,
            url: row.url,
            title: row.title,
            raw_content: row.raw_content,
            last_update_time: row.last_update_time,
            extraction_config: ExtractionConfig {
                separator: row.separator,
                max_tracked_entries: row.max_tracked_entries.max(0) as usize,
            },
        }
    }
}

#[derive(Debug, FromRow)]
struct WebsiteSettingRow {
    domain: String,
    title_regex: Option<String>,
    content_regex: Option<String>,
    title_selector: Option<String>,
    entry_selector: Option<String>,
    focus_index_from: i64,
    focus_index_to: i64,
}

impl From<WebsiteSettingRow> for ExtractionRule {
    fn from(row: WebsiteSettingRow) -> Self {
        Self {
            domain: row.domain,
            title_regex: row.title_regex,
            content_regex: row.content_regex,
            title_selector: row.title_selector,
            entry_selector: row.entry_selector,
            focus_index_from: row.focus_index_from as i32,
            focus_index_to: row.focus_index_to as i32,
        }
    }
}

#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        Ok(Self::new(pool))
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!("website schema is up to date");
        Ok(())
    }

    pub async fn upsert_website_setting(&self, rule: &ExtractionRule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO website_settings
                (domain, title_regex, content_regex, title_selector, entry_selector,
                 focus_index_from, focus_index_to)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(domain) DO UPDATE SET
                title_regex = excluded.title_regex,
                content_regex = excluded.content_regex,
                title_selector = excluded.title_selector,
                entry_selector = excluded.entry_selector,
                focus_index_from = excluded.focus_index_from,
                focus_index_to = excluded.focus_index_to
            "#,
        )
        .bind(&rule.domain)
        .bind(&rule.title_regex)
        .bind(&rule.content_regex)
        .bind(&rule.title_selector)
        .bind(&rule.entry_selector)
        .bind(rule.focus_index_from as i64)
        .bind(rule.focus_index_to as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn create_website(&self, page: &TrackedPage) -> Result<TrackedPage> {
        sqlx::query(
            r#"
            INSERT INTO websites
                (id, url, title, raw_content, last_update_time, separator, max_tracked_entries)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO NOTHING
            "#,
        )
        .bind(&page.id)
        .bind(&page.url)
        .bind(&page.title)
        .bind(&page.raw_content)
        .bind(page.last_update_time)
        .bind(&page.extraction_config.separator)
        .bind(page.extraction_config.max_tracked_entries as i64)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, WebsiteRow>(
            r#"
            SELECT id, url, title, raw_content, last_update_time, separator, max_tracked_entries
            FROM websites
            WHERE url = ?
            "#,
        )
        .bind(&page.url)
        .fetch_one(&self.pool)
        .await?;

        Ok(TrackedPage::from(row))
    }

    async fn update_website(&self, page: &TrackedPage) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE websites
            SET title = ?, raw_content = ?, last_update_time = ?,
                separator = ?, max_tracked_entries = ?
            WHERE id = ?
            "#,
        )
        .bind(&page.title)
        .bind(&page.raw_content)
        .bind(page.last_update_time)
        .bind(&page.extraction_config.separator)
        .bind(page.extraction_config.max_tracked_entries as i64)
        .bind(&page.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound {
                resource: format!("website {}", page.id),
            });
        }
        Ok(())
    }

    async fn find_websites(&self) -> Result<Vec<TrackedPage>> {
        let rows = sqlx::query_as::<_, WebsiteRow>(
            r#"
            SELECT id, url, title, raw_content, last_update_time, separator, max_tracked_entries
            FROM websites
            ORDER BY url
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(TrackedPage::from).collect())
    }

    async fn find_website(&self, id: &str) -> Result<TrackedPage> {
        let row = sqlx::query_as::<_, WebsiteRow>(
            r#"
            SELECT id, url, title, raw_content, last_update_time, separator, max_tracked_entries
            FROM websites
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TrackedPage::from).ok_or_else(|| AppError::NotFound {
            resource: format!("website {}", id),
        })
    }

    async fn find_website_setting(&self, domain: &str) -> Result<Option<ExtractionRule>> {
        let row = sqlx::query_as::<_, WebsiteSettingRow>(
            r#"
            SELECT domain, title_regex, content_regex, title_selector, entry_selector,
                   focus_index_from, focus_index_to
            FROM website_settings
            WHERE domain = ?
            "#,
        )
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ExtractionRule::from))
    }
}
