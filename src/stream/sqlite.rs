use async_trait::async_trait;
use sqlx::FromRow;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::config::StreamConfig;
use crate::stream::{ConsumerGroup, DurableStream, StreamMessage, now_millis};
use crate::utils::error::{AppError, Result};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS stream_entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        stream TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stream_groups (
        stream TEXT NOT NULL,
        grp TEXT NOT NULL,
        last_delivered_id INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (stream, grp)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stream_pending (
        stream TEXT NOT NULL,
        grp TEXT NOT NULL,
        entry_id INTEGER NOT NULL,
        consumer TEXT NOT NULL,
        delivered_at INTEGER NOT NULL,
        deliveries INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (stream, grp, entry_id)
    )
    "#,
];

#[derive(Debug, FromRow)]
struct EntryRow {
    id: i64,
    payload: String,
}

impl TryFrom<EntryRow> for StreamMessage {
    type Error = AppError;

    fn try_from(row: EntryRow) -> Result<Self> {
        Ok(Self {
            id: row.id.to_string(),
            values: serde_json::from_str(&row.payload)?,
        })
    }
}

/// Stream stored in a SQLite database. Several processes sharing the same
/// database file form one deployment, and entries survive restarts.
#[derive(Clone)]
pub struct SqliteStream {
    pool: SqlitePool,
    claim_idle: Duration,
    poll_interval: Duration,
}

impl SqliteStream {
    pub async fn connect(config: &StreamConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let stream = Self::new(pool, config.claim_idle(), config.poll_interval());
        stream.migrate().await?;
        Ok(stream)
    }

    pub fn new(pool: SqlitePool, claim_idle: Duration, poll_interval: Duration) -> Self {
        Self {
            pool,
            claim_idle,
            poll_interval,
        }
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn entries(&self, ids: &[i64]) -> Result<Vec<StreamMessage>> {
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query_as::<_, EntryRow>("SELECT id, payload FROM stream_entries WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                messages.push(StreamMessage::try_from(row)?);
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl DurableStream for SqliteStream {
    async fn publish(&self, stream: &str, values: HashMap<String, String>) -> Result<String> {
        let result = sqlx::query("INSERT INTO stream_entries (stream, payload, created_at) VALUES (?, ?, ?)")
            .bind(stream)
            .bind(serde_json::to_string(&values)?)
            .bind(now_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.last_insert_rowid().to_string())
    }

    async fn acknowledge(&self, group: &ConsumerGroup, id: &str) -> Result<()> {
        let id: i64 = id
            .parse()
            .map_err(|_| AppError::InvalidParams(format!("invalid stream entry id {}", id)))?;

        sqlx::query("DELETE FROM stream_pending WHERE stream = ? AND grp = ? AND entry_id = ?")
            .bind(&group.stream)
            .bind(&group.group)
            .bind(id)
            .execute(&self.pool)
            .await?;

        // Entries below every group's oldest pending or undelivered entry are done
        sqlx::query(
            r#"
            DELETE FROM stream_entries
            WHERE stream = ? AND id < (
                SELECT MIN(COALESCE(
                    (SELECT MIN(p.entry_id) FROM stream_pending p
                     WHERE p.stream = g.stream AND p.grp = g.grp),
                    g.last_delivered_id + 1
                ))
                FROM stream_groups g
                WHERE g.stream = ?
            )
            "#,
        )
        .bind(&group.stream)
        .bind(&group.stream)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ensure_group(&self, group: &ConsumerGroup) -> Result<()> {
        sqlx::query(
            "INSERT INTO stream_groups (stream, grp, last_delivered_id) VALUES (?, ?, 0) ON CONFLICT DO NOTHING",
        )
        .bind(&group.stream)
        .bind(&group.group)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_pending(&self, group: &ConsumerGroup) -> Result<Vec<StreamMessage>> {
        let rows = sqlx::query_as::<_, EntryRow>(
            r#"
            SELECT e.id, e.payload
            FROM stream_pending p
            JOIN stream_entries e ON e.id = p.entry_id
            WHERE p.stream = ? AND p.grp = ? AND p.consumer = ?
            ORDER BY e.id
            "#,
        )
        .bind(&group.stream)
        .bind(&group.group)
        .bind(&group.consumer)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StreamMessage::try_from).collect()
    }

    async fn claim_idle(&self, group: &ConsumerGroup, min_idle: Duration) -> Result<Vec<StreamMessage>> {
        let now = now_millis();
        let mut ids: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE stream_pending
            SET consumer = ?, delivered_at = ?, deliveries = deliveries + 1
            WHERE stream = ? AND grp = ? AND delivered_at <= ?
            RETURNING entry_id
            "#,
        )
        .bind(&group.consumer)
        .bind(now)
        .bind(&group.stream)
        .bind(&group.group)
        .bind(now - min_idle.as_millis() as i64)
        .fetch_all(&self.pool)
        .await?;

        if !ids.is_empty() {
            tracing::info!(stream = %group.stream, "claimed {} idle entries", ids.len());
        }
        ids.sort_unstable();
        self.entries(&ids).await
    }

    async fn read_next(&self, group: &ConsumerGroup) -> Result<Option<StreamMessage>> {
        let mut tx = self.pool.begin().await?;

        // Advancing the group cursor in one statement keeps concurrent
        // consumers from receiving the same entry
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE stream_groups
            SET last_delivered_id = (
                SELECT MIN(id) FROM stream_entries
                WHERE stream = stream_groups.stream AND id > stream_groups.last_delivered_id
            )
            WHERE stream = ? AND grp = ? AND EXISTS (
                SELECT 1 FROM stream_entries
                WHERE stream = stream_groups.stream AND id > stream_groups.last_delivered_id
            )
            RETURNING last_delivered_id
            "#,
        )
        .bind(&group.stream)
        .bind(&group.group)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(id) = id else {
            tx.commit().await?;
            return Ok(None);
        };

        sqlx::query(
            r#"
            INSERT INTO stream_pending (stream, grp, entry_id, consumer, delivered_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&group.stream)
        .bind(&group.group)
        .bind(id)
        .bind(&group.consumer)
        .bind(now_millis())
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, EntryRow>("SELECT id, payload FROM stream_entries WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(StreamMessage::try_from(row)?))
    }

    async fn wait_for_entries(&self) {
        tokio::time::sleep(self.poll_interval).await;
    }

    fn claim_idle_after(&self) -> Duration {
        self.claim_idle
    }
}
