use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::domain::{Role, TopicId, UnreadEntry};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use tokio::sync::Mutex;
use tracing::debug;

/// Durable `(role, topic) -> count` store backing the unread-counter sink.
///
/// Implementations must make `increment` atomic: several engine processes
/// (one per browser tab or device) can race on the same key.
#[async_trait]
pub trait UnreadStore: Send + Sync {
    async fn increment(&self, role: Role, topic_id: &TopicId) -> Result<i64>;
    async fn count(&self, role: Role, topic_id: &TopicId) -> Result<i64>;
    async fn mark_read(&self, role: Role, topic_id: &TopicId) -> Result<()>;
    async fn list(&self, role: Role) -> Result<Vec<UnreadEntry>>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to `sqlite::memory:` opens its own empty database.
        let pool = if database_url.starts_with("sqlite::memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        }
        .connect_with(connect_options)
        .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn increment_unread(&self, role: Role, topic_id: &TopicId) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO unread_counters (role, topic_id, count) VALUES (?, ?, 1)
             ON CONFLICT(role, topic_id) DO UPDATE
                SET count = count + 1, updated_at = CURRENT_TIMESTAMP
             RETURNING count",
        )
        .bind(role.as_str())
        .bind(topic_id.as_str())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to increment unread counter for {role}/{topic_id}"))?;
        let count = row.get::<i64, _>(0);
        debug!(%role, %topic_id, count, "unread counter incremented");
        Ok(count)
    }

    pub async fn unread_count(&self, role: Role, topic_id: &TopicId) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT count FROM unread_counters WHERE role = ? AND topic_id = ?",
        )
        .bind(role.as_str())
        .bind(topic_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.unwrap_or(0))
    }

    pub async fn mark_read(&self, role: Role, topic_id: &TopicId) -> Result<()> {
        sqlx::query(
            "UPDATE unread_counters SET count = 0, updated_at = CURRENT_TIMESTAMP
             WHERE role = ? AND topic_id = ?",
        )
        .bind(role.as_str())
        .bind(topic_id.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to reset unread counter for {role}/{topic_id}"))?;
        Ok(())
    }

    pub async fn list_unread(&self, role: Role) -> Result<Vec<UnreadEntry>> {
        let rows = sqlx::query(
            "SELECT topic_id, count FROM unread_counters
             WHERE role = ? AND count > 0
             ORDER BY topic_id",
        )
        .bind(role.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| UnreadEntry {
                role,
                topic_id: TopicId(row.get::<String, _>(0)),
                count: row.get::<i64, _>(1),
            })
            .collect())
    }
}

#[async_trait]
impl UnreadStore for Storage {
    async fn increment(&self, role: Role, topic_id: &TopicId) -> Result<i64> {
        self.increment_unread(role, topic_id).await
    }

    async fn count(&self, role: Role, topic_id: &TopicId) -> Result<i64> {
        self.unread_count(role, topic_id).await
    }

    async fn mark_read(&self, role: Role, topic_id: &TopicId) -> Result<()> {
        Storage::mark_read(self, role, topic_id).await
    }

    async fn list(&self, role: Role) -> Result<Vec<UnreadEntry>> {
        self.list_unread(role).await
    }
}

/// Process-local store for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryUnreadStore {
    counters: Mutex<HashMap<(Role, TopicId), i64>>,
}

impl MemoryUnreadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UnreadStore for MemoryUnreadStore {
    async fn increment(&self, role: Role, topic_id: &TopicId) -> Result<i64> {
        let mut guard = self.counters.lock().await;
        let count = guard.entry((role, topic_id.clone())).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn count(&self, role: Role, topic_id: &TopicId) -> Result<i64> {
        let guard = self.counters.lock().await;
        Ok(guard.get(&(role, topic_id.clone())).copied().unwrap_or(0))
    }

    async fn mark_read(&self, role: Role, topic_id: &TopicId) -> Result<()> {
        let mut guard = self.counters.lock().await;
        if let Some(count) = guard.get_mut(&(role, topic_id.clone())) {
            *count = 0;
        }
        Ok(())
    }

    async fn list(&self, role: Role) -> Result<Vec<UnreadEntry>> {
        let guard = self.counters.lock().await;
        let mut entries: Vec<UnreadEntry> = guard
            .iter()
            .filter(|((entry_role, _), count)| *entry_role == role && **count > 0)
            .map(|((_, topic_id), count)| UnreadEntry {
                role,
                topic_id: topic_id.clone(),
                count: *count,
            })
            .collect();
        entries.sort_by(|left, right| left.topic_id.cmp(&right.topic_id));
        Ok(entries)
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
