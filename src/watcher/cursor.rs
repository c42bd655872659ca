//! Resume Cursor Persistence
//!
//! One cursor per named subscription. `save` overwrites; the watcher only
//! ever saves positions in feed order, so the stored cursor is monotonic.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::{PgPool, Row};

use crate::db::Database;
use crate::error::LedgerError;
use crate::store::ResumeCursor;

#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Last saved position for `subscription`, if any
    async fn load(&self, subscription: &str) -> Result<Option<ResumeCursor>, LedgerError>;

    async fn save(&self, subscription: &str, cursor: &ResumeCursor) -> Result<(), LedgerError>;
}

/// Process-local cursor store
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: DashMap<String, ResumeCursor>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, subscription: &str) -> Option<ResumeCursor> {
        self.cursors.get(subscription).map(|c| c.value().clone())
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, subscription: &str) -> Result<Option<ResumeCursor>, LedgerError> {
        Ok(self.get(subscription))
    }

    async fn save(&self, subscription: &str, cursor: &ResumeCursor) -> Result<(), LedgerError> {
        self.cursors.insert(subscription.to_string(), cursor.clone());
        Ok(())
    }
}

/// PostgreSQL cursor store (`watch_cursors` table)
#[derive(Clone)]
pub struct PgCursorStore {
    pool: PgPool,
}

impl PgCursorStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Create the cursor table if it does not exist
    pub async fn ensure_schema(&self) -> Result<(), LedgerError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS watch_cursors (
                   subscription TEXT PRIMARY KEY,
                   resume_token TEXT NOT NULL,
                   updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
               )"#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CursorStore for PgCursorStore {
    async fn load(&self, subscription: &str) -> Result<Option<ResumeCursor>, LedgerError> {
        let row = sqlx::query("SELECT resume_token FROM watch_cursors WHERE subscription = $1")
            .bind(subscription)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| ResumeCursor::new(r.get::<String, _>("resume_token"))))
    }

    async fn save(&self, subscription: &str, cursor: &ResumeCursor) -> Result<(), LedgerError> {
        sqlx::query(
            r#"INSERT INTO watch_cursors (subscription, resume_token)
               VALUES ($1, $2)
               ON CONFLICT (subscription) DO UPDATE
               SET resume_token = EXCLUDED.resume_token,
                   updated_at = NOW()"#,
        )
        .bind(subscription)
        .bind(cursor.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
