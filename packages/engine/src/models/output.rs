//! Artifact catalog rows.
//!
//! The Blob Store holds the bytes; these rows are the authoritative catalog
//! mapping `(task_id, format)` to an object key, size, and SHA-256 digest.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::OutputFormat;

/// One artifact produced for a task-format pair.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct CaptureOutput {
    pub id: Uuid,
    pub task_id: Uuid,
    pub format: OutputFormat,
    pub storage_backend: String,
    pub object_key: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

impl CaptureOutput {
    pub fn new(
        task_id: Uuid,
        format: OutputFormat,
        storage_backend: &str,
        object_key: String,
        size_bytes: i64,
        sha256: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            format,
            storage_backend: storage_backend.to_string(),
            object_key,
            content_type: format.content_type().to_string(),
            size_bytes,
            sha256,
            created_at: Utc::now(),
        }
    }

    /// Insert the catalog row. A re-executed capture (lease expiry, retry)
    /// overwrites its own `(task_id, format)` slot, so double execution
    /// stays harmless.
    pub async fn insert(&self, executor: impl sqlx::PgExecutor<'_>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO capture_outputs (
                id, task_id, format, storage_backend, object_key,
                content_type, size_bytes, sha256, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (task_id, format) DO UPDATE SET
                storage_backend = EXCLUDED.storage_backend,
                object_key = EXCLUDED.object_key,
                content_type = EXCLUDED.content_type,
                size_bytes = EXCLUDED.size_bytes,
                sha256 = EXCLUDED.sha256
            "#,
        )
        .bind(self.id)
        .bind(self.task_id)
        .bind(self.format)
        .bind(&self.storage_backend)
        .bind(&self.object_key)
        .bind(&self.content_type)
        .bind(self.size_bytes)
        .bind(&self.sha256)
        .bind(self.created_at)
        .execute(executor)
        .await?;

        Ok(())
    }

    pub async fn list_for_task(task_id: Uuid, db: &PgPool) -> Result<Vec<Self>> {
        let outputs = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, task_id, format, storage_backend, object_key,
                   content_type, size_bytes, sha256, created_at
            FROM capture_outputs
            WHERE task_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(db)
        .await?;

        Ok(outputs)
    }

    /// Filename presented to delivery recipients.
    pub fn attachment_filename(&self) -> String {
        format!(
            "{}_{}.{}",
            self.task_id,
            self.format.as_str(),
            self.format.extension()
        )
    }
}

/// Deterministic blob key for one artifact:
/// `captures/<YYYY>/<MM>/<DD>/<yyyymmddHHMMSSuuuuuu>_<task_uuid>_<format>.<ext>`.
///
/// The key is derived from `(timestamp, task_id, format)` so a retried
/// capture overwrites its own objects instead of leaking new ones.
pub fn object_key(now: DateTime<Utc>, task_id: Uuid, format: OutputFormat) -> String {
    format!(
        "captures/{}/{}{:06}_{}_{}.{}",
        now.format("%Y/%m/%d"),
        now.format("%Y%m%d%H%M%S"),
        now.timestamp_subsec_micros(),
        task_id,
        format.as_str(),
        format.extension()
    )
}
