//! The user-facing capture request unit.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// One request to capture a URL in some subset of formats.
///
/// `formats` is a non-zero bit-set over `FORMAT_PDF | FORMAT_HTML |
/// FORMAT_PNG`. Cookies are stored only as AES-GCM ciphertext and decrypted
/// inside the capture call.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct CaptureTask {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub url: String,
    #[builder(default)]
    pub status: TaskStatus,
    pub formats: i32,
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing, default)]
    pub cookies_enc: Option<Vec<u8>>,
    #[builder(default, setter(strip_option))]
    pub user_agent: Option<String>,
    #[builder(default = 1920)]
    pub viewport_width: i32,
    #[builder(default = 1080)]
    pub viewport_height: i32,
    #[builder(default = 30_000)]
    pub wait_timeout_ms: i32,
    #[builder(default = 0)]
    pub attempts: i32,
    #[builder(default = 3)]
    pub max_attempts: i32,
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
}

impl CaptureTask {
    pub async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Option<Self>> {
        let task = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, url, status, formats, cookies_enc, user_agent,
                   viewport_width, viewport_height, wait_timeout_ms,
                   attempts, max_attempts, error_message,
                   created_at, updated_at, completed_at
            FROM capture_tasks
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(task)
    }

    pub async fn insert(&self, executor: impl sqlx::PgExecutor<'_>) -> Result<Self> {
        let task = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO capture_tasks (
                id, url, status, formats, cookies_enc, user_agent,
                viewport_width, viewport_height, wait_timeout_ms,
                attempts, max_attempts, error_message,
                created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING id, url, status, formats, cookies_enc, user_agent,
                      viewport_width, viewport_height, wait_timeout_ms,
                      attempts, max_attempts, error_message,
                      created_at, updated_at, completed_at
            "#,
        )
        .bind(self.id)
        .bind(&self.url)
        .bind(self.status)
        .bind(self.formats)
        .bind(&self.cookies_enc)
        .bind(&self.user_agent)
        .bind(self.viewport_width)
        .bind(self.viewport_height)
        .bind(self.wait_timeout_ms)
        .bind(self.attempts)
        .bind(self.max_attempts)
        .bind(&self.error_message)
        .bind(self.created_at)
        .bind(self.updated_at)
        .bind(self.completed_at)
        .fetch_one(executor)
        .await?;

        Ok(task)
    }

    pub async fn mark_running(id: Uuid, db: &PgPool) -> Result<()> {
        sqlx::query(
            "UPDATE capture_tasks SET status = 'running', updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Terminal success. Must run in the same transaction that inserts the
    /// task's outputs so callers never observe a partial output set.
    pub async fn mark_completed(id: Uuid, executor: impl sqlx::PgExecutor<'_>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE capture_tasks
            SET status = 'completed', completed_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Terminal failure; `error_message` is set only here.
    pub async fn mark_failed(id: Uuid, error: &str, db: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE capture_tasks
            SET status = 'failed', error_message = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Delete the task row; outputs and deliveries go with it via cascade.
    /// Returns whether a row was deleted. Blob cleanup is the caller's job.
    pub async fn delete(id: Uuid, db: &PgPool) -> Result<bool> {
        let result = sqlx::query("DELETE FROM capture_tasks WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
