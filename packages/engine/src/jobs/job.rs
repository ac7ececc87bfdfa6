//! The queue-row model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

pub const JOB_TYPE_CAPTURE: &str = "capture";
pub const JOB_TYPE_DELIVER: &str = "deliver";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// A durable queue entry.
///
/// The payload is an opaque JSON document owned by the job type's handler.
/// Succeeded and failed rows are retained for audit; only the task rows they
/// acted on carry user-facing state.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Higher runs first.
    pub priority: i32,
    pub run_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lease_until: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A fresh pending job, runnable immediately.
    pub fn new(job_type: &str, payload: serde_json::Value, priority: i32, max_attempts: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            payload,
            status: JobStatus::Pending,
            priority,
            run_at: now,
            locked_by: None,
            locked_at: None,
            lease_until: None,
            attempts: 0,
            max_attempts,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub async fn insert(&self, executor: impl sqlx::PgExecutor<'_>) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, job_type, payload, status, priority, run_at,
                locked_by, locked_at, lease_until,
                attempts, max_attempts, last_error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(self.id)
        .bind(&self.job_type)
        .bind(&self.payload)
        .bind(self.status)
        .bind(self.priority)
        .bind(self.run_at)
        .bind(&self.locked_by)
        .bind(self.locked_at)
        .bind(self.lease_until)
        .bind(self.attempts)
        .bind(self.max_attempts)
        .bind(&self.last_error)
        .bind(self.created_at)
        .bind(self.updated_at)
        .execute(executor)
        .await?;

        Ok(())
    }

    pub async fn find_by_id(
        id: Uuid,
        executor: impl sqlx::PgExecutor<'_>,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT id, job_type, payload, status, priority, run_at,
                   locked_by, locked_at, lease_until,
                   attempts, max_attempts, last_error, created_at, updated_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(executor)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_immediately_runnable() {
        let job = Job::new(JOB_TYPE_CAPTURE, serde_json::json!({"k": "v"}), 0, 3);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.run_at <= Utc::now());
        assert!(job.locked_by.is_none());
        assert!(job.lease_until.is_none());
    }

    #[test]
    fn status_serializes_as_short_string() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Succeeded).unwrap(),
            "\"succeeded\""
        );
        assert_eq!(
            serde_json::to_string(&JobStatus::Pending).unwrap(),
            "\"pending\""
        );
    }
}
