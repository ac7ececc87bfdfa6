//! Delivery records: one send-attempt ledger per task and channel.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "delivery_channel", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryChannel {
    Email,
    Webhook,
}

impl DeliveryChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryChannel::Email => "email",
            DeliveryChannel::Webhook => "webhook",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "delivery_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Sent,
    Failed,
}

/// One send attempt record for a task via one channel.
///
/// `target_config` is an opaque serialized envelope the channel's sender
/// decodes; credentials inside it are ciphertext. Sends are not idempotent,
/// so deliveries run as their own jobs and count attempts independently of
/// capture attempts.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Delivery {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub task_id: Uuid,
    pub channel: DeliveryChannel,
    pub target_config: String,
    #[builder(default)]
    pub status: DeliveryStatus,
    #[builder(default = 0)]
    pub attempts: i32,
    #[builder(default = 3)]
    pub max_attempts: i32,
    #[builder(default, setter(strip_option))]
    pub last_error: Option<String>,
    #[builder(default, setter(strip_option))]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Delivery {
    pub async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Option<Self>> {
        let delivery = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, task_id, channel, target_config, status, attempts,
                   max_attempts, last_error, next_retry_at,
                   created_at, updated_at, completed_at
            FROM deliveries
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(delivery)
    }

    pub async fn insert(&self, executor: impl sqlx::PgExecutor<'_>) -> Result<Self> {
        let delivery = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO deliveries (
                id, task_id, channel, target_config, status, attempts,
                max_attempts, last_error, next_retry_at,
                created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id, task_id, channel, target_config, status, attempts,
                      max_attempts, last_error, next_retry_at,
                      created_at, updated_at, completed_at
            "#,
        )
        .bind(self.id)
        .bind(self.task_id)
        .bind(self.channel)
        .bind(&self.target_config)
        .bind(self.status)
        .bind(self.attempts)
        .bind(self.max_attempts)
        .bind(&self.last_error)
        .bind(self.next_retry_at)
        .bind(self.created_at)
        .bind(self.updated_at)
        .bind(self.completed_at)
        .fetch_one(executor)
        .await?;

        Ok(delivery)
    }

    pub async fn mark_sent(id: Uuid, db: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deliveries
            SET status = 'sent', completed_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Record one failed send attempt. Exhausting `max_attempts` flips the
    /// delivery to `failed`; the caller propagates the error so the queue's
    /// job attempts advance in lockstep.
    pub async fn record_failure(
        id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
        db: &PgPool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deliveries
            SET attempts = attempts + 1,
                last_error = $2,
                next_retry_at = $3,
                status = CASE
                    WHEN attempts + 1 >= max_attempts THEN 'failed'::delivery_status
                    ELSE 'pending'::delivery_status
                END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(retry_at)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Terminal failure for unsendable deliveries (bad envelope, unknown
    /// channel). No retry will follow.
    pub async fn mark_failed(id: Uuid, error: &str, db: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deliveries
            SET status = 'failed', last_error = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(db)
        .await?;

        Ok(())
    }
}
