//! Delivery senders.
//!
//! The engine schedules deliveries; it does not own the wire protocols. Each
//! channel is represented by a [`DeliverySender`] that decodes the
//! delivery's opaque `target_config` envelope, decrypts any credentials at
//! the point of use, and pushes the task's artifacts out. The webhook sender
//! is self-contained; the email sender delegates the actual SMTP dialog to
//! an injected [`MailTransport`].

pub mod email;
pub mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::DeliveryChannel;

pub use email::{DisabledMailTransport, EmailMessage, EmailSender, MailTransport, SmtpServer};
pub use webhook::WebhookSender;

/// One artifact handed to a sender.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Task metadata included alongside the artifacts in outgoing payloads.
#[derive(Debug, Clone)]
pub struct DeliveryNote {
    pub task_id: Uuid,
    pub url: String,
    pub title: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A channel-specific sender. `target_config` is the delivery row's opaque
/// envelope; only the sender knows its shape.
#[async_trait]
pub trait DeliverySender: Send + Sync {
    fn channel(&self) -> DeliveryChannel;

    async fn send(
        &self,
        target_config: &str,
        note: &DeliveryNote,
        attachments: &[Attachment],
    ) -> anyhow::Result<()>;
}
