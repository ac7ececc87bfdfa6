//! Webhook delivery over HTTP POST.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use super::{Attachment, DeliveryNote, DeliverySender};
use crate::crypto::SecretBox;
use crate::models::DeliveryChannel;

type HmacSha256 = Hmac<Sha256>;

const USER_AGENT: &str = "Pagemail-Webhook/1.0";

/// The decoded `target_config` envelope for webhook deliveries.
///
/// `secret_enc` is base64 of AES-GCM ciphertext; when present, the request
/// carries an HMAC-SHA256 signature of the JSON payload so receivers can
/// authenticate the sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTarget {
    pub url: String,
    #[serde(default)]
    pub secret_enc: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    event: &'a str,
    timestamp: String,
    data: serde_json::Value,
}

pub struct WebhookSender {
    client: reqwest::Client,
    secrets: SecretBox,
}

impl WebhookSender {
    pub fn new(client: reqwest::Client, secrets: SecretBox) -> Self {
        Self { client, secrets }
    }

    fn signature(secret: &str, payload: &[u8]) -> String {
        // HMAC accepts keys of any length; new_from_slice cannot fail.
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key of any length");
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn decrypt_secret(&self, target: &WebhookTarget) -> Result<Option<String>> {
        let Some(sealed_b64) = target.secret_enc.as_deref() else {
            return Ok(None);
        };
        let sealed = base64::engine::general_purpose::STANDARD
            .decode(sealed_b64)
            .context("webhook secret is not valid base64")?;
        let secret = self
            .secrets
            .open_string(&sealed)
            .context("webhook secret decryption failed")?;
        Ok(Some(secret))
    }
}

#[async_trait]
impl DeliverySender for WebhookSender {
    fn channel(&self) -> DeliveryChannel {
        DeliveryChannel::Webhook
    }

    async fn send(
        &self,
        target_config: &str,
        note: &DeliveryNote,
        attachments: &[Attachment],
    ) -> Result<()> {
        let target: WebhookTarget =
            serde_json::from_str(target_config).context("invalid webhook target config")?;

        let payload = WebhookPayload {
            event: "capture.completed",
            timestamp: Utc::now().to_rfc3339(),
            data: serde_json::json!({
                "task_id": note.task_id,
                "url": note.url,
                "title": note.title,
                "completed_at": note.completed_at,
                "attachment_count": attachments.len(),
            }),
        };
        let payload_json = serde_json::to_vec(&payload)?;

        let mut request = self
            .client
            .post(&target.url)
            .header(reqwest::header::USER_AGENT, USER_AGENT);

        for (name, value) in &target.headers {
            request = request.header(name, value);
        }

        // The signature covers the JSON payload; for multipart requests that
        // is the `payload` part, not the framing around it.
        if let Some(secret) = self.decrypt_secret(&target)? {
            request = request.header("X-Pagemail-Signature", Self::signature(&secret, &payload_json));
        }

        let request = if attachments.is_empty() {
            request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(payload_json)
        } else {
            let mut form = reqwest::multipart::Form::new().part(
                "payload",
                reqwest::multipart::Part::bytes(payload_json)
                    .mime_str("application/json")
                    .context("payload mime")?,
            );
            for attachment in attachments {
                form = form.part(
                    "files",
                    reqwest::multipart::Part::bytes(attachment.bytes.clone())
                        .file_name(attachment.filename.clone())
                        .mime_str(&attachment.content_type)
                        .with_context(|| format!("attachment mime {}", attachment.content_type))?,
                );
            }
            request.multipart(form)
        };

        let response = request.send().await.context("webhook request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            bail!("webhook returned status {status}: {snippet}");
        }

        debug!(url = %target.url, task_id = %note.task_id, "webhook delivered");
        Ok(())
    }
}
