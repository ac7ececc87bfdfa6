//! Email delivery scheduling.
//!
//! The engine builds the message and decrypts the SMTP password in the
//! narrowest possible scope; the actual SMTP dialog belongs to an injected
//! [`MailTransport`]. Deployments wire in their transport of choice, tests
//! wire in a recorder, and a deployment without email configured gets
//! [`DisabledMailTransport`], which fails every send with a clear error.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::{Attachment, DeliveryNote, DeliverySender};
use crate::crypto::SecretBox;
use crate::models::DeliveryChannel;

/// The decoded `target_config` envelope for email deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTarget {
    pub smtp: SmtpTargetConfig,
    pub to: Vec<String>,
    #[serde(default)]
    pub subject: String,
}

/// SMTP settings as persisted: the password is base64 of AES-GCM ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpTargetConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password_enc: Option<String>,
    #[serde(default)]
    pub from_name: String,
    pub from_email: String,
    #[serde(default = "default_true")]
    pub use_tls: bool,
}

fn default_true() -> bool {
    true
}

/// SMTP settings with the password decrypted, alive only for the send call.
/// Deliberately not `Debug` or `Serialize`: the plaintext must not escape.
#[derive(Clone)]
pub struct SmtpServer {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub from_name: String,
    pub from_email: String,
    pub use_tls: bool,
}

impl SmtpServer {
    /// `Name <addr>` when a display name is configured, bare address otherwise.
    pub fn from_header(&self) -> String {
        if self.from_name.is_empty() {
            self.from_email.clone()
        } else {
            format!("{} <{}>", self.from_name, self.from_email)
        }
    }
}

/// One outgoing message, transport-agnostic.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

/// The SMTP wire protocol, owned by the embedding application.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, server: &SmtpServer, message: &EmailMessage) -> Result<()>;
}

/// Transport for deployments without email: every send fails loudly, which
/// surfaces as a normal delivery failure with retries and a final `failed`
/// delivery row.
pub struct DisabledMailTransport;

#[async_trait]
impl MailTransport for DisabledMailTransport {
    async fn send(&self, _server: &SmtpServer, _message: &EmailMessage) -> Result<()> {
        bail!("no mail transport configured")
    }
}

pub struct EmailSender {
    transport: std::sync::Arc<dyn MailTransport>,
    secrets: SecretBox,
}

impl EmailSender {
    pub fn new(transport: std::sync::Arc<dyn MailTransport>, secrets: SecretBox) -> Self {
        Self { transport, secrets }
    }

    fn decrypt_server(&self, config: &SmtpTargetConfig) -> Result<SmtpServer> {
        let password = match config.password_enc.as_deref() {
            Some(sealed_b64) => {
                let sealed = base64::engine::general_purpose::STANDARD
                    .decode(sealed_b64)
                    .context("smtp password is not valid base64")?;
                Some(
                    self.secrets
                        .open_string(&sealed)
                        .context("smtp password decryption failed")?,
                )
            }
            None => None,
        };

        Ok(SmtpServer {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            password,
            from_name: config.from_name.clone(),
            from_email: config.from_email.clone(),
            use_tls: config.use_tls,
        })
    }
}

#[async_trait]
impl DeliverySender for EmailSender {
    fn channel(&self) -> DeliveryChannel {
        DeliveryChannel::Email
    }

    async fn send(
        &self,
        target_config: &str,
        note: &DeliveryNote,
        attachments: &[Attachment],
    ) -> Result<()> {
        let target: EmailTarget =
            serde_json::from_str(target_config).context("invalid email target config")?;
        if target.to.is_empty() {
            bail!("email target has no recipients");
        }

        let server = self.decrypt_server(&target.smtp)?;

        let subject = if target.subject.is_empty() {
            match note.title.as_deref() {
                Some(title) if !title.is_empty() => format!("Page capture: {title}"),
                _ => format!("Page capture: {}", note.url),
            }
        } else {
            target.subject.clone()
        };

        let message = EmailMessage {
            to: target.to.clone(),
            subject,
            body: format!(
                "Your capture of {} is attached ({} file{}).",
                note.url,
                attachments.len(),
                if attachments.len() == 1 { "" } else { "s" }
            ),
            attachments: attachments.to_vec(),
        };

        self.transport.send(&server, &message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    /// Records sends instead of speaking SMTP.
    struct RecordingTransport {
        sent: Mutex<Vec<(String, EmailMessage)>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MailTransport for RecordingTransport {
        async fn send(&self, server: &SmtpServer, message: &EmailMessage) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((server.password.clone().unwrap_or_default(), message.clone()));
            Ok(())
        }
    }

    fn note() -> DeliveryNote {
        DeliveryNote {
            task_id: Uuid::new_v4(),
            url: "https://example.com/".into(),
            title: Some("Example Domain".into()),
            completed_at: None,
        }
    }

    fn target_json(secrets: &SecretBox, subject: &str) -> String {
        let sealed = secrets.seal(b"hunter2").unwrap();
        serde_json::json!({
            "smtp": {
                "host": "smtp.example.com",
                "port": 587,
                "username": "mailer",
                "password_enc": base64::engine::general_purpose::STANDARD.encode(sealed),
                "from_email": "captures@example.com",
                "use_tls": true,
            },
            "to": ["user@example.com"],
            "subject": subject,
        })
        .to_string()
    }

    #[tokio::test]
    async fn send_decrypts_password_and_builds_message() {
        let secrets = SecretBox::new(&[9u8; 32]).unwrap();
        let transport = RecordingTransport::new();
        let sender = EmailSender::new(transport.clone(), secrets.clone());

        let attachments = vec![Attachment {
            filename: "capture.pdf".into(),
            content_type: "application/pdf".into(),
            bytes: vec![1, 2, 3],
        }];
        sender
            .send(&target_json(&secrets, "Your capture"), &note(), &attachments)
            .await
            .unwrap();

        let sent = transport.sent.lock().unwrap();
        let (password, message) = &sent[0];
        assert_eq!(password, "hunter2");
        assert_eq!(message.to, vec!["user@example.com"]);
        assert_eq!(message.subject, "Your capture");
        assert_eq!(message.attachments.len(), 1);
        assert!(message.body.contains("https://example.com/"));
        assert!(message.body.contains("1 file"));
    }

    #[tokio::test]
    async fn empty_subject_falls_back_to_page_title() {
        let secrets = SecretBox::new(&[9u8; 32]).unwrap();
        let transport = RecordingTransport::new();
        let sender = EmailSender::new(transport.clone(), secrets.clone());

        sender
            .send(&target_json(&secrets, ""), &note(), &[])
            .await
            .unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].1.subject, "Page capture: Example Domain");
    }

    #[tokio::test]
    async fn missing_recipients_is_an_error() {
        let secrets = SecretBox::new(&[9u8; 32]).unwrap();
        let sender = EmailSender::new(RecordingTransport::new(), secrets);
        let config = serde_json::json!({
            "smtp": {"host": "h", "port": 25, "from_email": "a@b"},
            "to": [],
        })
        .to_string();

        assert!(sender.send(&config, &note(), &[]).await.is_err());
    }

    #[tokio::test]
    async fn disabled_transport_always_fails() {
        let server = SmtpServer {
            host: "h".into(),
            port: 25,
            username: String::new(),
            password: None,
            from_name: String::new(),
            from_email: "a@b".into(),
            use_tls: false,
        };
        let message = EmailMessage {
            to: vec!["x@y".into()],
            subject: "s".into(),
            body: "b".into(),
            attachments: vec![],
        };
        assert!(DisabledMailTransport.send(&server, &message).await.is_err());
    }

    #[test]
    fn from_header_includes_display_name_when_set() {
        let mut server = SmtpServer {
            host: "h".into(),
            port: 25,
            username: String::new(),
            password: None,
            from_name: String::new(),
            from_email: "captures@example.com".into(),
            use_tls: true,
        };
        assert_eq!(server.from_header(), "captures@example.com");
        server.from_name = "Pagemail".into();
        assert_eq!(server.from_header(), "Pagemail <captures@example.com>");
    }
}
