//! Workers: the entities that actually execute leased jobs.
//!
//! A fixed pool of workers drains the dispatcher's channel, one job at a
//! time per worker. Each worker lazily opens its own browser on the first
//! capture and reuses it until shutdown; browsers are never shared.
//!
//! Failure policy, in one place:
//!
//! - bad input (unparseable payload, missing rows, blocked URL, unknown
//!   format) fails the *task* and succeeds the *job*, since retrying bad
//!   input only thrashes the queue;
//! - transient trouble (browser, navigation, storage, database) fails the
//!   job so the queue applies backoff, and marks the task failed only once
//!   the job exhausts its attempts;
//! - a lost lease means another holder owns the job now; the worker logs it
//!   and walks away without double-updating.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use pagemail_capture::{parse_cookie_header, Browser, BrowserConfig, CaptureError, CaptureOptions};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::crypto::SecretBox;
use crate::jobs::{
    backoff, Job, JobQueue, JobStatus, QueueError, JOB_TYPE_CAPTURE, JOB_TYPE_DELIVER,
};
use crate::models::{
    object_key, CaptureOutput, CaptureTask, Delivery, DeliveryChannel, DeliveryStatus, OutputFormat,
};
use crate::notify::{Attachment, DeliveryNote, DeliverySender};
use crate::storage::BlobStore;

/// Payload of a `capture` job. Cookies here are plaintext only when the
/// caller chose to pass them inline; the submit path leaves this empty and
/// stores ciphertext on the task instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturePayload {
    pub task_id: Uuid,
    pub url: String,
    #[serde(default)]
    pub cookies: String,
    pub formats: Vec<String>,
}

/// Payload of a `deliver` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverPayload {
    pub delivery_id: Uuid,
}

/// How a job run ended, from the queue's point of view.
#[derive(Debug, Error)]
pub enum JobError {
    /// Bad input; retrying cannot help. The job is marked succeeded so the
    /// queue is not thrashed; the task carries the user-facing failure.
    #[error("{0}")]
    Terminal(String),

    /// Transient; the queue applies backoff and retries.
    #[error(transparent)]
    Retry(#[from] anyhow::Error),
}

impl From<sqlx::Error> for JobError {
    fn from(e: sqlx::Error) -> Self {
        JobError::Retry(e.into())
    }
}

/// Dependencies shared by every worker in the pool.
pub struct WorkerContext {
    pub db: PgPool,
    pub queue: JobQueue,
    pub store: Arc<dyn BlobStore>,
    pub secrets: SecretBox,
    pub senders: HashMap<DeliveryChannel, Arc<dyn DeliverySender>>,
    pub browser_config: BrowserConfig,
    /// Backend name recorded on each output row.
    pub storage_backend: String,
    /// The dispatcher's lease identity; completes and fails must present it.
    pub lease_owner: String,
}

pub struct Worker {
    id: usize,
    ctx: Arc<WorkerContext>,
    browser: Option<Browser>,
}

impl Worker {
    pub fn new(id: usize, ctx: Arc<WorkerContext>) -> Self {
        Self {
            id,
            ctx,
            browser: None,
        }
    }

    /// Drain the shared channel until shutdown. An in-flight job always runs
    /// to completion; cancellation is only observed between jobs.
    pub async fn run(
        mut self,
        rx: Arc<Mutex<mpsc::Receiver<Job>>>,
        cancel: CancellationToken,
    ) {
        info!(worker = self.id, "worker started");

        loop {
            let job = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    job = rx.recv() => job,
                }
            };

            match job {
                Some(job) => self.process(job).await,
                None => break,
            }
        }

        if let Some(browser) = self.browser.take() {
            browser.close().await;
        }
        info!(worker = self.id, "worker stopped");
    }

    async fn process(&mut self, job: Job) {
        info!(
            worker = self.id,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "processing job"
        );

        let outcome = match job.job_type.as_str() {
            JOB_TYPE_CAPTURE => self.process_capture(&job).await,
            JOB_TYPE_DELIVER => self.process_delivery(&job).await,
            other => Err(JobError::Terminal(format!("unknown job type: {other}"))),
        };

        match outcome {
            Ok(()) => {
                self.complete_job(&job).await;
                info!(worker = self.id, job_id = %job.id, "job completed");
            }
            Err(JobError::Terminal(reason)) => {
                warn!(worker = self.id, job_id = %job.id, reason = %reason, "job failed terminally");
                self.complete_job(&job).await;
            }
            Err(JobError::Retry(err)) => {
                self.fail_job(&job, &err.to_string()).await;
            }
        }
    }

    async fn complete_job(&self, job: &Job) {
        match self.ctx.queue.complete(job.id, &self.ctx.lease_owner).await {
            Ok(()) => {}
            Err(QueueError::NotRunning(_)) => {
                info!(worker = self.id, job_id = %job.id, "lease lost before completion");
            }
            Err(e) => {
                error!(worker = self.id, job_id = %job.id, error = %e, "failed to mark job succeeded");
            }
        }
    }

    async fn fail_job(&self, job: &Job, error_msg: &str) {
        match self
            .ctx
            .queue
            .fail(job.id, &self.ctx.lease_owner, error_msg)
            .await
        {
            Ok(JobStatus::Failed) => {
                error!(
                    worker = self.id,
                    job_id = %job.id,
                    error = %error_msg,
                    "job failed permanently"
                );
                // A capture job out of attempts takes its task down with it.
                if job.job_type == JOB_TYPE_CAPTURE {
                    if let Ok(payload) =
                        serde_json::from_value::<CapturePayload>(job.payload.clone())
                    {
                        self.fail_task(payload.task_id, error_msg).await;
                    }
                }
            }
            Ok(_) => {
                warn!(
                    worker = self.id,
                    job_id = %job.id,
                    attempt = job.attempts + 1,
                    error = %error_msg,
                    "job failed, will retry"
                );
            }
            Err(QueueError::NotRunning(_)) => {
                info!(worker = self.id, job_id = %job.id, "lease lost before failure report");
            }
            Err(e) => {
                error!(worker = self.id, job_id = %job.id, error = %e, "failed to mark job failed");
            }
        }
    }

    async fn fail_task(&self, task_id: Uuid, error_msg: &str) {
        if let Err(e) = CaptureTask::mark_failed(task_id, error_msg, &self.ctx.db).await {
            error!(task_id = %task_id, error = %e, "failed to mark task failed");
        }
    }

    async fn ensure_browser(&mut self) -> Result<(), CaptureError> {
        if self.browser.is_none() {
            let browser = Browser::open(self.ctx.browser_config.clone()).await?;
            info!(worker = self.id, "browser opened");
            self.browser = Some(browser);
        }
        Ok(())
    }

    async fn process_capture(&mut self, job: &Job) -> Result<(), JobError> {
        let payload: CapturePayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| JobError::Terminal(format!("invalid capture payload: {e}")))?;

        let task = CaptureTask::find_by_id(payload.task_id, &self.ctx.db)
            .await
            .map_err(JobError::Retry)?
            .ok_or_else(|| JobError::Terminal(format!("task {} not found", payload.task_id)))?;

        let formats = match requested_formats(&payload.formats) {
            Ok(formats) => formats,
            Err(reason) => {
                self.fail_task(task.id, &reason).await;
                return Err(JobError::Terminal(reason));
            }
        };

        CaptureTask::mark_running(task.id, &self.ctx.db)
            .await
            .map_err(JobError::Retry)?;

        // Browser trouble is transient: leave the task running and let the
        // queue back off.
        self.ensure_browser()
            .await
            .map_err(|e| JobError::Retry(anyhow!(e)))?;
        let Some(browser) = self.browser.as_ref() else {
            return Err(JobError::Retry(anyhow!("browser not initialized")));
        };

        // Cookies are decrypted here and nowhere else; the plaintext lives
        // for the duration of the capture call.
        let cookies = if !payload.cookies.is_empty() {
            parse_cookie_header(&payload.cookies)
        } else if let Some(sealed) = task.cookies_enc.as_deref() {
            match self.ctx.secrets.open_string(sealed) {
                Ok(plaintext) => parse_cookie_header(&plaintext),
                Err(e) => {
                    let reason = format!("cookie decryption failed: {e}");
                    self.fail_task(task.id, &reason).await;
                    return Err(JobError::Terminal(reason));
                }
            }
        } else {
            Vec::new()
        };

        let opts = CaptureOptions {
            url: payload.url.clone(),
            cookies,
            viewport_width: task.viewport_width.max(0) as u32,
            viewport_height: task.viewport_height.max(0) as u32,
            user_agent: task.user_agent.clone(),
            timeout: Some(Duration::from_millis(task.wait_timeout_ms.max(0) as u64)),
        };

        info!(
            worker = self.id,
            job_id = %job.id,
            task_id = %task.id,
            url = %payload.url,
            formats = ?payload.formats,
            "starting browser capture"
        );

        let result = match browser.capture(&opts).await {
            Ok(result) => result,
            Err(e @ CaptureError::Blocked(_)) => {
                let reason = e.to_string();
                self.fail_task(task.id, &reason).await;
                return Err(JobError::Terminal(reason));
            }
            Err(e) => return Err(JobError::Retry(anyhow!(e))),
        };

        debug!(
            task_id = %task.id,
            html_size = result.html.len(),
            pdf_size = result.pdf.len(),
            screenshot_size = result.screenshot.len(),
            "capture finished, persisting outputs"
        );

        let now = Utc::now();
        let mut outputs = Vec::new();
        for format in formats {
            let bytes = match format {
                OutputFormat::Pdf => &result.pdf,
                OutputFormat::Html => &result.html,
                OutputFormat::Screenshot => &result.screenshot,
            };
            if bytes.is_empty() {
                continue;
            }

            let digest = hex::encode(Sha256::digest(bytes));
            let key = object_key(now, task.id, format);
            let info = self
                .ctx
                .store
                .put(&key, bytes, format.content_type())
                .await
                .map_err(|e| JobError::Retry(anyhow!(e)))?;

            outputs.push(CaptureOutput::new(
                task.id,
                format,
                &self.ctx.storage_backend,
                key,
                info.size,
                digest,
            ));
        }

        if outputs.is_empty() {
            self.fail_task(task.id, "no outputs generated").await;
            return Err(JobError::Retry(anyhow!("no outputs generated")));
        }

        // Outputs and the completed status land in one transaction so the
        // output set is never observed half-populated.
        let mut tx = self.ctx.db.begin().await?;
        for output in &outputs {
            output.insert(&mut *tx).await?;
        }
        CaptureTask::mark_completed(task.id, &mut *tx).await?;
        tx.commit().await?;

        info!(
            worker = self.id,
            task_id = %task.id,
            output_count = outputs.len(),
            "capture task completed"
        );
        Ok(())
    }

    async fn process_delivery(&self, job: &Job) -> Result<(), JobError> {
        let payload: DeliverPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| JobError::Terminal(format!("invalid deliver payload: {e}")))?;

        let delivery = Delivery::find_by_id(payload.delivery_id, &self.ctx.db)
            .await
            .map_err(JobError::Retry)?
            .ok_or_else(|| {
                JobError::Terminal(format!("delivery {} not found", payload.delivery_id))
            })?;

        // A recovered or re-leased job may find its work already done.
        if delivery.status == DeliveryStatus::Sent {
            debug!(delivery_id = %delivery.id, "delivery already sent, nothing to do");
            return Ok(());
        }

        let task = CaptureTask::find_by_id(delivery.task_id, &self.ctx.db)
            .await
            .map_err(JobError::Retry)?
            .ok_or_else(|| JobError::Terminal(format!("task {} not found", delivery.task_id)))?;

        let outputs = CaptureOutput::list_for_task(delivery.task_id, &self.ctx.db)
            .await
            .map_err(JobError::Retry)?;

        let mut attachments = Vec::with_capacity(outputs.len());
        for output in &outputs {
            let (bytes, _) = self
                .ctx
                .store
                .get(&output.object_key)
                .await
                .map_err(|e| JobError::Retry(anyhow!(e)))?;
            attachments.push(Attachment {
                filename: output.attachment_filename(),
                content_type: output.content_type.clone(),
                bytes,
            });
        }

        let note = DeliveryNote {
            task_id: task.id,
            url: task.url.clone(),
            title: None,
            completed_at: task.completed_at,
        };

        let Some(sender) = self.ctx.senders.get(&delivery.channel) else {
            let reason = format!("no sender registered for channel {}", delivery.channel.as_str());
            if let Err(e) = Delivery::mark_failed(delivery.id, &reason, &self.ctx.db).await {
                error!(delivery_id = %delivery.id, error = %e, "failed to mark delivery failed");
            }
            return Err(JobError::Terminal(reason));
        };

        info!(
            worker = self.id,
            job_id = %job.id,
            task_id = %task.id,
            delivery_id = %delivery.id,
            channel = delivery.channel.as_str(),
            attempt = delivery.attempts,
            "sending delivery"
        );

        match sender
            .send(&delivery.target_config, &note, &attachments)
            .await
        {
            Ok(()) => {
                Delivery::mark_sent(delivery.id, &self.ctx.db)
                    .await
                    .map_err(JobError::Retry)?;
                Ok(())
            }
            Err(e) => {
                // Delivery attempts advance in lockstep with the job's own
                // attempt counter; both exhaust together.
                let delay = backoff(delivery.attempts + 1);
                let retry_at = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(3_600));
                // Error text never includes the target config: it can
                // reference credentialed URLs.
                let err_text = e.to_string();
                Delivery::record_failure(delivery.id, &err_text, retry_at, &self.ctx.db)
                    .await
                    .map_err(JobError::Retry)?;
                Err(JobError::Retry(e))
            }
        }
    }
}

/// Resolve the payload's requested format names. Unknown names and an empty
/// list are task-level fatal; duplicates collapse.
fn requested_formats(names: &[String]) -> Result<Vec<OutputFormat>, String> {
    if names.is_empty() {
        return Err("no formats requested".to_string());
    }
    let mut formats = Vec::new();
    for name in names {
        let format = OutputFormat::from_str(&name.to_lowercase())
            .ok_or_else(|| format!("unknown format: {name}"))?;
        if !formats.contains(&format) {
            formats.push(format);
        }
    }
    Ok(formats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requested_formats_accepts_known_names() {
        assert_eq!(
            requested_formats(&["pdf".into(), "html".into(), "screenshot".into()]).unwrap(),
            vec![OutputFormat::Pdf, OutputFormat::Html, OutputFormat::Screenshot]
        );
    }

    #[test]
    fn requested_formats_is_case_insensitive_and_dedupes() {
        assert_eq!(
            requested_formats(&["PDF".into(), "pdf".into(), "Html".into()]).unwrap(),
            vec![OutputFormat::Pdf, OutputFormat::Html]
        );
    }

    #[test]
    fn requested_formats_rejects_unknown_and_empty() {
        assert!(requested_formats(&[]).is_err());
        assert!(requested_formats(&["png".into()]).is_err());
        assert!(requested_formats(&["pdf".into(), "gif".into()]).is_err());
    }

    #[test]
    fn capture_payload_roundtrips_through_json() {
        let payload = CapturePayload {
            task_id: Uuid::new_v4(),
            url: "https://example.com/".into(),
            cookies: String::new(),
            formats: vec!["pdf".into(), "screenshot".into()],
        };
        let value = serde_json::to_value(&payload).unwrap();
        let back: CapturePayload = serde_json::from_value(value).unwrap();
        assert_eq!(back.task_id, payload.task_id);
        assert_eq!(back.formats, payload.formats);
    }

    #[test]
    fn capture_payload_tolerates_missing_cookies_field() {
        let value = serde_json::json!({
            "task_id": Uuid::new_v4(),
            "url": "https://example.com/",
            "formats": ["html"],
        });
        let payload: CapturePayload = serde_json::from_value(value).unwrap();
        assert!(payload.cookies.is_empty());
    }

    #[test]
    fn unknown_job_type_text_is_terminal_shaped() {
        let err = JobError::Terminal("unknown job type: compact".into());
        assert_eq!(err.to_string(), "unknown job type: compact");
    }
}
