//! The engine's public surface: construction, task intake, lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use pagemail_capture::BrowserConfig;
use sqlx::PgPool;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::crypto::SecretBox;
use crate::dispatcher::{run_recovery, Dispatcher};
use crate::jobs::{Job, JobQueue, JOB_TYPE_CAPTURE, JOB_TYPE_DELIVER};
use crate::models::{CaptureOutput, CaptureTask, Delivery, DeliveryChannel, OutputFormat};
use crate::notify::{DeliverySender, EmailSender, MailTransport, WebhookSender};
use crate::storage::BlobStore;
use crate::worker::{CapturePayload, DeliverPayload, Worker, WorkerContext};

/// How long shutdown waits for in-flight jobs before abandoning them to
/// lease recovery.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Everything a caller can specify when submitting a capture.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct CaptureRequest {
    pub url: String,
    /// Bit-set over `FORMAT_PDF | FORMAT_HTML | FORMAT_PNG`; must be non-zero.
    pub formats: i32,
    /// Plaintext `name=value; name=value` cookies; sealed before persisting.
    #[builder(default, setter(strip_option))]
    pub cookies: Option<String>,
    #[builder(default, setter(strip_option))]
    pub user_agent: Option<String>,
    #[builder(default, setter(strip_option))]
    pub viewport_width: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub viewport_height: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub wait_timeout_ms: Option<i32>,
    /// Higher runs first.
    #[builder(default = 0)]
    pub priority: i32,
}

/// The capture-and-delivery engine.
///
/// Holds no process-global state: the database pool, blob store, and mail
/// transport are all injected. Cheap to share behind an [`Arc`].
pub struct Engine {
    config: EngineConfig,
    db: PgPool,
    store: Arc<dyn BlobStore>,
    queue: JobQueue,
    secrets: SecretBox,
    senders: HashMap<DeliveryChannel, Arc<dyn DeliverySender>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        db: PgPool,
        store: Arc<dyn BlobStore>,
        mailer: Arc<dyn MailTransport>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let secrets = SecretBox::new(&config.encryption_key)?;
        let queue = JobQueue::new(db.clone(), config.max_retries);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build http client")?;

        let mut senders: HashMap<DeliveryChannel, Arc<dyn DeliverySender>> = HashMap::new();
        senders.insert(
            DeliveryChannel::Webhook,
            Arc::new(WebhookSender::new(http, secrets.clone())),
        );
        senders.insert(
            DeliveryChannel::Email,
            Arc::new(EmailSender::new(mailer, secrets.clone())),
        );

        Ok(Arc::new(Self {
            config,
            db,
            store,
            queue,
            secrets,
            senders,
        }))
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn db(&self) -> &PgPool {
        &self.db
    }

    /// Spawn the dispatcher, the recovery sweep, and the worker pool.
    pub fn start(self: &Arc<Self>) -> EngineHandle {
        let cancel = CancellationToken::new();
        // Ephemeral lease identity for this engine instance; only used to
        // track which process holds each lease.
        let lease_owner = Uuid::new_v4().to_string()[..8].to_string();

        info!(
            workers = self.config.workers,
            lease_owner = %lease_owner,
            "starting capture engine"
        );

        let (tx, rx) = mpsc::channel::<Job>(self.config.channel_size);
        let rx = Arc::new(Mutex::new(rx));

        let ctx = Arc::new(WorkerContext {
            db: self.db.clone(),
            queue: self.queue.clone(),
            store: self.store.clone(),
            secrets: self.secrets.clone(),
            senders: self.senders.clone(),
            browser_config: BrowserConfig {
                headless: true,
                viewport_width: self.config.viewport_width,
                viewport_height: self.config.viewport_height,
                user_agent: None,
                default_timeout: self.config.wait_timeout,
                chrome_path: self.config.chrome_path.clone(),
            },
            storage_backend: self.config.storage.backend.as_str().to_string(),
            lease_owner: lease_owner.clone(),
        });

        let mut tasks = Vec::with_capacity(self.config.workers + 2);

        for worker_id in 0..self.config.workers {
            let worker = Worker::new(worker_id, ctx.clone());
            tasks.push(tokio::spawn(worker.run(rx.clone(), cancel.clone())));
        }

        let dispatcher = Dispatcher::new(
            self.queue.clone(),
            lease_owner,
            self.config.poll_interval,
            self.config.batch_size,
            self.config.lease_duration,
            tx,
        );
        tasks.push(tokio::spawn(dispatcher.run(cancel.clone())));
        tasks.push(tokio::spawn(run_recovery(self.queue.clone(), cancel.clone())));

        EngineHandle { cancel, tasks }
    }

    /// Create a capture task and enqueue its job, atomically.
    pub async fn submit_capture(&self, request: CaptureRequest) -> Result<Uuid> {
        if request.url.is_empty() {
            bail!("capture url must not be empty");
        }
        let formats = OutputFormat::from_bits(request.formats);
        if formats.is_empty() {
            bail!("formats must include at least one of pdf, html, screenshot");
        }

        // Cookies never reach the queue payload; they live on the task row
        // as ciphertext until the capturing worker needs them.
        let cookies_enc = match request.cookies.as_deref().filter(|c| !c.is_empty()) {
            Some(cookies) => Some(self.secrets.seal(cookies.as_bytes())?),
            None => None,
        };

        let mut task = CaptureTask::builder()
            .url(request.url.clone())
            .formats(request.formats)
            .max_attempts(self.config.max_retries)
            .build();
        task.cookies_enc = cookies_enc;
        task.user_agent = request.user_agent;
        if let Some(width) = request.viewport_width {
            task.viewport_width = width;
        }
        if let Some(height) = request.viewport_height {
            task.viewport_height = height;
        }
        if let Some(timeout_ms) = request.wait_timeout_ms {
            task.wait_timeout_ms = timeout_ms;
        }

        let payload = CapturePayload {
            task_id: task.id,
            url: request.url,
            cookies: String::new(),
            formats: format_names(request.formats),
        };
        let job = Job::new(
            JOB_TYPE_CAPTURE,
            serde_json::to_value(&payload)?,
            request.priority,
            self.config.max_retries,
        );

        let mut tx = self.db.begin().await?;
        let task = task.insert(&mut *tx).await?;
        job.insert(&mut *tx).await?;
        tx.commit().await?;

        info!(task_id = %task.id, job_id = %job.id, "capture task submitted");
        Ok(task.id)
    }

    /// Create a delivery for a task and enqueue its job, atomically.
    pub async fn submit_delivery(
        &self,
        task_id: Uuid,
        channel: DeliveryChannel,
        target_config: serde_json::Value,
    ) -> Result<Uuid> {
        let task = CaptureTask::find_by_id(task_id, &self.db).await?;
        if task.is_none() {
            bail!("task {task_id} does not exist");
        }

        let delivery = Delivery::builder()
            .task_id(task_id)
            .channel(channel)
            .target_config(target_config.to_string())
            .max_attempts(self.config.max_retries)
            .build();

        let payload = DeliverPayload {
            delivery_id: delivery.id,
        };
        let job = Job::new(
            JOB_TYPE_DELIVER,
            serde_json::to_value(&payload)?,
            0,
            self.config.max_retries,
        );

        let mut tx = self.db.begin().await?;
        let delivery = delivery.insert(&mut *tx).await?;
        job.insert(&mut *tx).await?;
        tx.commit().await?;

        info!(
            task_id = %task_id,
            delivery_id = %delivery.id,
            channel = channel.as_str(),
            "delivery submitted"
        );
        Ok(delivery.id)
    }

    /// Delete a task and its children via cascade, then best-effort delete
    /// the blobs its outputs point at.
    pub async fn delete_task(&self, task_id: Uuid) -> Result<()> {
        let outputs = CaptureOutput::list_for_task(task_id, &self.db).await?;

        let deleted = CaptureTask::delete(task_id, &self.db).await?;
        if !deleted {
            bail!("task {task_id} does not exist");
        }

        for output in outputs {
            if let Err(e) = self.store.delete(&output.object_key).await {
                warn!(
                    task_id = %task_id,
                    object_key = %output.object_key,
                    error = %e,
                    "failed to delete artifact blob"
                );
            }
        }

        info!(task_id = %task_id, "task deleted");
        Ok(())
    }
}

/// Running engine background tasks; shut down to stop them.
pub struct EngineHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Stop polling, let in-flight jobs finish within a grace period, then
    /// abandon the rest to lease recovery.
    pub async fn shutdown(self) {
        info!("stopping capture engine");
        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        for task in self.tasks {
            let abort = task.abort_handle();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, task).await.is_err() {
                // Still running at grace expiry; its lease will expire and
                // the job will be recovered elsewhere.
                error!("engine task did not stop within grace period, abandoning");
                abort.abort();
            }
        }

        info!("capture engine stopped");
    }
}

/// Expand a format bit-set into payload format names, in capture order.
fn format_names(bits: i32) -> Vec<String> {
    OutputFormat::from_bits(bits)
        .into_iter()
        .map(|f| f.as_str().to_string())
        .collect()
}
