//! Worker behavior tests, driven through the real channel and queue but
//! with fake delivery senders so no network or browser is involved.

mod common;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use pagemail_capture::BrowserConfig;
use pagemail_engine::crypto::SecretBox;
use pagemail_engine::jobs::{Job, JobQueue, JobStatus, JOB_TYPE_CAPTURE, JOB_TYPE_DELIVER};
use pagemail_engine::models::{
    CaptureOutput, CaptureTask, Delivery, DeliveryChannel, DeliveryStatus, OutputFormat,
    TaskStatus, FORMAT_HTML,
};
use pagemail_engine::notify::{Attachment, DeliveryNote, DeliverySender};
use pagemail_engine::storage::{BlobStore, LocalStore};
use pagemail_engine::worker::{CapturePayload, DeliverPayload, Worker, WorkerContext};
use sqlx::PgPool;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const LEASE: Duration = Duration::from_secs(300);
const LEASE_OWNER: &str = "test-disp";

/// Records every send; optionally fails them all.
struct FakeSender {
    channel: DeliveryChannel,
    fail_with: Option<String>,
    sent: StdMutex<Vec<(String, Uuid, Vec<Attachment>)>>,
}

impl FakeSender {
    fn ok(channel: DeliveryChannel) -> Arc<Self> {
        Arc::new(Self {
            channel,
            fail_with: None,
            sent: StdMutex::new(Vec::new()),
        })
    }

    fn failing(channel: DeliveryChannel, message: &str) -> Arc<Self> {
        Arc::new(Self {
            channel,
            fail_with: Some(message.to_string()),
            sent: StdMutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl DeliverySender for FakeSender {
    fn channel(&self) -> DeliveryChannel {
        self.channel
    }

    async fn send(
        &self,
        target_config: &str,
        note: &DeliveryNote,
        attachments: &[Attachment],
    ) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push((
            target_config.to_string(),
            note.task_id,
            attachments.to_vec(),
        ));
        match &self.fail_with {
            Some(message) => Err(anyhow::anyhow!("{message}")),
            None => Ok(()),
        }
    }
}

struct Harness {
    pool: PgPool,
    queue: JobQueue,
    store: Arc<LocalStore>,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn new(schema: &str) -> Option<Self> {
        let pool = common::test_pool(schema).await?;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::new(dir.path()).unwrap());
        Some(Self {
            queue: JobQueue::new(pool.clone(), 3),
            pool,
            store,
            _dir: dir,
        })
    }

    fn context(&self, sender: Arc<FakeSender>) -> Arc<WorkerContext> {
        let mut senders: HashMap<DeliveryChannel, Arc<dyn DeliverySender>> = HashMap::new();
        senders.insert(sender.channel(), sender);
        Arc::new(WorkerContext {
            db: self.pool.clone(),
            queue: self.queue.clone(),
            store: self.store.clone(),
            secrets: SecretBox::new(&[1u8; 32]).unwrap(),
            senders,
            browser_config: BrowserConfig::default(),
            storage_backend: "local".to_string(),
            lease_owner: LEASE_OWNER.to_string(),
        })
    }

    /// Lease every runnable job, run one worker over them, and wait for it
    /// to drain the channel and exit.
    async fn run_worker(&self, ctx: Arc<WorkerContext>) {
        let leased = self.queue.lease_batch(LEASE_OWNER, 10, LEASE).await.unwrap();
        assert!(!leased.is_empty(), "expected at least one leasable job");

        let (tx, rx) = mpsc::channel::<Job>(10);
        for job in leased {
            tx.send(job).await.unwrap();
        }
        drop(tx);

        let worker = Worker::new(0, ctx);
        worker
            .run(Arc::new(Mutex::new(rx)), CancellationToken::new())
            .await;
    }

    async fn job_status(&self, id: Uuid) -> JobStatus {
        Job::find_by_id(id, &self.pool).await.unwrap().unwrap().status
    }

    /// A completed task with one HTML artifact in the store.
    async fn seed_completed_task(&self) -> (Uuid, &'static str) {
        let task = CaptureTask::builder()
            .url("https://example.com/")
            .formats(FORMAT_HTML)
            .status(TaskStatus::Completed)
            .build();
        let task = task.insert(&self.pool).await.unwrap();

        let key = "captures/2025/08/01/seed_html.html";
        self.store
            .put(key, b"<html>seeded</html>", "text/html")
            .await
            .unwrap();
        CaptureOutput::new(
            task.id,
            OutputFormat::Html,
            "local",
            key.to_string(),
            19,
            "feed".into(),
        )
        .insert(&self.pool)
        .await
        .unwrap();

        (task.id, key)
    }
}

#[tokio::test]
async fn delivery_job_streams_artifacts_and_marks_sent() {
    let Some(harness) = Harness::new("worker_deliver_ok").await else {
        return;
    };
    let (task_id, _key) = harness.seed_completed_task().await;

    let delivery = Delivery::builder()
        .task_id(task_id)
        .channel(DeliveryChannel::Webhook)
        .target_config(r#"{"url":"https://hooks.example.com/x"}"#)
        .build()
        .insert(&harness.pool)
        .await
        .unwrap();
    let job_id = harness
        .queue
        .enqueue(JOB_TYPE_DELIVER, &DeliverPayload { delivery_id: delivery.id })
        .await
        .unwrap();

    let sender = FakeSender::ok(DeliveryChannel::Webhook);
    harness.run_worker(harness.context(sender.clone())).await;

    assert_eq!(harness.job_status(job_id).await, JobStatus::Succeeded);
    let delivery = Delivery::find_by_id(delivery.id, &harness.pool)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Sent);
    assert!(delivery.completed_at.is_some());

    let sent = sender.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let (config, sent_task, attachments) = &sent[0];
    assert!(config.contains("hooks.example.com"));
    assert_eq!(*sent_task, task_id);
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].bytes, b"<html>seeded</html>");
    assert_eq!(attachments[0].content_type, "text/html");
}

#[tokio::test]
async fn failed_send_advances_delivery_and_job_attempts_in_lockstep() {
    let Some(harness) = Harness::new("worker_deliver_fail").await else {
        return;
    };
    let (task_id, _key) = harness.seed_completed_task().await;

    let delivery = Delivery::builder()
        .task_id(task_id)
        .channel(DeliveryChannel::Webhook)
        .target_config(r#"{"url":"https://hooks.example.com/x"}"#)
        .build()
        .insert(&harness.pool)
        .await
        .unwrap();
    let job_id = harness
        .queue
        .enqueue(JOB_TYPE_DELIVER, &DeliverPayload { delivery_id: delivery.id })
        .await
        .unwrap();

    let sender = FakeSender::failing(DeliveryChannel::Webhook, "endpoint returned 500");
    harness.run_worker(harness.context(sender)).await;

    let job = Job::find_by_id(job_id, &harness.pool).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending, "transient failure retries");
    assert_eq!(job.attempts, 1);
    assert!(job.run_at > chrono::Utc::now(), "backoff pushed run_at out");

    let delivery = Delivery::find_by_id(delivery.id, &harness.pool)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Pending);
    assert_eq!(delivery.attempts, 1, "delivery attempts move with job attempts");
    assert_eq!(delivery.last_error.as_deref(), Some("endpoint returned 500"));
    assert!(delivery.next_retry_at.is_some());
}

#[tokio::test]
async fn already_sent_delivery_is_not_resent() {
    let Some(harness) = Harness::new("worker_deliver_idem").await else {
        return;
    };
    let (task_id, _key) = harness.seed_completed_task().await;

    let mut delivery = Delivery::builder()
        .task_id(task_id)
        .channel(DeliveryChannel::Webhook)
        .target_config(r#"{"url":"https://hooks.example.com/x"}"#)
        .build();
    delivery.status = DeliveryStatus::Sent;
    let delivery = delivery.insert(&harness.pool).await.unwrap();

    let job_id = harness
        .queue
        .enqueue(JOB_TYPE_DELIVER, &DeliverPayload { delivery_id: delivery.id })
        .await
        .unwrap();

    let sender = FakeSender::ok(DeliveryChannel::Webhook);
    harness.run_worker(harness.context(sender.clone())).await;

    assert_eq!(harness.job_status(job_id).await, JobStatus::Succeeded);
    assert!(sender.sent.lock().unwrap().is_empty(), "no duplicate send");
}

#[tokio::test]
async fn malformed_payload_succeeds_the_job_without_retry() {
    let Some(harness) = Harness::new("worker_bad_payload").await else {
        return;
    };

    let job_id = harness
        .queue
        .enqueue(JOB_TYPE_CAPTURE, &serde_json::json!({"oops": true}))
        .await
        .unwrap();

    let sender = FakeSender::ok(DeliveryChannel::Webhook);
    harness.run_worker(harness.context(sender)).await;

    // Bad input does not thrash the queue: the job terminates as succeeded.
    let job = Job::find_by_id(job_id, &harness.pool).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempts, 0);
}

#[tokio::test]
async fn unknown_format_fails_the_task_terminally() {
    let Some(harness) = Harness::new("worker_bad_format").await else {
        return;
    };

    let task = CaptureTask::builder()
        .url("https://example.com/")
        .formats(FORMAT_HTML)
        .build()
        .insert(&harness.pool)
        .await
        .unwrap();
    let job_id = harness
        .queue
        .enqueue(
            JOB_TYPE_CAPTURE,
            &CapturePayload {
                task_id: task.id,
                url: task.url.clone(),
                cookies: String::new(),
                formats: vec!["gif".into()],
            },
        )
        .await
        .unwrap();

    let sender = FakeSender::ok(DeliveryChannel::Webhook);
    harness.run_worker(harness.context(sender)).await;

    assert_eq!(harness.job_status(job_id).await, JobStatus::Succeeded);
    let task = CaptureTask::find_by_id(task.id, &harness.pool)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error_message.unwrap().contains("unknown format"));
}

fn chromium_available() -> bool {
    [
        "/usr/bin/chromium-browser",
        "/usr/bin/chromium",
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
    ]
    .iter()
    .any(|p| Path::new(p).exists())
}

#[tokio::test]
async fn metadata_endpoint_capture_is_blocked_not_retried() {
    if !chromium_available() {
        eprintln!("skipping: no chromium binary installed");
        return;
    }
    let Some(harness) = Harness::new("worker_ssrf").await else {
        return;
    };

    let task = CaptureTask::builder()
        .url("http://169.254.169.254/latest/meta-data/")
        .formats(FORMAT_HTML)
        .build()
        .insert(&harness.pool)
        .await
        .unwrap();
    let job_id = harness
        .queue
        .enqueue(
            JOB_TYPE_CAPTURE,
            &CapturePayload {
                task_id: task.id,
                url: task.url.clone(),
                cookies: String::new(),
                formats: vec!["html".into()],
            },
        )
        .await
        .unwrap();

    let sender = FakeSender::ok(DeliveryChannel::Webhook);
    harness.run_worker(harness.context(sender)).await;

    // Blocked URL: task failed with a "blocked" message, job succeeded so it
    // never retries, zero outputs recorded.
    assert_eq!(harness.job_status(job_id).await, JobStatus::Succeeded);
    let task = CaptureTask::find_by_id(task.id, &harness.pool)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    let message = task.error_message.unwrap();
    assert!(
        message.contains("blocked") || message.contains("private"),
        "unexpected message: {message}"
    );
    assert!(CaptureOutput::list_for_task(task.id, &harness.pool)
        .await
        .unwrap()
        .is_empty());
}
