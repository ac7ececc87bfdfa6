//! The polling dispatcher and the stuck-job recovery sweep.
//!
//! One dispatcher per process. Each poll leases a batch of runnable jobs and
//! pushes them onto a bounded in-process channel for the workers. A send
//! that would block is not performed: the job is immediately un-leased so
//! another process, or the next tick, can pick it up. That gives
//! backpressure without holding leases across saturation.
//!
//! Recovery runs on its own loop so a stuck poll cannot also stall the
//! sweep that un-sticks everything else.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::jobs::{Job, JobQueue};

/// Cadence of the expired-lease sweep.
const RECOVERY_INTERVAL: Duration = Duration::from_secs(60);

pub struct Dispatcher {
    queue: JobQueue,
    /// Ephemeral identity of this dispatcher instance; tags every lease it
    /// takes so diagnostics can tell which process held a job.
    worker_id: String,
    poll_interval: Duration,
    batch_size: i64,
    lease_duration: Duration,
    tx: mpsc::Sender<Job>,
}

impl Dispatcher {
    pub fn new(
        queue: JobQueue,
        worker_id: String,
        poll_interval: Duration,
        batch_size: i64,
        lease_duration: Duration,
        tx: mpsc::Sender<Job>,
    ) -> Self {
        Self {
            queue,
            worker_id,
            poll_interval,
            batch_size,
            lease_duration,
            tx,
        }
    }

    /// Poll until cancelled. Dropping `self` on exit closes the channel,
    /// which is what tells the workers no more jobs are coming.
    pub async fn run(self, cancel: CancellationToken) {
        info!(worker_id = %self.worker_id, "dispatcher started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.fetch_and_dispatch().await,
            }
        }

        info!(worker_id = %self.worker_id, "dispatcher stopped");
    }

    async fn fetch_and_dispatch(&self) {
        let jobs = match self
            .queue
            .lease_batch(&self.worker_id, self.batch_size, self.lease_duration)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "failed to lease jobs");
                return;
            }
        };

        for job in jobs {
            let job_id = job.id;
            match self.tx.try_send(job) {
                Ok(()) => {
                    debug!(job_id = %job_id, "job dispatched");
                }
                Err(mpsc::error::TrySendError::Full(job)) => {
                    // Saturated workers: hand the lease straight back rather
                    // than sitting on it.
                    warn!(job_id = %job.id, "worker channel full, releasing job");
                    if let Err(e) = self.queue.release(job.id).await {
                        error!(job_id = %job.id, error = %e, "failed to release job");
                    }
                }
                Err(mpsc::error::TrySendError::Closed(job)) => {
                    // Shutdown race; the lease will expire and be recovered.
                    debug!(job_id = %job.id, "worker channel closed during dispatch");
                    return;
                }
            }
        }
    }
}

/// Sweep expired leases back to `pending` every minute until cancelled.
pub async fn run_recovery(queue: JobQueue, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(RECOVERY_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match queue.recover_expired().await {
                    Ok(0) => {}
                    Ok(count) => info!(count, "recovered stuck jobs"),
                    Err(e) => error!(error = %e, "failed to recover stuck jobs"),
                }
            }
        }
    }
}
