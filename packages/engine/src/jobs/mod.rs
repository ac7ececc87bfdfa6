//! The durable, leased job queue.
//!
//! Every unit of work is a row in the `jobs` table. Jobs move through
//! `pending → running → succeeded | failed`; a `running` job always carries
//! `locked_by`, `locked_at`, and `lease_until`, and a lease that expires
//! without completion is swept back to `pending` by the recovery loop.
//! Recovery leaves `attempts` untouched, because a crashed worker is not a
//! failed attempt.
//!
//! Claiming uses a `FOR UPDATE SKIP LOCKED` CTE conditioned on the row still
//! being `pending` at write time, so concurrent dispatchers never lease the
//! same row twice.

pub mod job;
pub mod queue;

pub use job::{Job, JobStatus, JOB_TYPE_CAPTURE, JOB_TYPE_DELIVER};
pub use queue::{backoff, JobQueue, QueueError};
