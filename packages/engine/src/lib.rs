//! Pagemail's capture-and-delivery engine.
//!
//! A durable, leased job queue over PostgreSQL feeds a pool of
//! browser-driving workers. Workers render pages through
//! [`pagemail_capture`], persist the resulting artifacts to a pluggable
//! [`storage::BlobStore`], and report outcomes back to the task that spawned
//! them. Delivery of finished artifacts (email, webhook) runs as separate
//! jobs so send attempts are counted independently of capture attempts.
//!
//! # Architecture
//!
//! ```text
//! Engine::start()
//!     │
//!     ├─► Dispatcher ── poll: lease_batch ──► bounded channel
//!     │        └────── recovery: recover_expired (60s)
//!     │
//!     └─► Worker × N ── drain channel
//!              ├─► capture jobs: Browser ─► BlobStore ─► capture_outputs
//!              └─► deliver jobs: DeliverySender (webhook / email)
//! ```
//!
//! Everything is at-least-once: leases expire when a worker crashes, the
//! recovery sweep re-admits the job, and side effects are idempotent by
//! construction (deterministic blob keys, last-writer-wins status updates).
//!
//! The engine has no process-global state. The database pool, the blob
//! store, and the mail transport are all constructor arguments:
//!
//! ```ignore
//! let engine = Engine::new(config, pool, store, mailer);
//! let handle = engine.start();
//! // ...
//! handle.shutdown().await;
//! ```

pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod engine;
pub mod jobs;
pub mod models;
pub mod notify;
pub mod storage;
pub mod worker;

pub use config::EngineConfig;
pub use engine::{Engine, EngineHandle};
pub use jobs::{JobQueue, QueueError};
pub use storage::{BlobStore, StorageError};
