//! Headless-browser page capture.
//!
//! This crate drives a single long-lived Chromium instance over the DevTools
//! protocol and serializes rendered pages into HTML, PDF, and full-page PNG
//! buffers. It carries no database or storage dependencies; callers decide
//! what to do with the bytes.
//!
//! The intended lifecycle is one [`Browser`] per worker, opened lazily and
//! reused across many [`Browser::capture`] calls:
//!
//! ```ignore
//! use pagemail_capture::{Browser, BrowserConfig, CaptureOptions};
//!
//! let browser = Browser::open(BrowserConfig::default()).await?;
//! let result = browser
//!     .capture(&CaptureOptions::new("https://example.com/"))
//!     .await?;
//! println!("html: {} bytes, pdf: {} bytes", result.html.len(), result.pdf.len());
//! ```
//!
//! Every capture validates its URL through [`guard`] first, so pages pointed
//! at loopback, RFC 1918, or cloud metadata addresses are rejected before the
//! browser ever sees them.

pub mod browser;
pub mod cookies;
pub mod error;
pub mod guard;
pub mod types;

pub use browser::Browser;
pub use cookies::parse_cookie_header;
pub use error::CaptureError;
pub use guard::{validate_url, Rejection};
pub use types::{BrowserConfig, CaptureOptions, CaptureResult, Cookie};
