//! Configuration and result types for browser capture.

use std::time::Duration;

/// Settings for the long-lived browser instance.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Run Chromium without a visible window (default: true).
    pub headless: bool,
    /// Default viewport width in CSS pixels.
    pub viewport_width: u32,
    /// Default viewport height in CSS pixels.
    pub viewport_height: u32,
    /// Default user agent; empty means the browser default.
    pub user_agent: Option<String>,
    /// Default per-capture deadline, used when a capture does not supply one.
    pub default_timeout: Duration,
    /// Explicit Chromium binary path; auto-detected when unset.
    pub chrome_path: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            viewport_width: 1920,
            viewport_height: 1080,
            user_agent: None,
            default_timeout: Duration::from_secs(30),
            chrome_path: None,
        }
    }
}

/// A single cookie scoped to the capture's target URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

/// Per-capture options. Zero-valued viewport fields fall back to the
/// browser's configured defaults.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub url: String,
    pub cookies: Vec<Cookie>,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub user_agent: Option<String>,
    /// Deadline for the whole capture; `None` uses the browser default.
    pub timeout: Option<Duration>,
}

impl CaptureOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            cookies: Vec::new(),
            viewport_width: 0,
            viewport_height: 0,
            user_agent: None,
            timeout: None,
        }
    }
}

/// The serialized state of one rendered page.
///
/// Each buffer is best-effort: a format that failed to render is left empty.
/// Callers requiring output must check that at least one buffer is non-empty.
#[derive(Debug, Default)]
pub struct CaptureResult {
    pub html: Vec<u8>,
    pub pdf: Vec<u8>,
    pub screenshot: Vec<u8>,
    pub title: String,
    pub final_url: String,
}

impl CaptureResult {
    /// True when no format produced any bytes.
    pub fn is_empty(&self) -> bool {
        self.html.is_empty() && self.pdf.is_empty() && self.screenshot.is_empty()
    }
}
