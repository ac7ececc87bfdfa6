use std::time::Duration;

use thiserror::Error;

use crate::guard::Rejection;

/// Errors surfaced by browser capture.
///
/// The worker that drives a capture decides retry policy from
/// [`CaptureError::is_retryable`]: browser and navigation trouble is
/// transient, a blocked URL is not.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// No usable Chromium binary, or the browser process refused connection.
    #[error("browser unavailable: {0}")]
    BrowserUnavailable(String),

    /// The capture did not finish within its deadline.
    #[error("capture timed out after {0:?}")]
    Timeout(Duration),

    /// Navigation to the target URL failed (DNS, TLS, connection reset).
    #[error("navigation failed: {0}")]
    NavigationFailed(String),

    /// The URL guard rejected the target before navigation.
    #[error("capture blocked: {0}")]
    Blocked(#[from] Rejection),

    /// A DevTools round-trip failed outside navigation (page setup, close).
    #[error("page error: {0}")]
    Page(String),
}

impl CaptureError {
    /// Whether a retry of the same capture could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CaptureError::Blocked(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_is_not_retryable() {
        let err = CaptureError::Blocked(Rejection::BlockedHost("localhost".into()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(CaptureError::BrowserUnavailable("no binary".into()).is_retryable());
        assert!(CaptureError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(CaptureError::NavigationFailed("dns".into()).is_retryable());
        assert!(CaptureError::Page("cdp".into()).is_retryable());
    }
}
