//! The long-lived Chromium handle and the capture sequence.
//!
//! One [`Browser`] wraps one Chromium process plus the background task that
//! pumps its DevTools event stream. Captures each open a fresh page, drive it
//! through viewport/cookie setup, navigation, a fixed settle interval, and
//! then serialize HTML, PDF, and a full-page screenshot in order. Each format
//! is best-effort: a failed serialization logs a warning and leaves its
//! buffer empty rather than failing the capture.

use std::path::Path;
use std::time::Duration;

use chromiumoxide::browser::{Browser as CdpBrowser, BrowserConfig as CdpBrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, PrintToPdfParams};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::CaptureError;
use crate::guard::validate_url;
use crate::types::{BrowserConfig, CaptureOptions, CaptureResult};

/// Pause after the load event so late-binding scripts, fonts, and images can
/// settle. Fixed rather than adaptive: pages with indefinitely-loading
/// analytics beacons must not stall the capture.
const SETTLE_INTERVAL: Duration = Duration::from_secs(2);

/// Well-known Chromium install locations, probed in order.
const CHROMIUM_PATHS: &[&str] = &[
    "/usr/bin/chromium-browser",
    "/usr/bin/chromium",
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
];

fn find_chromium(configured: Option<&str>) -> Option<String> {
    if let Some(path) = configured {
        return Path::new(path).exists().then(|| path.to_string());
    }
    CHROMIUM_PATHS
        .iter()
        .find(|p| Path::new(p).exists())
        .map(|p| p.to_string())
}

/// A connected headless browser, reused across captures.
pub struct Browser {
    inner: CdpBrowser,
    handler: JoinHandle<()>,
    config: BrowserConfig,
}

impl Browser {
    /// Launch Chromium and connect over the DevTools protocol.
    ///
    /// Fails with [`CaptureError::BrowserUnavailable`] when no binary is
    /// found or the process refuses the connection.
    pub async fn open(config: BrowserConfig) -> Result<Self, CaptureError> {
        let chrome_path = find_chromium(config.chrome_path.as_deref())
            .ok_or_else(|| CaptureError::BrowserUnavailable("chromium not found".into()))?;

        let mut builder = CdpBrowserConfig::builder()
            .chrome_executable(&chrome_path)
            .window_size(config.viewport_width, config.viewport_height)
            .args(vec![
                "--no-sandbox",
                "--disable-gpu",
                "--disable-dev-shm-usage",
                "--disable-setuid-sandbox",
                "--disable-extensions",
                "--disable-background-networking",
                "--disable-sync",
                "--disable-translate",
                "--disable-default-apps",
                "--mute-audio",
                "--hide-scrollbars",
            ]);
        if !config.headless {
            builder = builder.with_head();
        }
        let cdp_config = builder
            .build()
            .map_err(CaptureError::BrowserUnavailable)?;

        let (inner, mut cdp_handler) = CdpBrowser::launch(cdp_config)
            .await
            .map_err(|e| CaptureError::BrowserUnavailable(e.to_string()))?;

        // The handler is a stream of DevTools events and must be polled for
        // the connection to make progress.
        let handler = tokio::spawn(async move {
            while let Some(event) = cdp_handler.next().await {
                if let Err(e) = event {
                    warn!(error = %e, "browser event handler error");
                    break;
                }
            }
            debug!("browser event stream ended");
        });

        debug!(chrome_path = %chrome_path, "browser launched");

        Ok(Self {
            inner,
            handler,
            config,
        })
    }

    /// Capture one URL into every format the browser can produce.
    ///
    /// The whole sequence races the capture deadline; on expiry the page is
    /// abandoned and [`CaptureError::Timeout`] is returned.
    pub async fn capture(&self, opts: &CaptureOptions) -> Result<CaptureResult, CaptureError> {
        validate_url(&opts.url).await?;

        let deadline = opts.timeout.unwrap_or(self.config.default_timeout);
        match timeout(deadline, self.capture_page(opts)).await {
            Ok(result) => result,
            Err(_) => Err(CaptureError::Timeout(deadline)),
        }
    }

    async fn capture_page(&self, opts: &CaptureOptions) -> Result<CaptureResult, CaptureError> {
        let page = self
            .inner
            .new_page("about:blank")
            .await
            .map_err(|e| CaptureError::Page(e.to_string()))?;

        // Page lifetime is per-capture; always close it, even on error.
        let result = self.drive_page(&page, opts).await;
        if let Err(e) = page.close().await {
            debug!(error = %e, "failed to close capture page");
        }
        result
    }

    async fn drive_page(
        &self,
        page: &Page,
        opts: &CaptureOptions,
    ) -> Result<CaptureResult, CaptureError> {
        let width = if opts.viewport_width > 0 {
            opts.viewport_width
        } else {
            self.config.viewport_width
        };
        let height = if opts.viewport_height > 0 {
            opts.viewport_height
        } else {
            self.config.viewport_height
        };

        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(width as i64)
            .height(height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(CaptureError::Page)?;
        page.execute(metrics)
            .await
            .map_err(|e| CaptureError::Page(e.to_string()))?;

        let user_agent = opts
            .user_agent
            .as_deref()
            .or(self.config.user_agent.as_deref());
        if let Some(ua) = user_agent.filter(|ua| !ua.is_empty()) {
            page.set_user_agent(ua)
                .await
                .map_err(|e| CaptureError::Page(e.to_string()))?;
        }

        if !opts.cookies.is_empty() {
            let cookies = opts
                .cookies
                .iter()
                .filter_map(|c| {
                    CookieParam::builder()
                        .name(c.name.clone())
                        .value(c.value.clone())
                        .url(opts.url.clone())
                        .build()
                        .ok()
                })
                .collect::<Vec<_>>();
            page.set_cookies(cookies)
                .await
                .map_err(|e| CaptureError::Page(e.to_string()))?;
        }

        page.goto(opts.url.as_str())
            .await
            .map_err(|e| CaptureError::NavigationFailed(e.to_string()))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| CaptureError::NavigationFailed(e.to_string()))?;

        sleep(SETTLE_INTERVAL).await;

        let mut result = CaptureResult::default();

        if let Ok(Some(title)) = page.get_title().await {
            result.title = title;
        }
        if let Ok(Some(final_url)) = page.url().await {
            result.final_url = final_url;
        }

        match page.content().await {
            Ok(html) => result.html = html.into_bytes(),
            Err(e) => warn!(url = %opts.url, error = %e, "failed to serialize html"),
        }

        let pdf_params = PrintToPdfParams {
            print_background: Some(true),
            paper_width: Some(8.5),
            paper_height: Some(11.0),
            ..Default::default()
        };
        match page.pdf(pdf_params).await {
            Ok(pdf) => result.pdf = pdf,
            Err(e) => warn!(url = %opts.url, error = %e, "failed to print pdf"),
        }

        let screenshot_params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .quality(90)
            .full_page(true)
            .build();
        match page.screenshot(screenshot_params).await {
            Ok(png) => result.screenshot = png,
            Err(e) => warn!(url = %opts.url, error = %e, "failed to take screenshot"),
        }

        Ok(result)
    }

    /// Close the browser process and stop the event pump.
    pub async fn close(mut self) {
        if let Err(e) = self.inner.close().await {
            debug!(error = %e, "browser close returned error");
        }
        self.handler.abort();
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        // Dropping without close() must not leave the event pump running.
        self.handler.abort();
    }
}
