//! Browser capability traits.
//!
//! The orchestrator, pipeline and export strategies only talk to a browser
//! through these traits. `session` and `page` implement them on top of
//! chromiumoxide; tests use recording fakes.

use crate::config::{ImageFormat, Viewport};
use crate::error::ExportResult;
use crate::interception::RequestClassifier;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle condition a navigation waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUntil {
    /// `load` and `DOMContentLoaded` fired, and at most two requests in flight.
    NetworkIdleAndLoad,
    DomContentLoaded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOptions {
    pub format: ImageFormat,
    /// JPEG only
    pub quality: Option<u8>,
    pub full_page: bool,
    pub capture_beyond_viewport: bool,
    pub omit_background: bool,
}

/// Print parameters, in inches.
#[derive(Debug, Clone, PartialEq)]
pub struct PdfOptions {
    pub paper_width: f64,
    pub paper_height: f64,
    pub margin: f64,
    pub landscape: bool,
    pub print_background: bool,
    pub scale: f64,
    pub page_ranges: Option<String>,
    pub prefer_css_page_size: bool,
    pub display_header_footer: bool,
    pub timeout: Duration,
}

/// One browser tab.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Upper bound applied to individual page operations.
    async fn set_default_timeout(&self, timeout: Duration) -> ExportResult<()>;

    async fn set_viewport(&self, viewport: &Viewport) -> ExportResult<()>;

    async fn set_user_agent(&self, user_agent: &str) -> ExportResult<()>;

    async fn emulate_media(&self, media: &str) -> ExportResult<()>;

    /// Register a script evaluated before any page script on every new document.
    async fn add_init_script(&self, source: &str) -> ExportResult<()>;

    /// Intercept every request, classify it, and let it continue.
    async fn enable_request_interception(
        &self,
        classifier: Arc<RequestClassifier>,
    ) -> ExportResult<()>;

    /// Navigate and wait for `wait_until`. Returns the main document's HTTP
    /// status, or `None` when no response was observed.
    async fn navigate(
        &self,
        url: &str,
        wait_until: WaitUntil,
        timeout: Duration,
    ) -> ExportResult<Option<u16>>;

    /// Requests started but not yet finished or failed.
    fn in_flight_requests(&self) -> usize;

    /// Evaluate an expression, awaiting promises, and return its JSON value.
    async fn evaluate(&self, expression: &str) -> ExportResult<serde_json::Value>;

    async fn content(&self) -> ExportResult<String>;

    async fn screenshot(&self, options: &CaptureOptions) -> ExportResult<Vec<u8>>;

    async fn print_pdf(&self, options: &PdfOptions) -> ExportResult<Vec<u8>>;

    async fn close(&self) -> ExportResult<()>;
}

/// One isolated browser process.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    fn id(&self) -> &str;

    async fn new_page(&self) -> ExportResult<Arc<dyn PageDriver>>;

    /// Terminate the browser process. Called exactly once per session.
    async fn close(&self) -> ExportResult<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Launch a fresh browser. Fails with `LaunchFailed` if it cannot start.
    async fn acquire(&self) -> ExportResult<Arc<dyn BrowserSession>>;
}
