//! chromiumoxide implementation of [`PageDriver`].
//!
//! A [`ChromiumPage`] subscribes to network, console and exception events on
//! attach. Listener tasks feed the in-flight request set and the main document
//! status, and are aborted when the page closes.

use crate::config::{ImageFormat, Viewport};
use crate::driver::{CaptureOptions, PageDriver, PdfOptions, WaitUntil};
use crate::error::{ExportError, ExportResult};
use crate::interception::RequestClassifier;
use crate::wait::{await_with_deadline, WaitOutcome};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetEmulatedMediaParams,
};
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams as FetchEnableParams, EventRequestPaused,
};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams as NetworkEnableParams, EventLoadingFailed, EventLoadingFinished,
    EventRequestWillBeSent, EventResponseReceived, ResourceType, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat, NavigateParams,
    PrintToPdfParams,
};
use chromiumoxide::cdp::js_protocol::runtime::{
    EvaluateParams, EventConsoleApiCalled, EventExceptionThrown,
};
use chromiumoxide::page::{Page, ScreenshotParams};
use dashmap::DashSet;
use futures::StreamExt;
use serde::Deserialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Networkidle2: at most this many requests in flight...
const NETWORK_IDLE_MAX_IN_FLIGHT: usize = 2;
/// ...for at least this long.
const NETWORK_IDLE_QUIET_PERIOD: Duration = Duration::from_millis(500);
const LIFECYCLE_POLL: Duration = Duration::from_millis(100);

const LIFECYCLE_PROBE: &str = "({ state: document.readyState, href: location.href })";

#[derive(Debug, Deserialize)]
struct Lifecycle {
    state: String,
    href: String,
}

pub struct ChromiumPage {
    page: Page,
    pending: Arc<DashSet<String>>,
    document_status: Arc<Mutex<Option<u16>>>,
    default_timeout_ms: AtomicU64,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ChromiumPage {
    /// Wrap a freshly opened tab and start its event listeners.
    pub async fn attach(page: Page, default_timeout: Duration) -> ExportResult<Self> {
        page.execute(NetworkEnableParams::default()).await?;

        let this = Self {
            page,
            pending: Arc::new(DashSet::new()),
            document_status: Arc::new(Mutex::new(None)),
            default_timeout_ms: AtomicU64::new(default_timeout.as_millis() as u64),
            listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };
        this.spawn_network_tracking().await?;
        this.spawn_console_forwarding().await?;
        Ok(this)
    }

    async fn spawn_network_tracking(&self) -> ExportResult<()> {
        let mut started = self.page.event_listener::<EventRequestWillBeSent>().await?;
        let mut finished = self.page.event_listener::<EventLoadingFinished>().await?;
        let mut failed = self.page.event_listener::<EventLoadingFailed>().await?;
        let mut responses = self.page.event_listener::<EventResponseReceived>().await?;

        let pending = self.pending.clone();
        let started_task = tokio::spawn(async move {
            while let Some(event) = started.next().await {
                pending.insert(event.request_id.inner().clone());
            }
        });

        let pending = self.pending.clone();
        let finished_task = tokio::spawn(async move {
            while let Some(event) = finished.next().await {
                pending.remove(event.request_id.inner());
            }
        });

        let pending = self.pending.clone();
        let failed_task = tokio::spawn(async move {
            while let Some(event) = failed.next().await {
                pending.remove(event.request_id.inner());
            }
        });

        let status = self.document_status.clone();
        let status_task = tokio::spawn(async move {
            while let Some(event) = responses.next().await {
                if event.r#type != ResourceType::Document {
                    continue;
                }
                let mut slot = status.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.is_none() {
                    debug!(
                        status = event.response.status,
                        url = %event.response.url,
                        "Main document response"
                    );
                    *slot = Some(event.response.status as u16);
                }
            }
        });

        self.track(vec![started_task, finished_task, failed_task, status_task]);
        Ok(())
    }

    async fn spawn_console_forwarding(&self) -> ExportResult<()> {
        let mut console = self.page.event_listener::<EventConsoleApiCalled>().await?;
        let mut exceptions = self.page.event_listener::<EventExceptionThrown>().await?;

        let console_task = tokio::spawn(async move {
            while let Some(event) = console.next().await {
                let text = event
                    .args
                    .iter()
                    .map(|arg| match (&arg.value, &arg.description) {
                        (Some(serde_json::Value::String(s)), _) => s.clone(),
                        (Some(value), _) => value.to_string(),
                        (None, Some(description)) => description.clone(),
                        (None, None) => String::new(),
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                debug!(kind = ?event.r#type, "Browser console: {text}");
            }
        });

        let exception_task = tokio::spawn(async move {
            while let Some(event) = exceptions.next().await {
                let details = &event.exception_details;
                let description = details
                    .exception
                    .as_ref()
                    .and_then(|e| e.description.clone())
                    .unwrap_or_else(|| details.text.clone());
                warn!("Page error: {description}");
            }
        });

        self.track(vec![console_task, exception_task]);
        Ok(())
    }

    fn track(&self, tasks: Vec<JoinHandle<()>>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms.load(Ordering::Relaxed))
    }

    async fn bounded<T, F>(&self, what: &str, timeout: Duration, operation: F) -> ExportResult<T>
    where
        F: Future<Output = ExportResult<T>>,
    {
        tokio::time::timeout(timeout, operation)
            .await
            .map_err(|_| {
                ExportError::PageError(format!(
                    "{what} timed out after {} ms",
                    timeout.as_millis()
                ))
            })?
    }

    async fn lifecycle_reached(
        &self,
        wait_until: WaitUntil,
        idle_since: &Mutex<Option<Instant>>,
    ) -> ExportResult<bool> {
        // Evaluation fails while the old context is torn down; that only means "not yet".
        let lifecycle = match self.evaluate_raw(LIFECYCLE_PROBE).await {
            Ok(value) => match serde_json::from_value::<Lifecycle>(value) {
                Ok(lifecycle) => lifecycle,
                Err(_) => return Ok(false),
            },
            Err(_) => return Ok(false),
        };

        if lifecycle.href == "about:blank" {
            return Ok(false);
        }

        match wait_until {
            WaitUntil::DomContentLoaded => {
                Ok(lifecycle.state == "interactive" || lifecycle.state == "complete")
            }
            WaitUntil::NetworkIdleAndLoad => {
                let mut idle = idle_since.lock().unwrap_or_else(PoisonError::into_inner);
                if lifecycle.state != "complete" || self.pending.len() > NETWORK_IDLE_MAX_IN_FLIGHT {
                    *idle = None;
                    return Ok(false);
                }
                let since = *idle.get_or_insert_with(Instant::now);
                Ok(since.elapsed() >= NETWORK_IDLE_QUIET_PERIOD)
            }
        }
    }

    async fn evaluate_raw(&self, expression: &str) -> ExportResult<serde_json::Value> {
        let params = EvaluateParams::builder()
            .expression(expression)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(ExportError::ScriptError)?;

        let result = self
            .page
            .evaluate_expression(params)
            .await
            .map_err(|e| ExportError::ScriptError(e.to_string()))?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }
}

#[async_trait]
impl PageDriver for ChromiumPage {
    async fn set_default_timeout(&self, timeout: Duration) -> ExportResult<()> {
        self.default_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn set_viewport(&self, viewport: &Viewport) -> ExportResult<()> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width as i64)
            .height(viewport.height as i64)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(viewport.mobile)
            .build()
            .map_err(ExportError::PageError)?;

        self.page.execute(params).await?;
        Ok(())
    }

    async fn set_user_agent(&self, user_agent: &str) -> ExportResult<()> {
        self.page
            .execute(SetUserAgentOverrideParams::new(user_agent))
            .await?;
        Ok(())
    }

    async fn emulate_media(&self, media: &str) -> ExportResult<()> {
        let params = SetEmulatedMediaParams {
            media: Some(media.to_string()),
            ..Default::default()
        };
        self.page.execute(params).await?;
        Ok(())
    }

    async fn add_init_script(&self, source: &str) -> ExportResult<()> {
        self.page
            .execute(AddScriptToEvaluateOnNewDocumentParams::new(source))
            .await?;
        Ok(())
    }

    async fn enable_request_interception(
        &self,
        classifier: Arc<RequestClassifier>,
    ) -> ExportResult<()> {
        let mut paused = self.page.event_listener::<EventRequestPaused>().await?;
        self.page.execute(FetchEnableParams::default()).await?;

        let page = self.page.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let class = classifier.record(&event.request.url, event.resource_type.as_ref());
                if class.is_priority() {
                    debug!(class = ?class, url = %event.request.url, "Priority resource");
                }
                if let Err(e) = page
                    .execute(ContinueRequestParams::new(event.request_id.clone()))
                    .await
                {
                    debug!(url = %event.request.url, "Failed to continue request: {e}");
                }
            }
        });

        self.track(vec![task]);
        Ok(())
    }

    async fn navigate(
        &self,
        url: &str,
        wait_until: WaitUntil,
        timeout: Duration,
    ) -> ExportResult<Option<u16>> {
        *self
            .document_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;

        let started = Instant::now();
        let timeout_error = || {
            ExportError::PageError(format!(
                "Navigation timeout of {} ms exceeded",
                timeout.as_millis()
            ))
        };

        let response = tokio::time::timeout(timeout, self.page.execute(NavigateParams::new(url)))
            .await
            .map_err(|_| timeout_error())??;

        if let Some(error_text) = &response.result.error_text {
            return Err(ExportError::PageError(format!("{error_text} at {url}")));
        }

        let idle_since = Mutex::new(None);
        let this = self;
        let idle = &idle_since;
        let remaining = timeout.saturating_sub(started.elapsed());
        match await_with_deadline(
            move || this.lifecycle_reached(wait_until, idle),
            LIFECYCLE_POLL,
            remaining,
        )
        .await
        {
            WaitOutcome::Met => Ok(*self
                .document_status
                .lock()
                .unwrap_or_else(PoisonError::into_inner)),
            WaitOutcome::TimedOut(_) => Err(timeout_error()),
            WaitOutcome::Fatal(e) => Err(e),
        }
    }

    fn in_flight_requests(&self) -> usize {
        self.pending.len()
    }

    async fn evaluate(&self, expression: &str) -> ExportResult<serde_json::Value> {
        self.bounded("Evaluation", self.default_timeout(), self.evaluate_raw(expression))
            .await
    }

    async fn content(&self) -> ExportResult<String> {
        self.bounded("Content read", self.default_timeout(), async {
            Ok(self.page.content().await?)
        })
        .await
    }

    async fn screenshot(&self, options: &CaptureOptions) -> ExportResult<Vec<u8>> {
        let format = match options.format {
            ImageFormat::Png => CaptureScreenshotFormat::Png,
            ImageFormat::Jpeg => CaptureScreenshotFormat::Jpeg,
        };

        let mut builder = ScreenshotParams::builder()
            .format(format)
            .full_page(options.full_page)
            .capture_beyond_viewport(options.capture_beyond_viewport)
            .omit_background(options.omit_background);
        if let Some(quality) = options.quality {
            builder = builder.quality(quality as i64);
        }
        let params = builder.build();

        self.bounded("Screenshot", self.default_timeout(), async {
            self.page
                .screenshot(params)
                .await
                .map_err(|e| ExportError::CaptureFailed(e.to_string()))
        })
        .await
    }

    async fn print_pdf(&self, options: &PdfOptions) -> ExportResult<Vec<u8>> {
        let params = PrintToPdfParams {
            landscape: Some(options.landscape),
            display_header_footer: Some(options.display_header_footer),
            print_background: Some(options.print_background),
            scale: Some(options.scale),
            paper_width: Some(options.paper_width),
            paper_height: Some(options.paper_height),
            margin_top: Some(options.margin),
            margin_bottom: Some(options.margin),
            margin_left: Some(options.margin),
            margin_right: Some(options.margin),
            page_ranges: options.page_ranges.clone(),
            prefer_css_page_size: Some(options.prefer_css_page_size),
            ..Default::default()
        };

        self.bounded("PDF render", options.timeout, async {
            self.page
                .pdf(params)
                .await
                .map_err(|e| ExportError::CaptureFailed(e.to_string()))
        })
        .await
    }

    async fn close(&self) -> ExportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let listeners = std::mem::take(
            &mut *self
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for listener in listeners {
            listener.abort();
        }

        self.page
            .clone()
            .close()
            .await
            .map_err(|e| ExportError::CleanupFailed(format!("page close: {e}")))
    }
}
