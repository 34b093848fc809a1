//! Recording fakes for the browser traits.

use crate::config::{Config, ImageFormat, ImageSettings, PreparationSettings, Viewport};
use crate::driver::{BrowserSession, CaptureOptions, PageDriver, PdfOptions, SessionFactory, WaitUntil};
use crate::error::{ExportError, ExportResult};
use crate::export::PageDimensions;
use crate::interception::RequestClassifier;
use crate::scripts;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

/// Config with millisecond settle delays so scenarios finish quickly.
pub fn fast_config() -> Config {
    let ms = Duration::from_millis;
    Config {
        max_concurrent_sessions: 2,
        preparation: PreparationSettings {
            network_idle_poll: ms(10),
            network_idle_max: ms(100),
            font_fallback_delay: ms(10),
            ready_state_poll: ms(10),
            image_initial_delay: ms(10),
            image_poll: ms(10),
            scroll_settle: ms(10),
            final_settle: ms(10),
            ..Default::default()
        },
        image: ImageSettings {
            icon_settle_delay: ms(10),
            font_render_delay: ms(10),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Shared record of everything the fakes were asked to do.
pub struct FakeBrowser {
    pub sessions_created: AtomicUsize,
    pub sessions_closed: AtomicUsize,
    pub peak_open_sessions: AtomicUsize,
    open_sessions: AtomicUsize,
    pub pages_created: AtomicUsize,
    pub pages_closed: AtomicUsize,
    pub close_order: Mutex<Vec<&'static str>>,
    pub navigations: Mutex<Vec<(WaitUntil, Duration)>>,
    pub viewports: Mutex<Vec<Viewport>>,
    pub captures: Mutex<Vec<CaptureOptions>>,
    pub pdfs: Mutex<Vec<PdfOptions>>,
    pub evaluations: Mutex<Vec<&'static str>>,
    pub idle_polls: AtomicUsize,
    in_flight_requests: AtomicUsize,
    navigation_outcomes: Mutex<VecDeque<ExportResult<Option<u16>>>>,
    navigation_delay: Mutex<Duration>,
    launch_delay: Mutex<Duration>,
    launch_error: Mutex<Option<ExportError>>,
    dimensions: Mutex<PageDimensions>,
    image_count: AtomicUsize,
}

impl FakeBrowser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions_created: AtomicUsize::new(0),
            sessions_closed: AtomicUsize::new(0),
            peak_open_sessions: AtomicUsize::new(0),
            open_sessions: AtomicUsize::new(0),
            pages_created: AtomicUsize::new(0),
            pages_closed: AtomicUsize::new(0),
            close_order: Mutex::new(Vec::new()),
            navigations: Mutex::new(Vec::new()),
            viewports: Mutex::new(Vec::new()),
            captures: Mutex::new(Vec::new()),
            pdfs: Mutex::new(Vec::new()),
            evaluations: Mutex::new(Vec::new()),
            idle_polls: AtomicUsize::new(0),
            in_flight_requests: AtomicUsize::new(0),
            navigation_outcomes: Mutex::new(VecDeque::new()),
            navigation_delay: Mutex::new(Duration::ZERO),
            launch_delay: Mutex::new(Duration::ZERO),
            launch_error: Mutex::new(None),
            dimensions: Mutex::new(PageDimensions {
                width: 1024,
                height: 1400,
            }),
            image_count: AtomicUsize::new(0),
        })
    }

    pub fn factory(self: &Arc<Self>) -> Arc<dyn SessionFactory> {
        Arc::new(FakeSessionFactory {
            browser: self.clone(),
        })
    }

    /// Outcomes handed out by successive navigations. Once exhausted every
    /// navigation answers 200.
    pub fn script_navigations(&self, outcomes: Vec<ExportResult<Option<u16>>>) {
        *self.navigation_outcomes.lock().unwrap() = outcomes.into();
    }

    pub fn delay_navigation(&self, delay: Duration) {
        *self.navigation_delay.lock().unwrap() = delay;
    }

    pub fn delay_launch(&self, delay: Duration) {
        *self.launch_delay.lock().unwrap() = delay;
    }

    pub fn fail_launch(&self, error: ExportError) {
        *self.launch_error.lock().unwrap() = Some(error);
    }

    pub fn set_dimensions(&self, width: u32, height: u32) {
        *self.dimensions.lock().unwrap() = PageDimensions { width, height };
    }

    pub fn set_image_count(&self, count: usize) {
        self.image_count.store(count, Ordering::SeqCst);
    }

    /// Requests the page reports as in flight on every poll.
    pub fn set_in_flight_requests(&self, count: usize) {
        self.in_flight_requests.store(count, Ordering::SeqCst);
    }

    pub fn evaluated_steps(&self) -> Vec<&'static str> {
        self.evaluations.lock().unwrap().clone()
    }

    pub fn created(&self) -> (usize, usize) {
        (
            self.sessions_created.load(Ordering::SeqCst),
            self.pages_created.load(Ordering::SeqCst),
        )
    }

    pub fn closed(&self) -> (usize, usize) {
        (
            self.sessions_closed.load(Ordering::SeqCst),
            self.pages_closed.load(Ordering::SeqCst),
        )
    }

    pub fn navigation_modes(&self) -> Vec<WaitUntil> {
        self.navigations
            .lock()
            .unwrap()
            .iter()
            .map(|(mode, _)| *mode)
            .collect()
    }

    fn next_navigation(&self) -> ExportResult<Option<u16>> {
        self.navigation_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(Some(200)))
    }

    fn current_viewport(&self) -> Viewport {
        self.viewports
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

pub struct FakeSessionFactory {
    browser: Arc<FakeBrowser>,
}

#[async_trait]
impl SessionFactory for FakeSessionFactory {
    async fn acquire(&self) -> ExportResult<Arc<dyn BrowserSession>> {
        let delay = *self.browser.launch_delay.lock().unwrap();
        if !delay.is_zero() {
            sleep(delay).await;
        }
        if let Some(error) = self.browser.launch_error.lock().unwrap().clone() {
            return Err(error);
        }

        self.browser.sessions_created.fetch_add(1, Ordering::SeqCst);
        let open = self.browser.open_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.browser
            .peak_open_sessions
            .fetch_max(open, Ordering::SeqCst);

        Ok(Arc::new(FakeSession {
            id: Uuid::new_v4().to_string(),
            browser: self.browser.clone(),
        }))
    }
}

pub struct FakeSession {
    id: String,
    browser: Arc<FakeBrowser>,
}

#[async_trait]
impl BrowserSession for FakeSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn new_page(&self) -> ExportResult<Arc<dyn PageDriver>> {
        self.browser.pages_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakePage {
            browser: self.browser.clone(),
        }))
    }

    async fn close(&self) -> ExportResult<()> {
        self.browser.sessions_closed.fetch_add(1, Ordering::SeqCst);
        self.browser.close_order.lock().unwrap().push("session");
        self.browser.open_sessions.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakePage {
    browser: Arc<FakeBrowser>,
}

#[async_trait]
impl PageDriver for FakePage {
    async fn set_default_timeout(&self, _timeout: Duration) -> ExportResult<()> {
        Ok(())
    }

    async fn set_viewport(&self, viewport: &Viewport) -> ExportResult<()> {
        self.browser.viewports.lock().unwrap().push(viewport.clone());
        Ok(())
    }

    async fn set_user_agent(&self, _user_agent: &str) -> ExportResult<()> {
        Ok(())
    }

    async fn emulate_media(&self, _media: &str) -> ExportResult<()> {
        Ok(())
    }

    async fn add_init_script(&self, _source: &str) -> ExportResult<()> {
        Ok(())
    }

    async fn enable_request_interception(
        &self,
        classifier: Arc<RequestClassifier>,
    ) -> ExportResult<()> {
        classifier.record("https://fonts.example/inter.woff2", "Font");
        classifier.record("https://cdn.example/logo.png", "Image");
        Ok(())
    }

    async fn navigate(
        &self,
        _url: &str,
        wait_until: WaitUntil,
        timeout: Duration,
    ) -> ExportResult<Option<u16>> {
        self.browser
            .navigations
            .lock()
            .unwrap()
            .push((wait_until, timeout));

        let delay = *self.browser.navigation_delay.lock().unwrap();
        if !delay.is_zero() && tokio::time::timeout(timeout, sleep(delay)).await.is_err() {
            return Err(ExportError::PageError(format!(
                "Navigation timeout of {} ms exceeded",
                timeout.as_millis()
            )));
        }
        self.browser.next_navigation()
    }

    fn in_flight_requests(&self) -> usize {
        self.browser.idle_polls.fetch_add(1, Ordering::SeqCst);
        self.browser.in_flight_requests.load(Ordering::SeqCst)
    }

    async fn evaluate(&self, expression: &str) -> ExportResult<Value> {
        let (step, value) = match expression {
            scripts::READY_STATE_PROBE => ("ready_state", json!(true)),
            scripts::IMAGES_COMPLETE_PROBE => ("images_complete", json!(true)),
            scripts::FONTS_READY_SCRIPT => ("fonts", json!(true)),
            scripts::IMAGE_COUNT_PROBE => (
                "image_count",
                json!(self.browser.image_count.load(Ordering::SeqCst)),
            ),
            scripts::MEASURE_DIMENSIONS_SCRIPT => {
                let dims = *self.browser.dimensions.lock().unwrap();
                ("measure", json!({ "width": dims.width, "height": dims.height }))
            }
            scripts::CONTENT_CHECK_SCRIPT => (
                "content_check",
                json!({ "hasBody": true, "htmlLength": 4096, "images": 2, "divs": 12 }),
            ),
            other if other.starts_with("new Promise") => ("scroll", json!(14)),
            other if other.starts_with("((rules) =>") => (
                "normalize",
                json!({ "removed": 1, "rewrittenStyles": 2, "overrides": 30, "icons": 4 }),
            ),
            other if other.contains("document.createElement('style')") => ("styles", json!(true)),
            _ => ("other", json!(true)),
        };
        self.browser.evaluations.lock().unwrap().push(step);
        Ok(value)
    }

    async fn content(&self) -> ExportResult<String> {
        Ok("<html><body><h1>fake</h1></body></html>".to_string())
    }

    async fn screenshot(&self, options: &CaptureOptions) -> ExportResult<Vec<u8>> {
        self.browser.captures.lock().unwrap().push(options.clone());

        let viewport = self.browser.current_viewport();
        let pixels = image::RgbImage::from_pixel(
            viewport.width,
            viewport.height,
            image::Rgb([250, 250, 250]),
        );
        let format = match options.format {
            ImageFormat::Png => image::ImageOutputFormat::Png,
            ImageFormat::Jpeg => image::ImageOutputFormat::Jpeg(options.quality.unwrap_or(100)),
        };

        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(pixels)
            .write_to(&mut Cursor::new(&mut bytes), format)
            .map_err(|e| ExportError::CaptureFailed(e.to_string()))?;
        Ok(bytes)
    }

    async fn print_pdf(&self, options: &PdfOptions) -> ExportResult<Vec<u8>> {
        self.browser.pdfs.lock().unwrap().push(options.clone());
        Ok(b"%PDF-1.7\n%fake document\n%%EOF\n".to_vec())
    }

    async fn close(&self) -> ExportResult<()> {
        self.browser.pages_closed.fetch_add(1, Ordering::SeqCst);
        self.browser.close_order.lock().unwrap().push("page");
        Ok(())
    }
}
