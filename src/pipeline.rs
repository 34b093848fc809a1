//! Page preparation pipeline.
//!
//! Turns a fresh tab into a capture-ready page: configure, navigate with
//! retries, then run the readiness heuristics in order. Only navigation
//! failure is fatal. Every other step logs and moves on.

use crate::config::{Config, PreparationSettings};
use crate::driver::{BrowserSession, PageDriver, WaitUntil};
use crate::error::{ExportError, ExportResult};
use crate::interception::RequestClassifier;
use crate::resources::{ManagedPage, RequestResources};
use crate::scripts::{self, ContentCheck, NormalizationReport, NORMALIZATION_RULES};
use crate::utils::truncate_chars;
use crate::wait::{await_with_deadline, WaitOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// HTML logged when preparation fails.
const FAILURE_SNAPSHOT_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationAttempt {
    pub wait_until: WaitUntil,
    pub timeout: Duration,
}

/// The first attempt is strict; the rest only wait for DOMContentLoaded.
pub fn navigation_plan(settings: &PreparationSettings) -> Vec<NavigationAttempt> {
    (0..settings.navigation_attempts)
        .map(|index| {
            if index == 0 {
                NavigationAttempt {
                    wait_until: WaitUntil::NetworkIdleAndLoad,
                    timeout: settings.strict_navigation_timeout,
                }
            } else {
                NavigationAttempt {
                    wait_until: WaitUntil::DomContentLoaded,
                    timeout: settings.relaxed_navigation_timeout,
                }
            }
        })
        .collect()
}

/// Status 0 is reported for non-network documents.
pub fn is_success_status(status: u16) -> bool {
    status == 0 || (200..300).contains(&status)
}

pub struct PreparationPipeline {
    config: Arc<Config>,
}

impl PreparationPipeline {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    fn settings(&self) -> &PreparationSettings {
        &self.config.preparation
    }

    /// Open a page on `session`, register it with `resources`, and prepare
    /// it for capture. On failure the page is closed before returning.
    pub async fn prepare(
        &self,
        session: &dyn BrowserSession,
        url: &str,
        resources: &RequestResources,
    ) -> ExportResult<Arc<ManagedPage>> {
        let page = Arc::new(ManagedPage::new(session.new_page().await?));
        resources.track_page(page.clone()).await?;

        match self.run(page.driver(), url, resources).await {
            Ok(()) => Ok(page),
            Err(ExportError::Abandoned) => {
                debug!(url, "Preparation stopped, request already released");
                Err(ExportError::Abandoned)
            }
            Err(e) => {
                self.log_failure_snapshot(page.driver(), url).await;
                if let Err(close_err) = page.close().await {
                    warn!("Error closing page after failed preparation: {close_err}");
                }
                Err(e)
            }
        }
    }

    /// Every step first checks that the request still owns the page.
    async fn run(
        &self,
        page: &dyn PageDriver,
        url: &str,
        resources: &RequestResources,
    ) -> ExportResult<()> {
        let started = Instant::now();
        let classifier = Arc::new(RequestClassifier::new());

        resources.ensure_active()?;
        self.configure(page, classifier.clone()).await;

        let attempts = self.navigate(page, url, resources).await?;

        resources.ensure_active()?;
        self.wait_for_network_idle(page).await;
        resources.ensure_active()?;
        wait_for_fonts(page, self.settings()).await;
        resources.ensure_active()?;
        self.wait_for_dom_ready(page).await;
        resources.ensure_active()?;
        self.wait_for_images(page).await;
        resources.ensure_active()?;
        self.trigger_lazy_content(page).await;

        sleep(self.settings().scroll_settle).await;

        resources.ensure_active()?;
        self.apply_export_styles(page).await;
        resources.ensure_active()?;
        self.normalize_dom(page).await;

        sleep(self.settings().final_settle).await;
        resources.ensure_active()?;
        self.check_content(page, url).await;

        let requests = classifier.summary();
        info!(
            url,
            attempts,
            fonts = requests.fonts,
            images = requests.images,
            icons = requests.icons,
            stylesheets = requests.stylesheets,
            total_requests = requests.total(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Page ready for capture"
        );
        Ok(())
    }

    /// Steps 1-4. Each setting is applied independently and failures only warn.
    async fn configure(&self, page: &dyn PageDriver, classifier: Arc<RequestClassifier>) {
        soften(
            "default timeout",
            page.set_default_timeout(self.settings().operation_timeout).await,
        );
        soften("viewport", page.set_viewport(&self.config.viewport).await);
        soften("user agent", page.set_user_agent(&self.config.user_agent).await);
        soften("media emulation", page.emulate_media("screen").await);

        match scripts::init_script() {
            Ok(source) => soften("init script", page.add_init_script(&source).await),
            Err(e) => soften::<()>("init script", Err(e)),
        }

        soften(
            "request interception",
            page.enable_request_interception(classifier).await,
        );
    }

    /// Step 5. Walks the attempt table until one attempt yields a successful
    /// response. Returns the number of attempts used.
    pub async fn navigate(
        &self,
        page: &dyn PageDriver,
        url: &str,
        resources: &RequestResources,
    ) -> ExportResult<usize> {
        let plan = navigation_plan(self.settings());
        let mut last_error = String::from("no navigation attempted");

        for (index, attempt) in plan.iter().enumerate() {
            let number = index + 1;
            resources.ensure_active()?;
            debug!(
                url,
                attempt = number,
                wait_until = ?attempt.wait_until,
                timeout_ms = attempt.timeout.as_millis() as u64,
                "Navigating"
            );

            match page.navigate(url, attempt.wait_until, attempt.timeout).await {
                Ok(Some(status)) if is_success_status(status) => {
                    info!(url, attempt = number, status, "Navigation succeeded");
                    crate::metrics::record_navigation(number);
                    return Ok(number);
                }
                Ok(Some(status)) => last_error = format!("Page load failed with status: {status}"),
                Ok(None) => last_error = "Navigation failed to return a response".to_string(),
                Err(e) => last_error = e.to_string(),
            }

            warn!(
                url,
                attempt = number,
                attempts = plan.len(),
                "Navigation attempt failed: {last_error}"
            );
        }

        crate::metrics::record_navigation(plan.len());
        Err(ExportError::NavigationFailed {
            attempts: plan.len(),
            message: last_error,
        })
    }

    /// Step 6.
    async fn wait_for_network_idle(&self, page: &dyn PageDriver) {
        let outcome = await_with_deadline(
            move || async move { Ok(page.in_flight_requests() == 0) },
            self.settings().network_idle_poll,
            self.settings().network_idle_max,
        )
        .await;
        report("network idle", outcome);
    }

    /// Step 8.
    async fn wait_for_dom_ready(&self, page: &dyn PageDriver) {
        let outcome = await_with_deadline(
            move || probe(page, scripts::READY_STATE_PROBE),
            self.settings().ready_state_poll,
            self.settings().ready_state_max,
        )
        .await;
        report("document ready", outcome);
    }

    /// Step 9.
    async fn wait_for_images(&self, page: &dyn PageDriver) {
        match page.evaluate(scripts::IMAGE_COUNT_PROBE).await {
            Ok(count) if count.as_u64() == Some(0) => {
                debug!("No images to wait for");
                return;
            }
            Ok(count) => debug!(images = %count, "Waiting for images"),
            Err(e) => debug!("Image count unavailable: {e}"),
        }

        sleep(self.settings().image_initial_delay).await;
        let outcome = await_with_deadline(
            move || probe(page, scripts::IMAGES_COMPLETE_PROBE),
            self.settings().image_poll,
            self.settings().image_max,
        )
        .await;
        report("images", outcome);
    }

    /// Step 10.
    async fn trigger_lazy_content(&self, page: &dyn PageDriver) {
        let settings = self.settings();
        let script = scripts::auto_scroll_script(
            settings.scroll_step_px,
            settings.scroll_interval.as_millis() as u64,
            settings.max_scroll_steps,
        );
        match page.evaluate(&script).await {
            Ok(steps) => debug!(steps = %steps, "Auto-scroll finished"),
            Err(e) => warn!("Auto-scroll failed: {e}"),
        }
    }

    /// Step 12.
    async fn apply_export_styles(&self, page: &dyn PageDriver) {
        let result = match scripts::add_style_script(scripts::EXPORT_STYLE_CSS) {
            Ok(script) => page.evaluate(&script).await.map(|_| ()),
            Err(e) => Err(e),
        };
        soften("export styles", result);
    }

    /// Step 13.
    async fn normalize_dom(&self, page: &dyn PageDriver) {
        let script = match scripts::normalization_script(&NORMALIZATION_RULES) {
            Ok(script) => script,
            Err(e) => {
                warn!("Could not build normalization script: {e}");
                return;
            }
        };

        match page.evaluate(&script).await {
            Ok(value) => {
                let report: NormalizationReport = serde_json::from_value(value).unwrap_or_default();
                if let Some(error) = &report.error {
                    warn!("DOM normalization stopped early: {error}");
                }
                debug!(
                    removed = report.removed,
                    rewritten_styles = report.rewritten_styles,
                    overrides = report.overrides,
                    icons = report.icons,
                    "DOM normalized"
                );
            }
            Err(e) => warn!("DOM normalization failed: {e}"),
        }
    }

    /// Step 14.
    async fn check_content(&self, page: &dyn PageDriver, url: &str) {
        let check = match page.evaluate(scripts::CONTENT_CHECK_SCRIPT).await {
            Ok(value) => serde_json::from_value::<ContentCheck>(value).unwrap_or_default(),
            Err(e) => {
                warn!("Content check failed: {e}");
                return;
            }
        };

        if !check.has_body || check.html_length <= self.settings().min_content_length {
            warn!(
                url,
                html_length = check.html_length,
                "Page content looks empty or near-empty"
            );
        } else {
            debug!(
                html_length = check.html_length,
                images = check.images,
                divs = check.divs,
                "Content check passed"
            );
        }
    }

    async fn log_failure_snapshot(&self, page: &dyn PageDriver, url: &str) {
        match page.content().await {
            Ok(html) => warn!(
                url,
                "Page HTML at failure: {}",
                truncate_chars(&html, FAILURE_SNAPSHOT_CHARS)
            ),
            Err(e) => debug!(url, "Page HTML unavailable: {e}"),
        }
    }
}

/// Step 7, shared with image capture. Returns `true` when the font loading
/// API resolved, `false` when the fallback delay was used instead.
pub async fn wait_for_fonts(page: &dyn PageDriver, settings: &PreparationSettings) -> bool {
    match tokio::time::timeout(settings.font_max_wait, page.evaluate(scripts::FONTS_READY_SCRIPT))
        .await
    {
        Ok(Ok(serde_json::Value::Bool(true))) => {
            debug!("Fonts ready");
            true
        }
        Ok(Ok(_)) => {
            debug!("Font loading API unavailable, waiting {:?}", settings.font_fallback_delay);
            sleep(settings.font_fallback_delay).await;
            false
        }
        Ok(Err(e)) => {
            warn!("Font readiness check failed: {e}");
            sleep(settings.font_fallback_delay).await;
            false
        }
        Err(_) => {
            warn!(
                "{}",
                ExportError::ContentTimeout {
                    step: "fonts",
                    waited: settings.font_max_wait
                }
            );
            false
        }
    }
}

async fn probe(page: &dyn PageDriver, expression: &str) -> ExportResult<bool> {
    Ok(page.evaluate(expression).await?.as_bool().unwrap_or(false))
}

fn report(step: &'static str, outcome: WaitOutcome) {
    match outcome {
        WaitOutcome::Met => debug!("{step} settled"),
        WaitOutcome::TimedOut(waited) => {
            warn!("{}", ExportError::ContentTimeout { step, waited })
        }
        WaitOutcome::Fatal(e) => warn!("{step} check failed, continuing: {e}"),
    }
}

fn soften<T>(what: &str, result: ExportResult<T>) {
    if let Err(e) = result {
        warn!("Failed to apply {what}: {e}");
    }
}
