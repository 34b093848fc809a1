//! Configuration management with serde serialization/deserialization
//!
//! This module holds every tunable of the export service: runtime mode,
//! browser launch settings, the preparation pipeline's delays and caps, and
//! the per-format capture settings. It also defines the request types that
//! flow from the HTTP layer into the orchestrator.

use crate::error::{ExportError, ExportResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Desktop user agent presented to every exported page.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Deployment mode. A custom browser binary is only honored in production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    Development,
    Production,
}

impl Default for RuntimeMode {
    fn default() -> Self {
        Self::Production
    }
}

/// Main configuration structure for the export service
///
/// # Examples
///
/// ```rust
/// use page_export::Config;
/// use std::time::Duration;
///
/// let config = Config {
///     request_timeout: Duration::from_secs(90),
///     max_concurrent_sessions: 4,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Deployment mode (default: production)
    pub mode: RuntimeMode,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    ///
    /// Only used when `mode` is production; development always auto-detects.
    pub chrome_path: Option<String>,

    /// Wall-clock budget for one export, from admission to encoded bytes (default: 120 seconds)
    pub request_timeout: Duration,

    /// Upper bound on simultaneously open browser sessions (default: CPU count, at least 2)
    ///
    /// Requests beyond this wait for a slot inside their own timeout budget.
    pub max_concurrent_sessions: usize,

    /// Viewport used while the page is being prepared
    pub viewport: Viewport,

    /// User-Agent presented to the target page
    pub user_agent: String,

    /// Delays and caps of the preparation pipeline
    pub preparation: PreparationSettings,

    /// Image capture settings
    pub image: ImageSettings,

    /// PDF capture settings
    pub pdf: PdfSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::default(),
            chrome_path: None,
            request_timeout: Duration::from_secs(120),
            max_concurrent_sessions: num_cpus::get().max(2),
            viewport: Viewport::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            preparation: PreparationSettings::default(),
            image: ImageSettings::default(),
            pdf: PdfSettings::default(),
        }
    }
}

impl Config {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> ExportResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| ExportError::ConfigurationError(format!("{}: {e}", path.display())))?;
        Ok(config)
    }

    /// The browser binary to launch, if any. Development mode ignores overrides.
    pub fn effective_chrome_path(&self) -> Option<&str> {
        match self.mode {
            RuntimeMode::Production => self.chrome_path.as_deref(),
            RuntimeMode::Development => None,
        }
    }

    pub fn validate(&self) -> ExportResult<()> {
        if self.request_timeout.is_zero() {
            return Err(ExportError::ConfigurationError(
                "request_timeout must be greater than zero".into(),
            ));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(ExportError::ConfigurationError(
                "max_concurrent_sessions must be greater than 0".into(),
            ));
        }
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(ExportError::ConfigurationError(
                "viewport dimensions must be greater than 0".into(),
            ));
        }
        if self.preparation.operation_timeout.is_zero() {
            return Err(ExportError::ConfigurationError(
                "preparation.operation_timeout must be greater than zero".into(),
            ));
        }
        if self.preparation.navigation_attempts == 0 {
            return Err(ExportError::ConfigurationError(
                "preparation.navigation_attempts must be at least 1".into(),
            ));
        }
        if self.pdf.render_timeout.is_zero() {
            return Err(ExportError::ConfigurationError(
                "pdf.render_timeout must be greater than zero".into(),
            ));
        }
        if self.pdf.px_per_page == 0 {
            return Err(ExportError::ConfigurationError(
                "pdf.px_per_page must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Browser viewport configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Viewport {
    /// Viewport width in CSS pixels (default: 1280)
    pub width: u32,

    /// Viewport height in CSS pixels (default: 900)
    pub height: u32,

    /// Device pixel ratio (default: 1.5)
    pub device_scale_factor: f64,

    /// Whether to emulate a mobile device (default: false)
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 900,
            device_scale_factor: 1.5,
            mobile: false,
        }
    }
}

/// Delays and caps of the page preparation pipeline
///
/// Every wait in the pipeline is bounded by one of these values. Soft waits
/// that hit their cap are logged and the pipeline continues.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PreparationSettings {
    /// Default timeout for individual page operations (default: 60 seconds)
    pub operation_timeout: Duration,

    /// Navigation attempts before giving up (default: 3)
    pub navigation_attempts: usize,

    /// Timeout of the first, strict navigation attempt (default: 30 seconds)
    pub strict_navigation_timeout: Duration,

    /// Timeout of the relaxed retry attempts (default: 40 seconds)
    pub relaxed_navigation_timeout: Duration,

    pub network_idle_poll: Duration,
    pub network_idle_max: Duration,

    /// Upper bound for `document.fonts.ready` (default: 15 seconds)
    pub font_max_wait: Duration,

    /// Used when the font loading API is unavailable (default: 3 seconds)
    pub font_fallback_delay: Duration,

    pub ready_state_poll: Duration,
    pub ready_state_max: Duration,

    pub image_initial_delay: Duration,
    pub image_poll: Duration,
    pub image_max: Duration,

    /// Lazy-load scroll step in CSS pixels (default: 100)
    pub scroll_step_px: u32,
    pub scroll_interval: Duration,
    pub max_scroll_steps: u32,

    /// Settle delay after scrolling (default: 3 seconds)
    pub scroll_settle: Duration,

    /// Settle delay after DOM normalization (default: 2 seconds)
    pub final_settle: Duration,

    /// Body HTML at or below this length is reported as near-empty (default: 100)
    pub min_content_length: usize,
}

impl Default for PreparationSettings {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(60),
            navigation_attempts: 3,
            strict_navigation_timeout: Duration::from_secs(30),
            relaxed_navigation_timeout: Duration::from_secs(40),
            network_idle_poll: Duration::from_millis(100),
            network_idle_max: Duration::from_secs(10),
            font_max_wait: Duration::from_secs(15),
            font_fallback_delay: Duration::from_secs(3),
            ready_state_poll: Duration::from_millis(500),
            ready_state_max: Duration::from_secs(15),
            image_initial_delay: Duration::from_secs(1),
            image_poll: Duration::from_millis(500),
            image_max: Duration::from_secs(15),
            scroll_step_px: 100,
            scroll_interval: Duration::from_millis(100),
            max_scroll_steps: 100,
            scroll_settle: Duration::from_secs(3),
            final_settle: Duration::from_secs(2),
            min_content_length: 100,
        }
    }
}

/// Image capture settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ImageSettings {
    pub max_width: u32,
    pub max_height: u32,
    /// Used when the page width cannot be measured
    pub fallback_width: u32,
    /// Used when the page height cannot be measured
    pub fallback_height: u32,
    pub device_scale_factor: f64,
    pub jpeg_quality: u8,
    /// Extra settle for icon fonts and late scripts before capture (default: 8 seconds)
    pub icon_settle_delay: Duration,
    /// Render delay after `document.fonts.ready` resolves (default: 2 seconds)
    pub font_render_delay: Duration,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            max_width: 1920,
            max_height: 30000,
            fallback_width: 1200,
            fallback_height: 800,
            device_scale_factor: 2.0,
            jpeg_quality: 100,
            icon_settle_delay: Duration::from_secs(8),
            font_render_delay: Duration::from_secs(2),
        }
    }
}

/// PDF capture settings. Paper sizes are in inches.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PdfSettings {
    pub paper_width: f64,
    pub paper_height: f64,
    pub margin_cm: f64,
    pub scale: f64,
    /// CSS pixel height of one A4 page, used for the page estimate
    pub px_per_page: u32,
    /// Pages printed beyond the estimate
    pub extra_pages: u32,
    pub max_pages: u32,
    pub render_timeout: Duration,
}

impl Default for PdfSettings {
    fn default() -> Self {
        Self {
            paper_width: 8.27,
            paper_height: 11.69,
            margin_cm: 1.0,
            scale: 0.8,
            px_per_page: 1123,
            extra_pages: 5,
            max_pages: 100,
            render_timeout: Duration::from_secs(60),
        }
    }
}

/// Raster formats supported by image export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    /// Parse the `format` query value. Only an exact `jpeg` selects JPEG;
    /// anything else is PNG.
    pub fn from_query(value: Option<&str>) -> Self {
        match value {
            Some("jpeg") => ImageFormat::Jpeg,
            _ => ImageFormat::Png,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Pdf,
    Image { format: ImageFormat, full_page: bool },
}

impl ExportKind {
    pub fn label(&self) -> &'static str {
        match self {
            ExportKind::Pdf => "pdf",
            ExportKind::Image { .. } => "image",
        }
    }

    /// Summary used in the caller-visible error body.
    pub fn failure_summary(&self) -> &'static str {
        match self {
            ExportKind::Pdf => "Failed to export PDF",
            ExportKind::Image { .. } => "Failed to export image",
        }
    }

    /// Image exports default to `export.png` whatever the format.
    pub fn default_filename(&self) -> String {
        match self {
            ExportKind::Pdf => "export.pdf".to_string(),
            ExportKind::Image { .. } => "export.png".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub id: String,
    pub url: String,
    pub filename: String,
    pub kind: ExportKind,
}

impl ExportRequest {
    pub fn new(url: impl Into<String>, kind: ExportKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.into(),
            filename: kind.default_filename(),
            kind,
        }
    }

    pub fn pdf(url: impl Into<String>) -> Self {
        Self::new(url, ExportKind::Pdf)
    }

    pub fn image(url: impl Into<String>, format: ImageFormat, full_page: bool) -> Self {
        Self::new(url, ExportKind::Image { format, full_page })
    }

    pub fn with_filename(mut self, filename: Option<String>) -> Self {
        if let Some(name) = filename.filter(|n| !n.trim().is_empty()) {
            self.filename = name;
        }
        self
    }
}

/// Generate Chrome command-line arguments for an export browser
///
/// The user-data directory and remote debugging port are set by the launcher.
pub fn get_chrome_args(config: &Config) -> Vec<String> {
    vec![
        "--no-sandbox".to_string(),
        "--disable-setuid-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-accelerated-2d-canvas".to_string(),
        "--disable-gpu".to_string(),
        "--font-render-hinting=none".to_string(),
        "--disable-web-security".to_string(),
        "--allow-file-access-from-files".to_string(),
        "--ignore-certificate-errors".to_string(),
        "--no-first-run".to_string(),
        "--disable-extensions".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        ),
    ]
}

/// Build the chromiumoxide launch configuration for one session.
pub fn create_browser_config(
    config: &Config,
    user_data_dir: &Path,
) -> ExportResult<chromiumoxide::browser::BrowserConfig> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .no_sandbox()
        .window_size(config.viewport.width, config.viewport.height)
        .request_timeout(config.preparation.operation_timeout)
        .user_data_dir(user_data_dir)
        .args(get_chrome_args(config));

    if let Some(chrome_path) = config.effective_chrome_path() {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(ExportError::LaunchFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_export_contract() {
        let config = Config::default();
        assert_eq!(config.mode, RuntimeMode::Production);
        assert_eq!(config.request_timeout, Duration::from_secs(120));
        assert!(config.max_concurrent_sessions >= 2);
        assert_eq!(config.viewport.width, 1280);
        assert_eq!(config.viewport.height, 900);
        assert_eq!(config.viewport.device_scale_factor, 1.5);
        assert_eq!(config.preparation.navigation_attempts, 3);
        assert_eq!(config.image.max_height, 30000);
        assert_eq!(config.pdf.px_per_page, 1123);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn chrome_args_disable_sandbox_gpu_and_web_security() {
        let args = get_chrome_args(&Config::default());
        for expected in [
            "--no-sandbox",
            "--disable-setuid-sandbox",
            "--disable-gpu",
            "--disable-web-security",
            "--font-render-hinting=none",
            "--ignore-certificate-errors",
        ] {
            assert!(args.iter().any(|a| a == expected), "missing {expected}");
        }
        assert!(args.contains(&"--window-size=1280,900".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--user-data-dir")));
    }

    #[test]
    fn development_mode_ignores_binary_override() {
        let mut config = Config {
            chrome_path: Some("/opt/chrome/chrome".into()),
            ..Default::default()
        };
        assert_eq!(config.effective_chrome_path(), Some("/opt/chrome/chrome"));

        config.mode = RuntimeMode::Development;
        assert_eq!(config.effective_chrome_path(), None);
    }

    #[test]
    fn validate_rejects_zero_values() {
        let config = Config {
            request_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            max_concurrent_sessions: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.viewport.width = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"mode":"development","max_concurrent_sessions":3}"#).unwrap();
        assert_eq!(config.mode, RuntimeMode::Development);
        assert_eq!(config.max_concurrent_sessions, 3);
        assert_eq!(config.preparation.scroll_step_px, 100);
    }

    #[test]
    fn unknown_image_format_falls_back_to_png() {
        assert_eq!(ImageFormat::from_query(Some("bmp")), ImageFormat::Png);
        assert_eq!(ImageFormat::from_query(None), ImageFormat::Png);
        assert_eq!(ImageFormat::from_query(Some("jpeg")), ImageFormat::Jpeg);
        assert_eq!(ImageFormat::from_query(Some("JPEG")), ImageFormat::Png);
        assert_eq!(ImageFormat::from_query(Some("jpg")), ImageFormat::Png);
        assert_eq!(ImageFormat::from_query(Some(" jpeg ")), ImageFormat::Png);
    }

    #[test]
    fn request_filename_defaults_per_kind() {
        assert_eq!(ExportRequest::pdf("https://a.test").filename, "export.pdf");
        assert_eq!(
            ExportRequest::image("https://a.test", ImageFormat::Png, true).filename,
            "export.png"
        );
        assert_eq!(
            ExportRequest::image("https://a.test", ImageFormat::Jpeg, false).filename,
            "export.png"
        );
        let named = ExportRequest::pdf("https://a.test").with_filename(Some("  ".into()));
        assert_eq!(named.filename, "export.pdf");
        let named = ExportRequest::pdf("https://a.test").with_filename(Some("q3.pdf".into()));
        assert_eq!(named.filename, "q3.pdf");
    }
}
