//! Format-specific capture of a prepared page.

use crate::config::{
    Config, ExportKind, ExportRequest, ImageFormat, ImageSettings, PdfSettings,
    PreparationSettings, Viewport,
};
use crate::driver::{CaptureOptions, PageDriver, PdfOptions};
use crate::error::{ExportError, ExportResult};
use crate::pipeline::wait_for_fonts;
use crate::scripts::MEASURE_DIMENSIONS_SCRIPT;
use crate::utils::{format_bytes, sanitize_filename};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::io::Cursor;
use tokio::time::sleep;
use tracing::{debug, info};

const CM_PER_INCH: f64 = 2.54;

/// Page extent in CSS pixels. Zero means the extent could not be measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageDimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Deserialize)]
struct RawDimensions {
    #[serde(default)]
    width: f64,
    #[serde(default)]
    height: f64,
}

fn to_px(value: f64) -> u32 {
    if value.is_finite() && value > 0.0 {
        value.ceil().min(u32::MAX as f64) as u32
    } else {
        0
    }
}

pub async fn measure_dimensions(page: &dyn PageDriver) -> ExportResult<PageDimensions> {
    let value = page.evaluate(MEASURE_DIMENSIONS_SCRIPT).await?;
    let raw: RawDimensions = serde_json::from_value(value)?;
    Ok(PageDimensions {
        width: to_px(raw.width),
        height: to_px(raw.height),
    })
}

/// Capture viewport for image export: measured size clamped to the maximums,
/// with fallbacks for unmeasurable extents.
pub fn image_viewport(dimensions: PageDimensions, settings: &ImageSettings) -> Viewport {
    let width = match dimensions.width {
        0 => settings.fallback_width,
        w => w,
    };
    let height = match dimensions.height {
        0 => settings.fallback_height,
        h => h,
    };

    Viewport {
        width: width.min(settings.max_width),
        height: height.min(settings.max_height),
        device_scale_factor: settings.device_scale_factor,
        mobile: false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdfLayout {
    pub landscape: bool,
    pub estimated_pages: u32,
    pub page_ranges: String,
}

pub fn pdf_layout(dimensions: PageDimensions, settings: &PdfSettings) -> PdfLayout {
    let per_page = settings.px_per_page.max(1);
    let estimated_pages = dimensions.height.div_ceil(per_page).max(1);
    let last_page = estimated_pages
        .saturating_add(settings.extra_pages)
        .min(settings.max_pages.max(1));

    PdfLayout {
        landscape: dimensions.width > dimensions.height,
        estimated_pages,
        page_ranges: format!("1-{last_page}"),
    }
}

pub fn pdf_options(layout: &PdfLayout, settings: &PdfSettings) -> PdfOptions {
    PdfOptions {
        paper_width: settings.paper_width,
        paper_height: settings.paper_height,
        margin: settings.margin_cm / CM_PER_INCH,
        landscape: layout.landscape,
        print_background: true,
        scale: settings.scale,
        page_ranges: Some(layout.page_ranges.clone()),
        prefer_css_page_size: true,
        display_header_footer: false,
        timeout: settings.render_timeout,
    }
}

/// Encoded bytes produced by a strategy.
#[derive(Debug, Clone)]
pub struct CaptureOutput {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub dimensions: PageDimensions,
}

#[derive(Debug, Clone)]
pub struct ExportArtifact {
    pub request_id: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub filename: String,
    pub dimensions: PageDimensions,
    pub generated_at: DateTime<Utc>,
}

impl ExportArtifact {
    pub fn new(request: &ExportRequest, output: CaptureOutput) -> Self {
        let fallback = request.kind.default_filename();
        Self {
            request_id: request.id.clone(),
            bytes: output.bytes,
            content_type: output.content_type.to_string(),
            filename: sanitize_filename(&request.filename, &fallback),
            dimensions: output.dimensions,
            generated_at: Utc::now(),
        }
    }

    pub fn content_disposition(&self) -> String {
        format!("attachment; filename=\"{}\"", self.filename)
    }
}

#[async_trait]
pub trait ExportStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn capture(&self, page: &dyn PageDriver) -> ExportResult<CaptureOutput>;
}

pub fn strategy_for(kind: ExportKind, config: &Config) -> Box<dyn ExportStrategy> {
    match kind {
        ExportKind::Pdf => Box::new(DocumentCapture::new(config.pdf.clone())),
        ExportKind::Image { format, full_page } => Box::new(ImageCapture::new(
            config.image.clone(),
            config.preparation.clone(),
            format,
            full_page,
        )),
    }
}

pub struct ImageCapture {
    settings: ImageSettings,
    preparation: PreparationSettings,
    format: ImageFormat,
    full_page: bool,
}

impl ImageCapture {
    pub fn new(
        settings: ImageSettings,
        preparation: PreparationSettings,
        format: ImageFormat,
        full_page: bool,
    ) -> Self {
        Self {
            settings,
            preparation,
            format,
            full_page,
        }
    }

    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            format: self.format,
            quality: match self.format {
                ImageFormat::Jpeg => Some(self.settings.jpeg_quality),
                ImageFormat::Png => None,
            },
            full_page: self.full_page,
            capture_beyond_viewport: true,
            omit_background: false,
        }
    }
}

#[async_trait]
impl ExportStrategy for ImageCapture {
    fn name(&self) -> &'static str {
        "image"
    }

    async fn capture(&self, page: &dyn PageDriver) -> ExportResult<CaptureOutput> {
        sleep(self.settings.icon_settle_delay).await;
        if wait_for_fonts(page, &self.preparation).await {
            sleep(self.settings.font_render_delay).await;
        }

        let dimensions = measure_dimensions(page).await?;
        let viewport = image_viewport(dimensions, &self.settings);
        debug!(
            measured_width = dimensions.width,
            measured_height = dimensions.height,
            width = viewport.width,
            height = viewport.height,
            "Capture viewport"
        );
        page.set_viewport(&viewport).await?;

        let bytes = page.screenshot(&self.capture_options()).await?;
        if bytes.is_empty() {
            return Err(ExportError::CaptureFailed("screenshot returned no data".into()));
        }

        match encoded_dimensions(&bytes) {
            Some((w, h)) => info!(
                width = w,
                height = h,
                size = %format_bytes(bytes.len()),
                format = self.format.extension(),
                "Image captured"
            ),
            None => info!(size = %format_bytes(bytes.len()), "Image captured"),
        }

        Ok(CaptureOutput {
            bytes,
            content_type: self.format.content_type(),
            dimensions,
        })
    }
}

pub struct DocumentCapture {
    settings: PdfSettings,
}

impl DocumentCapture {
    pub fn new(settings: PdfSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl ExportStrategy for DocumentCapture {
    fn name(&self) -> &'static str {
        "pdf"
    }

    async fn capture(&self, page: &dyn PageDriver) -> ExportResult<CaptureOutput> {
        let dimensions = measure_dimensions(page).await?;
        let layout = pdf_layout(dimensions, &self.settings);
        debug!(
            width = dimensions.width,
            height = dimensions.height,
            landscape = layout.landscape,
            estimated_pages = layout.estimated_pages,
            page_ranges = %layout.page_ranges,
            "PDF layout"
        );

        let bytes = page.print_pdf(&pdf_options(&layout, &self.settings)).await?;
        if bytes.is_empty() {
            return Err(ExportError::CaptureFailed("PDF renderer returned no data".into()));
        }
        info!(size = %format_bytes(bytes.len()), "PDF rendered");

        Ok(CaptureOutput {
            bytes,
            content_type: "application/pdf",
            dimensions,
        })
    }
}

/// Pixel size read from the encoded image header.
pub fn encoded_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::io::Reader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(width: u32, height: u32) -> PageDimensions {
        PageDimensions { width, height }
    }

    #[test]
    fn image_viewport_clamps_and_falls_back() {
        let settings = ImageSettings::default();

        let viewport = image_viewport(dims(1280, 2400), &settings);
        assert_eq!((viewport.width, viewport.height), (1280, 2400));
        assert_eq!(viewport.device_scale_factor, 2.0);

        let viewport = image_viewport(dims(4000, 90000), &settings);
        assert_eq!((viewport.width, viewport.height), (1920, 30000));

        let viewport = image_viewport(dims(0, 0), &settings);
        assert_eq!((viewport.width, viewport.height), (1200, 800));
    }

    #[test]
    fn pdf_layout_estimates_pages() {
        let settings = PdfSettings::default();

        let layout = pdf_layout(dims(1280, 900), &settings);
        assert!(layout.landscape);
        assert_eq!(layout.estimated_pages, 1);
        assert_eq!(layout.page_ranges, "1-6");

        let layout = pdf_layout(dims(1280, 5000), &settings);
        assert!(!layout.landscape);
        assert_eq!(layout.estimated_pages, 5);
        assert_eq!(layout.page_ranges, "1-10");

        let layout = pdf_layout(dims(1280, 1123 * 200), &settings);
        assert_eq!(layout.page_ranges, "1-100");

        let layout = pdf_layout(dims(0, 0), &settings);
        assert!(!layout.landscape);
        assert_eq!(layout.estimated_pages, 1);
    }

    #[test]
    fn pdf_options_use_a4_and_one_centimeter_margins() {
        let settings = PdfSettings::default();
        let options = pdf_options(&pdf_layout(dims(800, 1200), &settings), &settings);
        assert_eq!(options.paper_width, 8.27);
        assert_eq!(options.paper_height, 11.69);
        assert!((options.margin - 0.3937).abs() < 1e-4);
        assert_eq!(options.scale, 0.8);
        assert!(options.print_background);
        assert!(options.prefer_css_page_size);
        assert!(!options.display_header_footer);
        assert_eq!(options.page_ranges.as_deref(), Some("1-7"));
    }

    #[test]
    fn jpeg_captures_use_full_quality() {
        let capture = ImageCapture::new(
            ImageSettings::default(),
            PreparationSettings::default(),
            ImageFormat::Jpeg,
            false,
        );
        let options = capture.capture_options();
        assert_eq!(options.quality, Some(100));
        assert!(!options.full_page);
        assert!(options.capture_beyond_viewport);

        let png = ImageCapture::new(
            ImageSettings::default(),
            PreparationSettings::default(),
            ImageFormat::Png,
            true,
        );
        assert_eq!(png.capture_options().quality, None);
    }

    #[test]
    fn artifact_sanitizes_filename() {
        let request = ExportRequest::pdf("https://a.test").with_filename(Some("q\"3/report.pdf".into()));
        let artifact = ExportArtifact::new(
            &request,
            CaptureOutput {
                bytes: vec![1, 2, 3],
                content_type: "application/pdf",
                dimensions: PageDimensions::default(),
            },
        );
        assert_eq!(artifact.filename, "q_3_report.pdf");
        assert_eq!(
            artifact.content_disposition(),
            "attachment; filename=\"q_3_report.pdf\""
        );
    }

    #[test]
    fn encoded_dimensions_reads_png_header() {
        let image = image::RgbImage::new(16, 9);
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        assert_eq!(encoded_dimensions(&bytes), Some((16, 9)));
        assert_eq!(encoded_dimensions(b"not an image"), None);
    }
}
