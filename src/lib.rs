//! # Page Export
//!
//! An HTTP service that renders web pages to PDF documents or PNG/JPEG images
//! through headless Chrome.
//!
//! Every request gets its own browser session. Before capture the page is
//! brought to a stable state: navigation with retries, network idle, web
//! fonts, document readiness, images, lazy content revealed by scrolling, and
//! a DOM normalization pass that pins icon sizes and freezes motion. The
//! session is closed on every exit path, including the request timeout.
//!
//! ## Endpoints
//!
//! | Route | Result |
//! |-------|--------|
//! | `GET /export/pdf?url=..&filename=..` | A4 PDF, landscape for wide pages |
//! | `GET /export/image?url=..&filename=..&format=png\|jpeg&fullPage=true` | PNG or JPEG |
//! | `GET /health` | `{"status":"ok"}` |
//! | `GET /metrics` | Prometheus text |
//!
//! ## Library usage
//!
//! ```rust,no_run
//! use page_export::{ChromiumSessionFactory, Config, ExportOrchestrator, ExportRequest};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(Config::default());
//!     let factory = Arc::new(ChromiumSessionFactory::new(config.clone()));
//!     let orchestrator = ExportOrchestrator::new(config, factory);
//!
//!     let artifact = orchestrator
//!         .export(ExportRequest::pdf("https://example.com"))
//!         .await?;
//!     println!("Exported {} bytes as {}", artifact.bytes.len(), artifact.filename);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## CLI usage
//!
//! ```bash
//! # Run the service on port 3000
//! page-export serve --port 3000
//!
//! # One-off export to a file
//! page-export export --url https://example.com --output page.pdf
//! page-export export --url https://example.com --output page.png --kind image
//! ```

/// Configuration, request types and Chrome launch arguments
pub mod config;

/// Error types and HTTP error bodies
pub mod error;

/// Browser-agnostic page and session traits
pub mod driver;

/// chromiumoxide-backed browser sessions
pub mod session;

/// chromiumoxide-backed page driver
pub mod page;

/// Request classification for font, image and icon loads
pub mod interception;

/// Page-side scripts and DOM normalization rules
pub mod scripts;

/// Bounded polling
pub mod wait;

/// Page preparation pipeline
pub mod pipeline;

/// PDF and image capture strategies
pub mod export;

/// Per-request resource tracking and release
pub mod resources;

/// Admission, timeout and cleanup for each export
pub mod orchestrator;

/// HTTP routes
pub mod server;

/// Command-line interface implementation
pub mod cli;

/// Export counters and the Prometheus recorder
pub mod metrics;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod testing;


pub use cli::*;
pub use config::*;
pub use driver::{BrowserSession, CaptureOptions, PageDriver, PdfOptions, SessionFactory, WaitUntil};
pub use error::*;
pub use export::{ExportArtifact, ExportStrategy, PageDimensions};
pub use orchestrator::{ExportOrchestrator, ExportState};
pub use pipeline::PreparationPipeline;
pub use self::metrics::{ExportMetrics, MetricsSnapshot};
pub use server::{router, AppState};
pub use session::{ChromiumSession, ChromiumSessionFactory};
pub use utils::*;
