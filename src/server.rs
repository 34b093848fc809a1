//! HTTP surface: routes, query parsing and response encoding.

use crate::config::{ExportKind, ExportRequest, ImageFormat};
use crate::error::{ErrorBody, ExportError};
use crate::export::ExportArtifact;
use crate::orchestrator::ExportOrchestrator;
use crate::utils::{parse_flag, validate_url};
use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

const HOME_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>Page Export Service</title>
  <style>
    body { font-family: system-ui, sans-serif; max-width: 760px; margin: 40px auto; padding: 0 16px; line-height: 1.5; }
    code { background: #f3f3f3; padding: 2px 4px; border-radius: 3px; }
    li { margin-bottom: 8px; }
  </style>
</head>
<body>
  <h1>Page Export Service</h1>
  <p>Render any web page to a PDF document or an image.</p>
  <h2>Endpoints</h2>
  <ul>
    <li><code>GET /export/pdf?url=&lt;page&gt;&amp;filename=export.pdf</code> returns an A4 PDF.</li>
    <li><code>GET /export/image?url=&lt;page&gt;&amp;filename=export.png&amp;format=png|jpeg&amp;fullPage=true</code> returns a PNG or JPEG capture.</li>
    <li><code>GET /health</code> returns <code>{"status":"ok"}</code>.</li>
    <li><code>GET /metrics</code> returns Prometheus metrics.</li>
  </ul>
  <p>Elements with the <code>no-export</code> class are removed before capture.</p>
</body>
</html>
"#;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: ExportOrchestrator,
    pub prometheus: Option<PrometheusHandle>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/export/pdf", get(export_pdf))
        .route("/export/image", get(export_image))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    host: &str,
    port: u16,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind export server to {addr}"))?;

    info!(%addr, "Export server listening");
    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .context("Export server error")
}

#[derive(Debug, Default, Deserialize)]
pub struct PdfQuery {
    pub url: Option<String>,
    pub filename: Option<String>,
}

impl PdfQuery {
    pub fn into_request(self) -> Result<ExportRequest, ExportError> {
        let url = validate_url(self.url.as_deref().unwrap_or_default())?;
        Ok(ExportRequest::pdf(url.as_str()).with_filename(self.filename))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ImageQuery {
    pub url: Option<String>,
    pub filename: Option<String>,
    pub format: Option<String>,
    #[serde(rename = "fullPage")]
    pub full_page: Option<String>,
}

impl ImageQuery {
    pub fn kind(&self) -> ExportKind {
        ExportKind::Image {
            format: ImageFormat::from_query(self.format.as_deref()),
            full_page: parse_flag(self.full_page.as_deref(), true),
        }
    }

    pub fn into_request(self) -> Result<ExportRequest, ExportError> {
        let url = validate_url(self.url.as_deref().unwrap_or_default())?;
        Ok(ExportRequest::new(url.as_str(), self.kind()).with_filename(self.filename))
    }
}

/// An export failure paired with the kind of export that failed.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ExportKind,
    pub error: ExportError,
}

impl ApiError {
    pub fn new(kind: ExportKind, error: ExportError) -> Self {
        Self { kind, error }
    }

    pub fn body(&self) -> ErrorBody {
        match &self.error {
            ExportError::MissingUrl => ErrorBody::new("URL is required", None),
            ExportError::InvalidUrl(detail) => {
                ErrorBody::new("Invalid URL", Some(detail.clone()))
            }
            other => ErrorBody::new(self.kind.failure_summary(), Some(other.to_string())),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.error.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.body())).into_response()
    }
}

fn artifact_response(artifact: ExportArtifact) -> Response {
    let disposition = artifact.content_disposition();
    (
        [
            (header::CONTENT_TYPE, artifact.content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        artifact.bytes,
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn home() -> Html<&'static str> {
    Html(HOME_PAGE)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn metrics_text(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}

async fn export_pdf(
    State(state): State<AppState>,
    Query(query): Query<PdfQuery>,
) -> Result<Response, ApiError> {
    let request = query
        .into_request()
        .map_err(|e| ApiError::new(ExportKind::Pdf, e))?;
    run_export(&state, request).await
}

async fn export_image(
    State(state): State<AppState>,
    Query(query): Query<ImageQuery>,
) -> Result<Response, ApiError> {
    let kind = query.kind();
    let request = query.into_request().map_err(|e| ApiError::new(kind, e))?;
    run_export(&state, request).await
}

async fn run_export(state: &AppState, request: ExportRequest) -> Result<Response, ApiError> {
    let kind = request.kind;
    let artifact = state
        .orchestrator
        .export(request)
        .await
        .map_err(|e| ApiError::new(kind, e))?;
    Ok(artifact_response(artifact))
}
