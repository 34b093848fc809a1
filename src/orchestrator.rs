//! Request orchestration: admission, the timeout race, and cleanup.
//!
//! Each export runs on its own task so that a timeout only stops waiting for
//! it. Whatever happens, the request's page and session are released before
//! [`ExportOrchestrator::export`] returns; a task that outlives its request
//! has anything it acquires later closed on arrival.

use crate::config::{Config, ExportRequest};
use crate::driver::SessionFactory;
use crate::error::{ErrorSeverity, ExportError, ExportResult};
use crate::export::{strategy_for, ExportArtifact};
use crate::metrics::ExportMetrics;
use crate::pipeline::PreparationPipeline;
use crate::resources::RequestResources;
use crate::utils::{format_bytes, format_duration, validate_url};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportState {
    Idle,
    SessionAcquiring,
    Preparing,
    Exporting,
    Responding,
    Cleanup,
    Done,
    Errored,
}

impl ExportState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExportState::Done | ExportState::Errored)
    }
}

#[derive(Clone)]
pub struct ExportOrchestrator {
    config: Arc<Config>,
    factory: Arc<dyn SessionFactory>,
    pipeline: Arc<PreparationPipeline>,
    admission: Arc<Semaphore>,
    in_flight: Arc<DashMap<String, ExportState>>,
    metrics: Arc<ExportMetrics>,
}

impl ExportOrchestrator {
    pub fn new(config: Arc<Config>, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            pipeline: Arc::new(PreparationPipeline::new(config.clone())),
            admission: Arc::new(Semaphore::new(config.max_concurrent_sessions.max(1))),
            in_flight: Arc::new(DashMap::new()),
            metrics: Arc::new(ExportMetrics::new()),
            config,
            factory,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &ExportMetrics {
        &self.metrics
    }

    /// Exports currently between admission and cleanup.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn state_of(&self, request_id: &str) -> Option<ExportState> {
        self.in_flight.get(request_id).map(|entry| *entry.value())
    }

    /// Free browser slots right now.
    pub fn available_capacity(&self) -> usize {
        self.admission.available_permits()
    }

    /// Run one export to completion, within the configured request timeout.
    pub async fn export(&self, request: ExportRequest) -> ExportResult<ExportArtifact> {
        validate_url(&request.url)?;

        let span = info_span!(
            "export",
            request_id = %request.id,
            kind = request.kind.label()
        );
        self.run(request).instrument(span).await
    }

    async fn run(&self, request: ExportRequest) -> ExportResult<ExportArtifact> {
        let started = Instant::now();
        let kind = request.kind.label();
        let request_id = request.id.clone();
        let budget = self.config.request_timeout;

        info!(url = %request.url, "Export started");
        self.metrics.record_started(kind);
        self.transition(&request_id, ExportState::Idle);

        let resources = Arc::new(RequestResources::new(request_id.clone()));
        let worker = {
            let this = self.clone();
            let resources = resources.clone();
            tokio::spawn(
                async move { this.execute(request, resources).await }.in_current_span(),
            )
        };

        let outcome = match tokio::time::timeout(budget, worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ExportError::PageError(format!(
                "export task failed: {join_error}"
            ))),
            Err(_) => {
                warn!("Export exceeded {}, abandoning", format_duration(budget));
                Err(ExportError::RequestTimeout(budget))
            }
        };

        if outcome.is_err() {
            self.transition(&request_id, ExportState::Errored);
        }
        self.transition(&request_id, ExportState::Cleanup);
        resources.release().await;
        if outcome.is_ok() {
            self.transition(&request_id, ExportState::Done);
        }
        self.in_flight.remove(&request_id);
        self.metrics.set_in_flight(self.in_flight.len());

        let elapsed = started.elapsed();
        match &outcome {
            Ok(artifact) => {
                self.metrics.record_success(kind, elapsed, artifact.bytes.len());
                info!(
                    size = %format_bytes(artifact.bytes.len()),
                    elapsed = %format_duration(elapsed),
                    "Export finished"
                );
            }
            Err(e) => {
                self.metrics.record_failure(kind, elapsed, e);
                match e.severity() {
                    ErrorSeverity::Low | ErrorSeverity::Medium => {
                        warn!(reason = e.kind_label(), elapsed = %format_duration(elapsed), "Export failed: {e}")
                    }
                    ErrorSeverity::High | ErrorSeverity::Critical => {
                        error!(reason = e.kind_label(), elapsed = %format_duration(elapsed), "Export failed: {e}")
                    }
                }
            }
        }

        outcome
    }

    /// Admission through capture. Runs on its own task.
    async fn execute(
        self,
        request: ExportRequest,
        resources: Arc<RequestResources>,
    ) -> ExportResult<ExportArtifact> {
        let queued = Instant::now();
        let permit = self.admission.clone().acquire_owned().await?;
        self.metrics.record_admission_wait(queued.elapsed());
        resources.hold_permit(permit)?;

        self.transition(&request.id, ExportState::SessionAcquiring);
        let session = self.factory.acquire().await?;
        debug!(session = session.id(), "Session acquired");
        resources.track_session(session.clone()).await?;

        self.transition(&request.id, ExportState::Preparing);
        let page = self
            .pipeline
            .prepare(session.as_ref(), &request.url, &resources)
            .await?;

        resources.ensure_active()?;

        self.transition(&request.id, ExportState::Exporting);
        let strategy = strategy_for(request.kind, &self.config);
        debug!(strategy = strategy.name(), "Capturing");
        let output = strategy.capture(page.driver()).await?;

        self.transition(&request.id, ExportState::Responding);
        Ok(ExportArtifact::new(&request, output))
    }

    fn transition(&self, request_id: &str, state: ExportState) {
        // Late transitions from an abandoned task must not resurrect the entry.
        if let Some(mut entry) = self.in_flight.get_mut(request_id) {
            if entry.value().is_terminal() && !state.is_terminal() && state != ExportState::Cleanup {
                return;
            }
            debug!(from = ?*entry.value(), to = ?state, "State transition");
            *entry.value_mut() = state;
            return;
        }

        if state == ExportState::Idle {
            self.in_flight.insert(request_id.to_string(), state);
            self.metrics.set_in_flight(self.in_flight.len());
        }
    }
}
