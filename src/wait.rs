//! Bounded polling used by every readiness heuristic.

use crate::error::ExportError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub enum WaitOutcome {
    Met,
    TimedOut(Duration),
    Fatal(ExportError),
}

impl WaitOutcome {
    pub fn is_met(&self) -> bool {
        matches!(self, WaitOutcome::Met)
    }
}

/// Poll `predicate` every `interval` until it returns `true` or `max_wait`
/// elapses. A predicate evaluation still running at the deadline is dropped.
/// An error from the predicate ends the wait as `Fatal`.
pub async fn await_with_deadline<F, Fut>(
    mut predicate: F,
    interval: Duration,
    max_wait: Duration,
) -> WaitOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, ExportError>>,
{
    let started = Instant::now();
    let deadline = started + max_wait;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, predicate()).await {
            Ok(Ok(true)) => return WaitOutcome::Met,
            Ok(Ok(false)) => {}
            Ok(Err(err)) => return WaitOutcome::Fatal(err),
            Err(_) => return WaitOutcome::TimedOut(started.elapsed()),
        }

        let now = Instant::now();
        if now >= deadline {
            return WaitOutcome::TimedOut(started.elapsed());
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
