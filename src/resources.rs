//! Per-request ownership of browser resources.
//!
//! [`RequestResources`] records the session, page and admission permit a
//! request acquires, and releases them exactly once: page first, then
//! session, then the permit. Anything registered after release (work that
//! outlived its request's timeout) is closed on the spot.

use crate::driver::{BrowserSession, PageDriver};
use crate::error::{ExportError, ExportResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};

/// A page that is closed at most once, whichever path gets there first.
pub struct ManagedPage {
    driver: Arc<dyn PageDriver>,
    closed: AtomicBool,
}

impl ManagedPage {
    pub fn new(driver: Arc<dyn PageDriver>) -> Self {
        Self {
            driver,
            closed: AtomicBool::new(false),
        }
    }

    pub fn driver(&self) -> &dyn PageDriver {
        self.driver.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn close(&self) -> ExportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.driver.close().await
    }
}

#[derive(Default)]
struct Held {
    released: bool,
    session: Option<Arc<dyn BrowserSession>>,
    page: Option<Arc<ManagedPage>>,
    permit: Option<OwnedSemaphorePermit>,
}

pub struct RequestResources {
    request_id: String,
    held: Mutex<Held>,
}

impl RequestResources {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            held: Mutex::new(Held::default()),
        }
    }

    pub fn is_released(&self) -> bool {
        self.lock().released
    }

    /// `Err(Abandoned)` once release has begun. Work holding this request's
    /// page must stop driving it at that point.
    pub fn ensure_active(&self) -> ExportResult<()> {
        if self.is_released() {
            return Err(ExportError::Abandoned);
        }
        Ok(())
    }

    pub fn hold_permit(&self, permit: OwnedSemaphorePermit) -> ExportResult<()> {
        let mut held = self.lock();
        if held.released {
            return Err(ExportError::Abandoned);
        }
        held.permit = Some(permit);
        Ok(())
    }

    pub async fn track_session(&self, session: Arc<dyn BrowserSession>) -> ExportResult<()> {
        {
            let mut held = self.lock();
            if !held.released {
                held.session = Some(session);
                return Ok(());
            }
        }

        debug!(request_id = %self.request_id, "Session arrived after release, closing it");
        if let Err(e) = session.close().await {
            warn!(request_id = %self.request_id, "Error closing late session: {e}");
        }
        Err(ExportError::Abandoned)
    }

    pub async fn track_page(&self, page: Arc<ManagedPage>) -> ExportResult<()> {
        {
            let mut held = self.lock();
            if !held.released {
                held.page = Some(page);
                return Ok(());
            }
        }

        debug!(request_id = %self.request_id, "Page arrived after release, closing it");
        if let Err(e) = page.close().await {
            warn!(request_id = %self.request_id, "Error closing late page: {e}");
        }
        Err(ExportError::Abandoned)
    }

    /// Close everything held. Failures are logged, never returned.
    pub async fn release(&self) {
        let (page, session, permit) = {
            let mut held = self.lock();
            if held.released {
                return;
            }
            held.released = true;
            (held.page.take(), held.session.take(), held.permit.take())
        };

        if let Some(page) = page {
            match page.close().await {
                Ok(()) => debug!(request_id = %self.request_id, "Page closed"),
                Err(e) => warn!(request_id = %self.request_id, "Error closing page: {e}"),
            }
        }

        if let Some(session) = session {
            match session.close().await {
                Ok(()) => debug!(request_id = %self.request_id, session = session.id(), "Session closed"),
                Err(e) => warn!(request_id = %self.request_id, "Error closing session: {e}"),
            }
        }

        drop(permit);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Held> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
