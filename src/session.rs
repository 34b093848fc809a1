//! One Chrome process per export.
//!
//! Each session launches its own browser with a private user-data directory,
//! polls the CDP handler on a background task, and tears everything down in
//! [`BrowserSession::close`].

use crate::config::{create_browser_config, Config};
use crate::driver::{BrowserSession, PageDriver, SessionFactory};
use crate::error::{ExportError, ExportResult};
use crate::page::ChromiumPage;
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct ChromiumSessionFactory {
    config: Arc<Config>,
    profile_root: PathBuf,
}

impl ChromiumSessionFactory {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            profile_root: std::env::temp_dir().join("page-export"),
        }
    }
}

#[async_trait]
impl SessionFactory for ChromiumSessionFactory {
    async fn acquire(&self) -> ExportResult<Arc<dyn BrowserSession>> {
        let id = uuid::Uuid::new_v4().to_string();
        let profile_dir = self.profile_root.join(format!("session-{id}"));
        tokio::fs::create_dir_all(&profile_dir).await.map_err(|e| {
            ExportError::LaunchFailed(format!("Failed to create user data dir: {e}"))
        })?;

        let browser_config = match create_browser_config(&self.config, &profile_dir) {
            Ok(config) => config,
            Err(e) => {
                remove_profile(&profile_dir).await;
                return Err(e);
            }
        };

        let (browser, mut handler) = match Browser::launch(browser_config).await {
            Ok(launched) => launched,
            Err(e) => {
                remove_profile(&profile_dir).await;
                return Err(ExportError::LaunchFailed(e.to_string()));
            }
        };

        let session_id = id.clone();
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(session = %session_id, "CDP handler error: {e}");
                }
            }
            debug!(session = %session_id, "CDP handler stream ended");
        });

        info!(session = %id, "Browser session launched");
        crate::metrics::session_opened();

        Ok(Arc::new(ChromiumSession {
            id,
            browser: Mutex::new(browser),
            handler: std::sync::Mutex::new(Some(handler_task)),
            profile_dir,
            config: self.config.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct ChromiumSession {
    id: String,
    browser: Mutex<Browser>,
    handler: std::sync::Mutex<Option<JoinHandle<()>>>,
    profile_dir: PathBuf,
    config: Arc<Config>,
    closed: AtomicBool,
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn new_page(&self) -> ExportResult<Arc<dyn PageDriver>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExportError::PageError(format!(
                "session {} is closing",
                self.id
            )));
        }

        let page = {
            let browser = self.browser.lock().await;
            browser.new_page("about:blank").await?
        };
        let page = ChromiumPage::attach(page, self.config.preparation.operation_timeout).await?;
        Ok(Arc::new(page))
    }

    async fn close(&self) -> ExportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let deadline = self.config.preparation.operation_timeout;
        let mut failure = None;
        {
            let mut browser = self.browser.lock().await;
            let graceful = tokio::time::timeout(deadline, async {
                browser.close().await?;
                browser.wait().await?;
                Ok::<_, ExportError>(())
            })
            .await;

            let reason = match graceful {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!("browser did not exit within {deadline:?}")),
            };
            if let Some(reason) = reason {
                warn!(session = %self.id, "Graceful browser close failed, killing: {reason}");
                if let Some(Err(kill_err)) = browser.kill().await {
                    failure = Some(format!("kill failed: {kill_err}"));
                }
            }
        }

        let handler = self
            .handler
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handler) = handler {
            handler.abort();
        }

        remove_profile(&self.profile_dir).await;
        crate::metrics::session_closed();
        info!(session = %self.id, "Browser session closed");

        match failure {
            Some(message) => Err(ExportError::CleanupFailed(message)),
            None => Ok(()),
        }
    }
}

async fn remove_profile(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        debug!("Could not remove {}: {e}", dir.display());
    }
}
