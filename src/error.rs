use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

#[derive(Debug, Clone, Error)]
pub enum ExportError {
    #[error("URL is required")]
    MissingUrl,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("Failed to navigate after {attempts} attempts: {message}")]
    NavigationFailed { attempts: usize, message: String },

    #[error("{step} did not settle within {waited:?}")]
    ContentTimeout { step: &'static str, waited: Duration },

    #[error("Request timeout after {0:?}")]
    RequestTimeout(Duration),

    #[error("Cleanup failed: {0}")]
    CleanupFailed(String),

    #[error("Page error: {0}")]
    PageError(String),

    #[error("Script evaluation failed: {0}")]
    ScriptError(String),

    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    #[error("Export abandoned after its request was released")]
    Abandoned,

    #[error("Export capacity unavailable: {0}")]
    CapacityUnavailable(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

pub type ExportResult<T> = Result<T, ExportError>;

impl ExportError {
    /// Rejected before any browser resource is allocated.
    pub fn is_input_error(&self) -> bool {
        matches!(self, ExportError::MissingUrl | ExportError::InvalidUrl(_))
    }

    /// Soft failures are logged and absorbed, never reported to the caller.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            ExportError::ContentTimeout { .. } | ExportError::CleanupFailed(_)
        )
    }

    pub fn status_code(&self) -> u16 {
        if self.is_input_error() {
            400
        } else {
            500
        }
    }

    /// Short label used for metrics and structured logs.
    pub fn kind_label(&self) -> &'static str {
        match self {
            ExportError::MissingUrl | ExportError::InvalidUrl(_) => "input",
            ExportError::LaunchFailed(_) => "launch",
            ExportError::NavigationFailed { .. } => "navigation",
            ExportError::ContentTimeout { .. } => "content_timeout",
            ExportError::RequestTimeout(_) => "request_timeout",
            ExportError::CleanupFailed(_) => "cleanup",
            ExportError::CaptureFailed(_) => "capture",
            ExportError::Abandoned => "abandoned",
            ExportError::CapacityUnavailable(_) => "capacity",
            _ => "internal",
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ExportError::MissingUrl | ExportError::InvalidUrl(_) => ErrorSeverity::Low,
            ExportError::ContentTimeout { .. } | ExportError::CleanupFailed(_) => {
                ErrorSeverity::Low
            }
            ExportError::LaunchFailed(_) | ExportError::ConfigurationError(_) => {
                ErrorSeverity::High
            }
            ExportError::CapacityUnavailable(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// JSON body returned to HTTP callers on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, message: Option<String>) -> Self {
        Self {
            error: error.into(),
            message,
        }
    }
}

impl From<AcquireError> for ExportError {
    fn from(err: AcquireError) -> Self {
        ExportError::CapacityUnavailable(err.to_string())
    }
}

impl From<std::io::Error> for ExportError {
    fn from(err: std::io::Error) -> Self {
        ExportError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(err: serde_json::Error) -> Self {
        ExportError::SerializationError(err.to_string())
    }
}

impl From<chromiumoxide::error::CdpError> for ExportError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        ExportError::PageError(err.to_string())
    }
}
