use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced to a single media request.
///
/// `InvalidIdentifier`, `SourceNotFound` and `ContainmentViolation` are the
/// caller's fault and must not be retried; `ConversionFailed` may succeed on
/// a later request.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Invalid media identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("Path escapes the media root: {0}")]
    ContainmentViolation(String),

    #[error("Conversion failed for {path}: {reason}")]
    ConversionFailed { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MediaError {
    /// True for errors caused by the request rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            MediaError::InvalidIdentifier(_)
                | MediaError::SourceNotFound(_)
                | MediaError::ContainmentViolation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MediaError>;
