use std::time::Duration;

use thiserror::Error;

/// HTTP statuses worth one refresh-and-retry during output download:
/// expired signed URLs, gone, rate limiting, upstream unavailability.
pub const RETRYABLE_DOWNLOAD_STATUSES: &[u16] = &[403, 410, 429, 502, 503, 504];

/// Classified failures of a generation run.
///
/// Helpers propagate these inside `anyhow::Error` chains; callers classify
/// with [`RunError::from_anyhow`] rather than string matching.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    /// Missing credential, unknown model, and similar. Fatal, no retry.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An input image that cannot be used. Fatal for that input.
    #[error("invalid input image: {0}")]
    Validation(String),

    /// A retryable HTTP status while fetching a finished output. Retried at
    /// most once via URL refresh, then fatal.
    #[error("output download failed with status {status} ({url})")]
    TransientProvider { status: u16, url: String },

    /// The provider terminally failed the work. Fatal, no retry.
    #[error("generation failed: {0}")]
    TerminalProvider(String),

    /// Cancellation was observed. Fatal, but distinguishable so callers can
    /// suppress user-facing error noise.
    #[error("generation aborted")]
    Aborted,

    /// A bounded poll exhausted its wait budget.
    #[error("polling timed out after {secs:.1}s", secs = .0.as_secs_f64())]
    TimedOut(Duration),
}

impl RunError {
    pub fn from_anyhow(err: &anyhow::Error) -> Option<&RunError> {
        err.downcast_ref::<RunError>()
    }

    pub fn is_aborted(err: &anyhow::Error) -> bool {
        matches!(Self::from_anyhow(err), Some(RunError::Aborted))
    }

    /// Status code of a download failure that merits a URL refresh.
    pub fn retryable_download_status(err: &anyhow::Error) -> Option<u16> {
        match Self::from_anyhow(err) {
            Some(RunError::TransientProvider { status, .. })
                if RETRYABLE_DOWNLOAD_STATUSES.contains(status) =>
            {
                Some(*status)
            }
            _ => None,
        }
    }
}
