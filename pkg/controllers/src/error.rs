use thiserror::Error;

use pkg_labels::applicator::LabelError;
use pkg_labels::selector::SelectorError;
use pkg_state::error::StoreError;

/// Errors surfaced on a reconciler's diagnostic channel. None of them
/// terminate the loop; each send is a best-effort report of a tick that
/// went wrong and will be retried on the next event.
#[derive(Debug, Clone, Error)]
pub enum ControllerError {
    /// Retryable store or label-index I/O; the operation that hit it was
    /// skipped for this tick.
    #[error("transient store failure: {0}")]
    TransientStore(String),

    /// A selector failed to parse; the last good selector stays in effect.
    #[error(transparent)]
    SelectorParse(#[from] SelectorError),

    /// A record update violated an invariant and was refused; the
    /// previous record stays installed.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A store watch reported an error; the stream is still consumed.
    #[error("watch stream failure: {0}")]
    WatchStream(String),
}

impl From<LabelError> for ControllerError {
    fn from(e: LabelError) -> Self {
        match e {
            LabelError::Selector(e) => ControllerError::SelectorParse(e),
            other => ControllerError::TransientStore(other.to_string()),
        }
    }
}

impl From<StoreError> for ControllerError {
    fn from(e: StoreError) -> Self {
        ControllerError::TransientStore(e.to_string())
    }
}
