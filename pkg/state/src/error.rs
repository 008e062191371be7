use thiserror::Error;

/// Errors surfaced by the coordination store.
///
/// `Backend` failures are transient from a caller's point of view: the
/// operation may be retried on the next tick. `Decode` means a record at a
/// known key no longer parses and retrying will not help.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),

    #[error("record at {key} failed to decode: {reason}")]
    Decode { key: String, reason: String },
}

impl StoreError {
    pub fn decode(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        StoreError::Decode {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}
