//! Error taxonomy for the cache engine.
//!
//! Read-path decode faults never reach callers (the offending entry is deleted
//! and the lookup becomes a miss). Everything in [`CacheError`] is something a
//! caller must see: write-path failures, tampered payloads, and storage outages.

use thiserror::Error;

use crate::backend::BackendError;

/// Error type returned by a [`Transport`](crate::engine::Transport).
pub type TransportError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the cache engine.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("serialization failed in stage `{stage}`: {message}")]
    Serialization { stage: String, message: String },

    #[error("integrity check failed in stage `{stage}`: payload was modified or signed with another key")]
    Integrity { stage: String },

    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(#[source] BackendError),

    #[error("invalid serializer pipeline: {0}")]
    InvalidPipeline(String),

    #[error("entry of {size} bytes exceeds the maximum entry size of {max} bytes")]
    EntryTooLarge { size: u64, max: u64 },

    #[error("no storage backend registered under `{0}`")]
    UnknownBackend(String),

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error("transport error: {0}")]
    Transport(#[source] TransportError),
}

impl CacheError {
    pub(crate) fn serialization(stage: &str, message: impl std::fmt::Display) -> Self {
        Self::Serialization {
            stage: stage.to_owned(),
            message: message.to_string(),
        }
    }

    pub(crate) fn integrity(stage: &str) -> Self {
        Self::Integrity {
            stage: stage.to_owned(),
        }
    }

    /// Returns `true` for errors caused by a tampered or foreign-keyed payload.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity { .. })
    }
}

impl From<BackendError> for CacheError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::EntryTooLarge { size, max } => Self::EntryTooLarge { size, max },
            other => Self::BackendUnavailable(other),
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_backend_error_maps_to_entry_too_large() {
        let err: CacheError = BackendError::EntryTooLarge { size: 10, max: 5 }.into();
        assert!(matches!(err, CacheError::EntryTooLarge { size: 10, max: 5 }));
    }

    #[test]
    fn io_backend_error_maps_to_unavailable() {
        let err: CacheError = BackendError::Unavailable("connection refused".into()).into();
        assert!(matches!(err, CacheError::BackendUnavailable(_)));
        assert!(!err.is_integrity());
    }
}
