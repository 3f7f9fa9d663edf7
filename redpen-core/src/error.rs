//! Error types for the feedback store and the watch registry.

use std::path::PathBuf;

use crate::types::ItemKey;

/// Failures surfaced by [`crate::store::FeedbackStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Malformed or inconsistent input. Never retried.
    #[error("invalid feedback: {0}")]
    Validation(String),

    /// The key is absent from the collection the operation expected.
    #[error("no feedback at {0}")]
    NotFound(ItemKey),

    /// The operation would break a lifecycle rule.
    #[error("{0}")]
    Conflict(String),

    /// A backing file could not be written.
    #[error("cannot write {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot encode feedback document: {0}")]
    Encode(#[from] serde_yaml::Error),
}

impl StoreError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Storage { path: path.into(), source }
    }
}

/// Failures of the native directory watcher.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("cannot watch {}: {source}", root.display())]
    Start {
        root: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("cannot stop watching {}: {source}", root.display())]
    Close {
        root: PathBuf,
        #[source]
        source: notify::Error,
    },
}
