use thiserror::Error;

/// Errors raised by a [`RuntimeStore`](crate::storage::RuntimeStore) backend.
///
/// Backend failures surface to the caller unmodified; the broker never
/// swallows a storage error while processing a report.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("stored payload could not be decoded: {0}")]
    Corrupt(String),
    #[error("unknown run {workflow_id}/{instance_id}")]
    UnknownRun {
        workflow_id: String,
        instance_id: String,
    },
}

impl StorageError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        StorageError::Backend(err.to_string())
    }
}
