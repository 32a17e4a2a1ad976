//! Exceptions surfaced by the vaultlog engine.

use crate::store::RecordStoreError;

/// A result returned by vaultlog-core.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors reported to callers of the engine-facing operations.
///
/// Conditional-write conflicts never appear here: the write path always
/// interprets them locally (see the rollback handling in
/// [`crate::engine`]).
#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    /// Request failed validation. Never retried, reported verbatim.
    #[error("Invalid request: {0}")]
    BadInput(String),

    /// The caller does not hold a live bundle lock for the user.
    #[error("Bundle lock is not held by the caller")]
    Unauthorized,

    /// The requested bundle does not exist in the blob store.
    #[error("No bundle for user '{user_id}' at sequence number {bundle_seq_no}")]
    NotFound {
        /// User whose bundle was requested.
        user_id: String,
        /// Watermark the bundle was requested at.
        bundle_seq_no: u64,
    },

    /// A durable write did not complete. Callers retry idempotently with
    /// the same item id.
    #[error("Transient write failure: {source}")]
    TransientWriteFailure {
        /// Underlying store failure.
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// Invariant violation inside the engine; should not occur in steady
    /// state.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Wrap a store failure the caller may retry.
    pub fn transient(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::TransientWriteFailure {
            source: Box::new(source),
        }
    }
}

impl From<RecordStoreError> for SyncError {
    fn from(err: RecordStoreError) -> Self {
        match err {
            RecordStoreError::Transient { source } => SyncError::TransientWriteFailure { source },
            RecordStoreError::InconsistentData { description } => SyncError::Internal(description),
            // The engine resolves conflicts before they reach this boundary.
            RecordStoreError::Conflict {
                user_id,
                sequence_no,
            } => SyncError::Internal(format!(
                "unhandled conditional-write conflict for user '{user_id}' at sequence number {sequence_no}"
            )),
        }
    }
}
