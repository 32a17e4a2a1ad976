//! Durable storage interfaces.
//!
//! The record half of durable storage is the [`RecordStore`] trait: a
//! strongly-consistent key-value store holding per-user transaction logs
//! and the user records whose bundle watermark the engine maintains. The
//! blob half is the [`ObjectStore`] trait from the `object_store` crate,
//! used directly for streaming bundle uploads and downloads.
//!
//! Implementations of these interfaces are the only components that touch
//! the network; everything else in this crate is pure logic over
//! in-memory state plus these calls. Correctness is predicated on the
//! store's conditional-write guarantee: a put guarded by a
//! [`PutCondition`] either observes the predicate atomically or fails
//! with [`RecordStoreError::Conflict`].

use std::sync::Arc;

use async_trait::async_trait;
use object_store::ObjectStore;

use crate::transaction::Transaction;

pub(crate) mod memory;

pub use memory::InMemoryRecordStore;

/// Sharable reference to a [`RecordStore`].
pub type RecordStoreRef = Arc<dyn RecordStore>;

/// Sharable reference to the blob store holding bundles.
pub type BlobStoreRef = Arc<dyn ObjectStore>;

/// Conditional predicates applied to durable transaction writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutCondition {
    /// Insert only when no record exists at `(user_id, sequence_no)`.
    IfAbsent,
    /// Insert when absent, or overwrite when the existing record is a
    /// rollback marker.
    IfAbsentOrRolledBack,
}

/// Errors produced by [`RecordStore`] implementations.
#[derive(thiserror::Error, Debug)]
pub enum RecordStoreError {
    /// The conditional predicate on a put was violated.
    #[error("Conditional write failed for user '{user_id}' at sequence number {sequence_no}")]
    Conflict {
        /// Partition the write targeted.
        user_id: String,
        /// Sort position the write targeted.
        sequence_no: u64,
    },

    /// A stored item could not be interpreted.
    #[error("Record store item has invalid content: {description}")]
    InconsistentData {
        /// What was malformed.
        description: String,
    },

    /// The store could not be reached or the request did not complete.
    #[error("Transient record store failure: {source}")]
    Transient {
        /// Underlying failure.
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl RecordStoreError {
    /// Wrap an arbitrary failure as transient.
    pub fn transient(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transient {
            source: Box::new(source),
        }
    }

    /// A malformed-item error with the given description.
    pub fn inconsistent(description: impl Into<String>) -> Self {
        Self::InconsistentData {
            description: description.into(),
        }
    }
}

/// User record attributes visible to the engine.
///
/// The record itself is owned by account management; the engine reads it
/// and only ever rewrites `bundle_seq_no`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    /// Partition key of the user table.
    pub username: String,
    /// Opaque identifier used everywhere else in the engine.
    pub user_id: String,
    /// Sequence number covered by the user's latest bundle; 0 when the
    /// user has never bundled.
    pub bundle_seq_no: u64,
}

/// Strongly-consistent record store holding per-user transaction logs.
#[async_trait]
pub trait RecordStore: Send + Sync + std::fmt::Debug {
    /// Durably write `tx`, guarded by `condition`.
    async fn put_transaction(
        &self,
        tx: &Transaction,
        condition: PutCondition,
    ) -> Result<(), RecordStoreError>;

    /// Unconditionally set the bundle watermark on the user record.
    async fn update_user_bundle_seq_no(
        &self,
        username: &str,
        bundle_seq_no: u64,
    ) -> Result<(), RecordStoreError>;

    /// Look up a user record by user id.
    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, RecordStoreError>;

    /// Read the user's full transaction log in ascending sequence order.
    ///
    /// Used to rebuild the in-memory projection after a process restart;
    /// the scan must be consistent with all previously acknowledged
    /// writes.
    async fn scan_transactions(&self, user_id: &str) -> Result<Vec<Transaction>, RecordStoreError>;
}
