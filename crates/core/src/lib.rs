//! Per-user transactional log engine for an end-to-end encrypted sync
//! service.
//!
//! Each user owns an append-only log of opaque encrypted records.
//! Clients replicate the log and periodically upload a compacted
//! snapshot ("bundle") of their local state; the server never sees
//! plaintext. This crate arbitrates ordering, durability, and delivery
//! of the encrypted blobs:
//!
//! - sequence numbers are assigned monotonically per user at a single
//!   serialization point ([`logcache::UserLog`]);
//! - every transaction is conditionally persisted to a
//!   strongly-consistent record store ([`store::RecordStore`]) and
//!   rolled back when the insert fails ([`engine::TransactionEngine`]);
//! - bundle uploads stream through the blob store under an advisory
//!   per-user lock ([`bundle::BundleCoordinator`], [`lock::BundleLocks`]);
//! - tailing reads and snapshot downloads are served by
//!   [`read::ReadPath`].
//!
//! Transports are thin glue over [`SyncService`]:
//!
//! ```rust
//! use std::sync::Arc;
//! use vaultlog_core::config::EngineConfig;
//! use vaultlog_core::store::{InMemoryRecordStore, UserRecord};
//! use vaultlog_core::{Command, SyncService, WriteRequest};
//!
//! #[tokio::main]
//! async fn main() {
//!     let records = Arc::new(InMemoryRecordStore::new());
//!     records.register_user(UserRecord {
//!         username: "alice".to_owned(),
//!         user_id: "u-1".to_owned(),
//!         bundle_seq_no: 0,
//!     });
//!     let blobs = Arc::new(object_store::memory::InMemory::new());
//!     let service = SyncService::new(records, blobs, EngineConfig::default());
//!
//!     let request = WriteRequest::new("u-1", "item-1", Command::Insert)
//!         .with_record(&b"ciphertext"[..]);
//!     let sequence_no = service.submit(request).await.unwrap();
//!     assert_eq!(sequence_no, 0);
//! }
//! ```
//!
//! Production deployments plug in the DynamoDB/S3 backends from the
//! `vaultlog-aws` crate.

pub mod bundle;
pub mod config;
pub mod engine;
pub mod errors;
pub mod lock;
pub mod logcache;
pub mod read;
pub mod service;
pub mod store;
pub mod transaction;

pub use errors::{SyncError, SyncResult};
pub use service::{Action, SyncService};
pub use transaction::{Command, Transaction, WriteRequest};

/// Convenience re-export of the object store crate.
pub use object_store;
