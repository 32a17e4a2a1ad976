//! Transport-facing operation surface.
//!
//! Transports (HTTP routing, WebSocket framing, authentication) are thin
//! glue over [`SyncService`]: they resolve the caller to a user id, map
//! the request's action tag through [`Action`], and call the matching
//! operation.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::bundle::{BundleBody, BundleCoordinator};
use crate::config::EngineConfig;
use crate::engine::TransactionEngine;
use crate::errors::{SyncError, SyncResult};
use crate::lock::BundleLocks;
use crate::logcache::LogCache;
use crate::read::{BundleDownload, ReadPath, TransactionTail};
use crate::store::{BlobStoreRef, RecordStoreRef};
use crate::transaction::WriteRequest;

/// Closed set of action tags accepted from the transport layer.
///
/// Unknown tags fail to parse as `BadInput`; nothing maps to the
/// engine-internal rollback command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Single insert write.
    Insert,
    /// Single update write.
    Update,
    /// Single delete write.
    Delete,
    /// Batched writes, committed per-transaction.
    BatchTransaction,
    /// Bundle upload.
    Bundle,
    /// Tail read of the transaction log.
    QueryTransactionLog,
    /// Streaming bundle download.
    QueryDbState,
    /// Acquire the advisory bundle lock.
    AcquireBundleLock,
    /// Release the advisory bundle lock.
    ReleaseBundleLock,
}

impl Action {
    /// Wire name of the action tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::BatchTransaction => "batchTransaction",
            Action::Bundle => "bundle",
            Action::QueryTransactionLog => "queryTransactionLog",
            Action::QueryDbState => "queryDbState",
            Action::AcquireBundleLock => "acquireBundleLock",
            Action::ReleaseBundleLock => "releaseBundleLock",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Action::Insert),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            "batchTransaction" => Ok(Action::BatchTransaction),
            "bundle" => Ok(Action::Bundle),
            "queryTransactionLog" => Ok(Action::QueryTransactionLog),
            "queryDbState" => Ok(Action::QueryDbState),
            "acquireBundleLock" => Ok(Action::AcquireBundleLock),
            "releaseBundleLock" => Ok(Action::ReleaseBundleLock),
            other => Err(SyncError::BadInput(format!("unknown action '{other}'"))),
        }
    }
}

/// The engine-facing operations, wired over shared component state.
pub struct SyncService {
    engine: TransactionEngine,
    bundles: BundleCoordinator,
    reads: ReadPath,
}

impl SyncService {
    /// Assemble the engine over the given stores.
    pub fn new(record_store: RecordStoreRef, blob_store: BlobStoreRef, config: EngineConfig) -> Self {
        let config = Arc::new(config);
        let cache = Arc::new(LogCache::new(record_store.clone()));
        let locks = Arc::new(BundleLocks::new(config.bundle_lock_lease));
        SyncService {
            engine: TransactionEngine::new(record_store.clone(), cache.clone(), config),
            bundles: BundleCoordinator::new(record_store, blob_store.clone(), cache.clone(), locks),
            reads: ReadPath::new(cache, blob_store),
        }
    }

    /// Submit one write; returns the assigned sequence number.
    pub async fn submit(&self, request: WriteRequest) -> SyncResult<u64> {
        self.engine.submit(request).await
    }

    /// Submit several writes; sequence numbers in input order.
    pub async fn submit_batch(&self, requests: Vec<WriteRequest>) -> SyncResult<Vec<u64>> {
        self.engine.submit_batch(requests).await
    }

    /// The user's bundle watermark and committed tail.
    pub async fn query_transaction_log(&self, user_id: &str) -> SyncResult<TransactionTail> {
        self.reads.query_transaction_log(user_id).await
    }

    /// Stream the user's bundle at the given watermark.
    pub async fn query_db_state(
        &self,
        user_id: &str,
        bundle_seq_no: u64,
    ) -> SyncResult<BundleDownload> {
        self.reads.query_db_state(user_id, bundle_seq_no).await
    }

    /// Acquire the advisory bundle lock for `user_id`.
    pub fn acquire_bundle_lock(&self, user_id: &str) -> Option<String> {
        self.bundles.acquire_lock(user_id)
    }

    /// Release the advisory bundle lock; returns whether the caller
    /// owned it.
    pub fn release_bundle_lock(&self, user_id: &str, lock_token: &str) -> bool {
        self.bundles.release_lock(user_id, lock_token)
    }

    /// Upload a bundle and advance the user's watermark.
    pub async fn upload_bundle(
        &self,
        user_id: &str,
        proposed_bundle_seq_no: u64,
        lock_token: &str,
        content_type: Option<&str>,
        body: BundleBody,
    ) -> SyncResult<()> {
        self.bundles
            .upload_bundle(
                user_id,
                proposed_bundle_seq_no,
                lock_token,
                content_type,
                body,
            )
            .await
    }
}
