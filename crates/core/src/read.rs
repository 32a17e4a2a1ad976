//! Serving transaction-log tails and snapshot downloads.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use object_store::{Attribute, Error as ObjectStoreError};

use crate::bundle::bundle_path;
use crate::errors::{SyncError, SyncResult};
use crate::logcache::LogCache;
use crate::store::BlobStoreRef;
use crate::transaction::Transaction;

/// A transaction-log tail: the bundle watermark and every committed
/// transaction past it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionTail {
    /// Watermark of the user's latest bundle; 0 when never bundled.
    pub bundle_seq_no: u64,
    /// Committed transactions with `sequence_no` past the watermark, in
    /// sequence order. Rolled-back slots appear as gaps.
    pub transactions: Vec<Transaction>,
}

/// A streaming snapshot download forwarded from the blob store.
pub struct BundleDownload {
    /// Size of the bundle body in bytes.
    pub content_length: u64,
    /// Content type the client uploaded, when one was recorded.
    pub content_type: Option<String>,
    /// The bundle body.
    pub stream: BoxStream<'static, object_store::Result<Bytes>>,
}

impl fmt::Debug for BundleDownload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleDownload")
            .field("content_length", &self.content_length)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Read-side surface over the log projection and the blob store.
pub struct ReadPath {
    cache: Arc<LogCache>,
    blob_store: BlobStoreRef,
}

impl ReadPath {
    /// A read path over the given projection cache and blob store.
    pub fn new(cache: Arc<LogCache>, blob_store: BlobStoreRef) -> Self {
        ReadPath { cache, blob_store }
    }

    /// The watermark and the committed tail past it.
    ///
    /// The pair is taken atomically with respect to watermark updates: a
    /// reader never observes an advanced watermark paired with a
    /// pre-truncation tail.
    pub async fn query_transaction_log(&self, user_id: &str) -> SyncResult<TransactionTail> {
        let log = self.cache.user_log(user_id).await?;
        let (bundle_seq_no, transactions) = log.tail();
        Ok(TransactionTail {
            bundle_seq_no,
            transactions,
        })
    }

    /// Stream the bundle stored for `user_id` at `bundle_seq_no`,
    /// forwarding content length and content type.
    pub async fn query_db_state(
        &self,
        user_id: &str,
        bundle_seq_no: u64,
    ) -> SyncResult<BundleDownload> {
        let location = bundle_path(user_id, bundle_seq_no);
        let result = self
            .blob_store
            .get(&location)
            .await
            .map_err(|err| match err {
                ObjectStoreError::NotFound { .. } => SyncError::NotFound {
                    user_id: user_id.to_owned(),
                    bundle_seq_no,
                },
                other => SyncError::transient(other),
            })?;
        let content_length = result.meta.size as u64;
        let content_type = result
            .attributes
            .get(&Attribute::ContentType)
            .map(|value| value.to_string());
        Ok(BundleDownload {
            content_length,
            content_type,
            stream: result.into_stream(),
        })
    }
}
