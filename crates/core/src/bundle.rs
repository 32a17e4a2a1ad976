//! Bundle (snapshot) upload coordination.
//!
//! A bundle is a client-computed snapshot of its decrypted state at some
//! sequence number. The coordinator checks the advisory lock, enforces
//! watermark monotonicity against the user record, streams the body into
//! the blob store without buffering it, then advances the watermark on
//! the user record and in the projection. Two concurrent uploads at
//! distinct sequence numbers are safe: the watermark updates are
//! last-write-wins and any bundle at sequence S correctly reconstructs
//! state up to S.

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use object_store::path::Path;
use object_store::{Attribute, Attributes, MultipartUpload, PutMultipartOpts, PutPayload};
use tracing::{debug, warn};

use crate::errors::{SyncError, SyncResult};
use crate::lock::BundleLocks;
use crate::logcache::LogCache;
use crate::store::{BlobStoreRef, RecordStoreRef};

/// Byte stream carrying an uploaded bundle body.
pub type BundleBody = BoxStream<'static, std::io::Result<Bytes>>;

/// Blob-store key for a user's bundle at the given watermark.
pub fn bundle_path(user_id: &str, bundle_seq_no: u64) -> Path {
    Path::from(format!("{user_id}/{bundle_seq_no}"))
}

/// Coordinates snapshot uploads against live writes.
pub struct BundleCoordinator {
    record_store: RecordStoreRef,
    blob_store: BlobStoreRef,
    cache: Arc<LogCache>,
    locks: Arc<BundleLocks>,
}

impl BundleCoordinator {
    /// A coordinator over the given stores, projection cache and lock
    /// table.
    pub fn new(
        record_store: RecordStoreRef,
        blob_store: BlobStoreRef,
        cache: Arc<LogCache>,
        locks: Arc<BundleLocks>,
    ) -> Self {
        BundleCoordinator {
            record_store,
            blob_store,
            cache,
            locks,
        }
    }

    /// Acquire the advisory upload lock for `user_id`.
    pub fn acquire_lock(&self, user_id: &str) -> Option<String> {
        self.locks.acquire(user_id)
    }

    /// Release a previously acquired lock; returns whether the caller
    /// owned it.
    pub fn release_lock(&self, user_id: &str, lock_token: &str) -> bool {
        self.locks.release(user_id, lock_token)
    }

    /// Upload a bundle at `proposed_bundle_seq_no` and advance the
    /// user's watermark.
    ///
    /// The lock is released on the way out of every path that runs after
    /// ownership is confirmed, success and failure alike.
    pub async fn upload_bundle(
        &self,
        user_id: &str,
        proposed_bundle_seq_no: u64,
        lock_token: &str,
        content_type: Option<&str>,
        body: BundleBody,
    ) -> SyncResult<()> {
        if proposed_bundle_seq_no == 0 {
            return Err(SyncError::BadInput(
                "bundle sequence number must be provided and non-zero".to_owned(),
            ));
        }
        if lock_token.is_empty() {
            return Err(SyncError::BadInput(
                "bundle lock token must be provided".to_owned(),
            ));
        }
        if !self.locks.owns(user_id, lock_token) {
            return Err(SyncError::Unauthorized);
        }

        let outcome = self
            .upload_locked(user_id, proposed_bundle_seq_no, content_type, body)
            .await;
        self.locks.release(user_id, lock_token);
        outcome
    }

    async fn upload_locked(
        &self,
        user_id: &str,
        proposed_bundle_seq_no: u64,
        content_type: Option<&str>,
        body: BundleBody,
    ) -> SyncResult<()> {
        let user = self
            .record_store
            .get_user(user_id)
            .await?
            .ok_or_else(|| SyncError::Internal(format!("no user record for '{user_id}'")))?;
        if user.bundle_seq_no >= proposed_bundle_seq_no {
            return Err(SyncError::BadInput(format!(
                "bundle sequence number {proposed_bundle_seq_no} must be greater than the current {}",
                user.bundle_seq_no
            )));
        }

        if let Err(err) = self
            .stream_to_blob_store(user_id, proposed_bundle_seq_no, content_type, body)
            .await
        {
            warn!(
                user_id,
                bundle_seq_no = proposed_bundle_seq_no,
                error = %err,
                "bundle upload failed"
            );
            return Err(err);
        }

        self.record_store
            .update_user_bundle_seq_no(&user.username, proposed_bundle_seq_no)
            .await?;
        self.cache
            .user_log(user_id)
            .await?
            .set_bundle_seq_no(proposed_bundle_seq_no);
        debug!(
            user_id,
            bundle_seq_no = proposed_bundle_seq_no,
            "bundle upload complete"
        );
        Ok(())
    }

    async fn stream_to_blob_store(
        &self,
        user_id: &str,
        bundle_seq_no: u64,
        content_type: Option<&str>,
        mut body: BundleBody,
    ) -> SyncResult<()> {
        let location = bundle_path(user_id, bundle_seq_no);
        let mut attributes = Attributes::new();
        if let Some(content_type) = content_type {
            attributes.insert(Attribute::ContentType, content_type.to_owned().into());
        }
        let opts = PutMultipartOpts {
            attributes,
            ..Default::default()
        };
        let mut upload = self
            .blob_store
            .put_multipart_opts(&location, opts)
            .await
            .map_err(SyncError::transient)?;
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = upload.abort().await;
                    return Err(SyncError::transient(err));
                }
            };
            if let Err(err) = upload.put_part(PutPayload::from_bytes(chunk)).await {
                let _ = upload.abort().await;
                return Err(SyncError::transient(err));
            }
        }
        upload.complete().await.map_err(SyncError::transient)?;
        Ok(())
    }
}
