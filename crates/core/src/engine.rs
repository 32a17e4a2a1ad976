//! The transactional write path.
//!
//! Writes move through three steps: allocate a sequence number in the
//! per-user projection, attempt a conditional durable insert, then mark
//! the slot committed. A failed insert schedules a rollback on a
//! detached task and reports a transient failure to the caller; the
//! rollback's own outcome never reaches them. Every allocated sequence
//! number is driven to a terminal state, if necessary by the projection
//! rebuild after a restart.

use std::sync::Arc;

use futures::future;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::errors::{SyncError, SyncResult};
use crate::logcache::{LogCache, UserLog};
use crate::store::{PutCondition, RecordStore, RecordStoreError, RecordStoreRef};
use crate::transaction::{Command, Transaction, WriteRequest};

/// Orchestrates the write path: allocate, persist, commit or roll back.
#[derive(Debug, Clone)]
pub struct TransactionEngine {
    store: RecordStoreRef,
    cache: Arc<LogCache>,
    config: Arc<EngineConfig>,
}

impl TransactionEngine {
    /// An engine writing through the given store and projection cache.
    pub fn new(store: RecordStoreRef, cache: Arc<LogCache>, config: Arc<EngineConfig>) -> Self {
        TransactionEngine {
            store,
            cache,
            config,
        }
    }

    /// Submit one write; returns the assigned sequence number.
    pub async fn submit(&self, request: WriteRequest) -> SyncResult<u64> {
        validate_request(&request, &self.config)?;
        self.submit_validated(request).await
    }

    /// Submit several writes; sequence numbers are returned in input
    /// order.
    ///
    /// Submissions are initiated concurrently and awaited together.
    /// Writes are per-transaction atomic, not per-batch: when one fails
    /// the batch surfaces that failure, but submissions that already
    /// persisted stay committed.
    pub async fn submit_batch(&self, requests: Vec<WriteRequest>) -> SyncResult<Vec<u64>> {
        validate_batch(&requests, &self.config)?;
        future::join_all(
            requests
                .into_iter()
                .map(|request| self.submit_validated(request)),
        )
        .await
        .into_iter()
        .collect()
    }

    async fn submit_validated(&self, request: WriteRequest) -> SyncResult<u64> {
        let log = self.cache.user_log(&request.user_id).await?;
        let tx = log.push_transaction(&request);
        match self
            .store
            .put_transaction(&tx, PutCondition::IfAbsent)
            .await
        {
            Ok(()) => {
                log.mark_committed(tx.sequence_no);
                debug!(
                    user_id = %tx.user_id,
                    sequence_no = tx.sequence_no,
                    command = %tx.command,
                    "transaction committed"
                );
                Ok(tx.sequence_no)
            }
            Err(err) => {
                warn!(
                    user_id = %tx.user_id,
                    sequence_no = tx.sequence_no,
                    error = %err,
                    "durable insert failed, scheduling rollback"
                );
                let store = self.store.clone();
                tokio::spawn(async move {
                    roll_back_failed_write(store.as_ref(), &log, &tx).await;
                });
                Err(SyncError::transient(err))
            }
        }
    }
}

/// Durably mark a failed write as rolled back.
///
/// Runs detached from the submitting caller. Idempotent: repeated
/// attempts on the same slot converge on the same terminal state.
pub(crate) async fn roll_back_failed_write(
    store: &dyn RecordStore,
    log: &UserLog,
    tx: &Transaction,
) {
    let marker = tx.rollback_marker();
    match store
        .put_transaction(&marker, PutCondition::IfAbsentOrRolledBack)
        .await
    {
        Ok(()) => {
            log.mark_rolled_back(marker.sequence_no);
            debug!(
                user_id = %marker.user_id,
                sequence_no = marker.sequence_no,
                "slot rolled back"
            );
        }
        Err(RecordStoreError::Conflict { .. }) => {
            // The conditional rewrite was rejected, so the slot holds a
            // live non-rollback record: the insert the caller saw fail
            // actually reached the store. Expose it.
            info!(
                user_id = %tx.user_id,
                sequence_no = tx.sequence_no,
                "insert reported failure but was durable, marking committed"
            );
            log.mark_committed(tx.sequence_no);
        }
        Err(err) => {
            // The slot stays pending; the projection rebuild after a
            // restart resolves it.
            warn!(
                user_id = %tx.user_id,
                sequence_no = tx.sequence_no,
                error = %err,
                "rollback attempt failed"
            );
        }
    }
}

fn validate_request(request: &WriteRequest, config: &EngineConfig) -> SyncResult<()> {
    if request.item_id.is_empty() {
        return Err(SyncError::BadInput("item id must not be empty".to_owned()));
    }
    match request.command {
        Command::Rollback => {
            return Err(SyncError::BadInput(
                "Rollback is not a client command".to_owned(),
            ));
        }
        Command::Insert | Command::Update => {
            if request.record.is_none() {
                return Err(SyncError::BadInput(format!(
                    "{} requires a record",
                    request.command
                )));
            }
        }
        Command::Delete => {
            if request.record.is_some() {
                return Err(SyncError::BadInput(
                    "Delete must not carry a record".to_owned(),
                ));
            }
        }
    }
    if request.record_len() > config.max_item_bytes {
        return Err(SyncError::BadInput(format!(
            "record of {} bytes exceeds the {} byte limit",
            request.record_len(),
            config.max_item_bytes
        )));
    }
    Ok(())
}

fn validate_batch(requests: &[WriteRequest], config: &EngineConfig) -> SyncResult<()> {
    let mut total_bytes = 0usize;
    let mut deletes = 0usize;
    for request in requests {
        validate_request(request, config)?;
        total_bytes += request.record_len();
        if request.command == Command::Delete {
            deletes += 1;
        }
    }
    if total_bytes > config.max_batch_bytes {
        return Err(SyncError::BadInput(format!(
            "batch payload of {total_bytes} bytes exceeds the {} byte limit",
            config.max_batch_bytes
        )));
    }
    if deletes > config.max_batch_deletes {
        return Err(SyncError::BadInput(format!(
            "batch contains {deletes} deletes, more than the {} allowed",
            config.max_batch_deletes
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::store::{InMemoryRecordStore, UserRecord};

    /// What a scripted store does with the next `put_transaction` call.
    #[derive(Debug, Clone, Copy)]
    enum PutOutcome {
        /// Behave like the real store.
        Delegate,
        /// Persist the record, then report a transient failure anyway.
        PersistThenTransient,
        /// Report a transient failure without persisting anything.
        TransientWithoutPersist,
    }

    /// Delegating store that injects failures according to a script;
    /// calls past the end of the script delegate.
    #[derive(Debug)]
    struct ScriptedStore {
        inner: InMemoryRecordStore,
        script: Mutex<VecDeque<PutOutcome>>,
    }

    impl ScriptedStore {
        fn with_script(outcomes: impl IntoIterator<Item = PutOutcome>) -> Arc<Self> {
            Arc::new(ScriptedStore {
                inner: InMemoryRecordStore::new(),
                script: Mutex::new(outcomes.into_iter().collect()),
            })
        }

        fn injected() -> RecordStoreError {
            RecordStoreError::transient(std::io::Error::other("injected store failure"))
        }
    }

    #[async_trait]
    impl RecordStore for ScriptedStore {
        async fn put_transaction(
            &self,
            tx: &Transaction,
            condition: PutCondition,
        ) -> Result<(), RecordStoreError> {
            let outcome = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(PutOutcome::Delegate);
            match outcome {
                PutOutcome::Delegate => self.inner.put_transaction(tx, condition).await,
                PutOutcome::PersistThenTransient => {
                    self.inner.put_transaction(tx, condition).await?;
                    Err(Self::injected())
                }
                PutOutcome::TransientWithoutPersist => Err(Self::injected()),
            }
        }

        async fn update_user_bundle_seq_no(
            &self,
            username: &str,
            bundle_seq_no: u64,
        ) -> Result<(), RecordStoreError> {
            self.inner
                .update_user_bundle_seq_no(username, bundle_seq_no)
                .await
        }

        async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, RecordStoreError> {
            self.inner.get_user(user_id).await
        }

        async fn scan_transactions(
            &self,
            user_id: &str,
        ) -> Result<Vec<Transaction>, RecordStoreError> {
            self.inner.scan_transactions(user_id).await
        }
    }

    fn engine_over(store: Arc<ScriptedStore>) -> (TransactionEngine, Arc<LogCache>) {
        let store: RecordStoreRef = store;
        let cache = Arc::new(LogCache::new(store.clone()));
        let engine = TransactionEngine::new(store, cache.clone(), Arc::new(EngineConfig::default()));
        (engine, cache)
    }

    fn insert(item_id: &str) -> WriteRequest {
        WriteRequest::new("u", item_id, Command::Insert).with_record(Bytes::from_static(b"cipher"))
    }

    /// Wait for the detached rollback task to settle the slot.
    async fn settle<F: Fn() -> bool>(done: F) {
        for _ in 0..100 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("background rollback did not settle");
    }

    #[tokio::test]
    async fn transient_insert_that_landed_is_exposed_as_committed() {
        let store = ScriptedStore::with_script([PutOutcome::PersistThenTransient]);
        let (engine, cache) = engine_over(store.clone());

        let err = engine.submit(insert("a")).await.unwrap_err();
        assert!(matches!(err, SyncError::TransientWriteFailure { .. }));

        // The rollback rewrite conflicts with the durable insert, so the
        // engine concludes the write landed and commits the slot.
        let log = cache.user_log("u").await.unwrap();
        settle(|| !log.committed_from(0).is_empty()).await;
        let tail = log.committed_from(0);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].item_id, "a");
        assert_eq!(tail[0].command, Command::Insert);
        assert_eq!(
            store.inner.transaction("u", 0).unwrap().command,
            Command::Insert
        );
    }

    #[tokio::test]
    async fn failed_insert_is_rolled_back_durably() {
        let store = ScriptedStore::with_script([PutOutcome::TransientWithoutPersist]);
        let (engine, cache) = engine_over(store.clone());

        let err = engine.submit(insert("a")).await.unwrap_err();
        assert!(matches!(err, SyncError::TransientWriteFailure { .. }));

        settle(|| store.inner.transaction("u", 0).is_some()).await;
        assert_eq!(
            store.inner.transaction("u", 0).unwrap().command,
            Command::Rollback
        );
        let log = cache.user_log("u").await.unwrap();
        assert!(log.committed_from(0).is_empty());

        // The sequence number is consumed, never reissued.
        assert_eq!(engine.submit(insert("b")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn transient_rollback_is_resolved_by_restart() {
        let store = ScriptedStore::with_script([
            PutOutcome::TransientWithoutPersist,
            PutOutcome::TransientWithoutPersist,
        ]);
        let (engine, cache) = engine_over(store.clone());

        engine.submit(insert("a")).await.unwrap_err();
        // Both the insert and the rollback marker were dropped; the slot
        // stays pending in this process.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.inner.transaction("u", 0).is_none());
        assert!(cache.user_log("u").await.unwrap().committed_from(0).is_empty());

        // A rebuilt projection never sees the lost slot; the sequence
        // number is reissued and the write succeeds.
        let (restarted, _) = engine_over(store);
        assert_eq!(restarted.submit(insert("b")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rollback_is_idempotent() {
        let store = ScriptedStore::with_script([]);
        let (_, cache) = engine_over(store.clone());
        let log = cache.user_log("u").await.unwrap();
        let tx = log.push_transaction(&insert("a"));

        roll_back_failed_write(store.as_ref(), &log, &tx).await;
        roll_back_failed_write(store.as_ref(), &log, &tx).await;

        assert_eq!(
            store.inner.transaction("u", 0).unwrap().command,
            Command::Rollback
        );
        assert!(log.committed_from(0).is_empty());
    }

    #[tokio::test]
    async fn batch_partial_failure_keeps_committed_writes() {
        let store = ScriptedStore::with_script([
            PutOutcome::Delegate,
            PutOutcome::TransientWithoutPersist,
            PutOutcome::Delegate,
        ]);
        let (engine, cache) = engine_over(store.clone());

        let err = engine
            .submit_batch(vec![insert("a"), insert("b"), insert("c")])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::TransientWriteFailure { .. }));

        // The first and third submissions stay committed.
        let log = cache.user_log("u").await.unwrap();
        settle(|| log.committed_from(0).len() == 2).await;
        let committed = log.committed_from(0);
        let items: Vec<&str> = committed.iter().map(|t| t.item_id.as_str()).collect();
        assert_eq!(items, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn validation_rejects_before_touching_any_state() {
        let store = ScriptedStore::with_script([]);
        let (engine, _) = engine_over(store.clone());

        let oversize = WriteRequest::new("u", "a", Command::Insert)
            .with_record(vec![0u8; crate::config::DEFAULT_MAX_ITEM_BYTES + 1]);
        assert!(matches!(
            engine.submit(oversize).await.unwrap_err(),
            SyncError::BadInput(_)
        ));
        assert!(matches!(
            engine
                .submit(WriteRequest::new("u", "", Command::Delete))
                .await
                .unwrap_err(),
            SyncError::BadInput(_)
        ));
        assert!(matches!(
            engine
                .submit(WriteRequest::new("u", "a", Command::Rollback))
                .await
                .unwrap_err(),
            SyncError::BadInput(_)
        ));
        assert!(matches!(
            engine
                .submit(WriteRequest::new("u", "a", Command::Insert))
                .await
                .unwrap_err(),
            SyncError::BadInput(_)
        ));
        assert!(matches!(
            engine
                .submit(WriteRequest::new("u", "a", Command::Delete).with_record(vec![1u8]))
                .await
                .unwrap_err(),
            SyncError::BadInput(_)
        ));

        // No sequence number was consumed by any rejected request.
        assert_eq!(engine.submit(insert("a")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn batch_caps_are_enforced() {
        let store = ScriptedStore::with_script([]);
        let (engine, _) = engine_over(store);

        let deletes: Vec<WriteRequest> = (0..101)
            .map(|i| WriteRequest::new("u", format!("item-{i}"), Command::Delete))
            .collect();
        assert!(matches!(
            engine.submit_batch(deletes).await.unwrap_err(),
            SyncError::BadInput(_)
        ));

        // 26 records of 400 KiB exceed the 10 MiB batch cap even though
        // each record is individually acceptable.
        let oversized_total: Vec<WriteRequest> = (0..26)
            .map(|i| {
                WriteRequest::new("u", format!("item-{i}"), Command::Insert)
                    .with_record(vec![0u8; crate::config::DEFAULT_MAX_ITEM_BYTES])
            })
            .collect();
        assert!(matches!(
            engine.submit_batch(oversized_total).await.unwrap_err(),
            SyncError::BadInput(_)
        ));

        // An empty batch is a no-op.
        assert_eq!(engine.submit_batch(vec![]).await.unwrap(), Vec::<u64>::new());
    }
}
