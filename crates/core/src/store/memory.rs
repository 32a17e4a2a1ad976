//! In-memory [`RecordStore`] used by tests and single-process
//! deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{PutCondition, RecordStore, RecordStoreError, UserRecord};
use crate::transaction::{Command, Transaction};

#[derive(Debug, Default)]
struct Inner {
    /// Keyed by `(user_id, sequence_no)`; the BTreeMap keeps per-user
    /// scans in ascending sequence order.
    transactions: BTreeMap<(String, u64), Transaction>,
    /// Keyed by username, matching the durable user table.
    users: HashMap<String, UserRecord>,
}

/// A [`RecordStore`] over process memory, with the same conditional-put
/// semantics as the DynamoDB adapter.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    inner: Mutex<Inner>,
}

impl InMemoryRecordStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user record, replacing any record with the same username.
    pub fn register_user(&self, record: UserRecord) {
        let mut inner = self.inner.lock().unwrap();
        inner.users.insert(record.username.clone(), record);
    }

    /// Direct read of a stored transaction.
    pub fn transaction(&self, user_id: &str, sequence_no: u64) -> Option<Transaction> {
        let inner = self.inner.lock().unwrap();
        inner
            .transactions
            .get(&(user_id.to_owned(), sequence_no))
            .cloned()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn put_transaction(
        &self,
        tx: &Transaction,
        condition: PutCondition,
    ) -> Result<(), RecordStoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (tx.user_id.clone(), tx.sequence_no);
        let allowed = match (condition, inner.transactions.get(&key)) {
            (PutCondition::IfAbsent, existing) => existing.is_none(),
            (PutCondition::IfAbsentOrRolledBack, existing) => {
                existing.map_or(true, |t| t.command == Command::Rollback)
            }
        };
        if !allowed {
            return Err(RecordStoreError::Conflict {
                user_id: tx.user_id.clone(),
                sequence_no: tx.sequence_no,
            });
        }
        inner.transactions.insert(key, tx.clone());
        Ok(())
    }

    async fn update_user_bundle_seq_no(
        &self,
        username: &str,
        bundle_seq_no: u64,
    ) -> Result<(), RecordStoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.users.get_mut(username) {
            Some(user) => {
                user.bundle_seq_no = bundle_seq_no;
                Ok(())
            }
            None => Err(RecordStoreError::inconsistent(format!(
                "no user record for username '{username}'"
            ))),
        }
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, RecordStoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .users
            .values()
            .find(|user| user.user_id == user_id)
            .cloned())
    }

    async fn scan_transactions(&self, user_id: &str) -> Result<Vec<Transaction>, RecordStoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .transactions
            .range((user_id.to_owned(), 0)..=(user_id.to_owned(), u64::MAX))
            .map(|(_, tx)| tx.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn tx(sequence_no: u64, command: Command) -> Transaction {
        Transaction {
            user_id: "u".to_owned(),
            sequence_no,
            item_id: "item".to_owned(),
            command,
            record: command.carries_record().then(|| Bytes::from_static(b"x")),
        }
    }

    #[tokio::test]
    async fn insert_if_absent_rejects_existing() {
        let store = InMemoryRecordStore::new();
        store
            .put_transaction(&tx(0, Command::Insert), PutCondition::IfAbsent)
            .await
            .unwrap();
        let err = store
            .put_transaction(&tx(0, Command::Insert), PutCondition::IfAbsent)
            .await
            .unwrap_err();
        assert!(matches!(err, RecordStoreError::Conflict { sequence_no: 0, .. }));
    }

    #[tokio::test]
    async fn rollback_rewrite_allowed_only_over_rollback() {
        let store = InMemoryRecordStore::new();
        store
            .put_transaction(&tx(0, Command::Insert), PutCondition::IfAbsent)
            .await
            .unwrap();
        // The slot holds a live insert: the rewrite must be rejected.
        let err = store
            .put_transaction(&tx(0, Command::Rollback), PutCondition::IfAbsentOrRolledBack)
            .await
            .unwrap_err();
        assert!(matches!(err, RecordStoreError::Conflict { .. }));

        // An absent slot and a rollback slot both accept the marker.
        store
            .put_transaction(&tx(1, Command::Rollback), PutCondition::IfAbsentOrRolledBack)
            .await
            .unwrap();
        store
            .put_transaction(&tx(1, Command::Rollback), PutCondition::IfAbsentOrRolledBack)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn scans_are_per_user_and_ordered() {
        let store = InMemoryRecordStore::new();
        for seq in [2u64, 0, 1] {
            let mut t = tx(seq, Command::Insert);
            t.user_id = "a".to_owned();
            store
                .put_transaction(&t, PutCondition::IfAbsent)
                .await
                .unwrap();
        }
        let mut other = tx(0, Command::Insert);
        other.user_id = "b".to_owned();
        store
            .put_transaction(&other, PutCondition::IfAbsent)
            .await
            .unwrap();

        let scanned = store.scan_transactions("a").await.unwrap();
        let seqs: Vec<u64> = scanned.iter().map(|t| t.sequence_no).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn user_lookup_is_by_user_id() {
        let store = InMemoryRecordStore::new();
        store.register_user(UserRecord {
            username: "alice".to_owned(),
            user_id: "u-1".to_owned(),
            bundle_seq_no: 0,
        });
        let user = store.get_user("u-1").await.unwrap().unwrap();
        assert_eq!(user.username, "alice");
        assert!(store.get_user("u-2").await.unwrap().is_none());

        store.update_user_bundle_seq_no("alice", 7).await.unwrap();
        assert_eq!(store.get_user("u-1").await.unwrap().unwrap().bundle_seq_no, 7);
    }
}
