//! In-memory projection of per-user transaction logs.
//!
//! The projection is the per-user serialization point of the engine:
//! sequence numbers are allocated under a single per-user mutex, so two
//! concurrent writers for one user always receive distinct, ordered
//! numbers, while different users never contend. The projection is
//! process-local; [`LogCache`] rebuilds it from the durable store on
//! first access after a restart.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::errors::SyncResult;
use crate::store::RecordStoreRef;
use crate::transaction::{Command, Transaction, WriteRequest};

/// Lifecycle states of a slot in the projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Sequence number allocated, durability still pending.
    Pending,
    /// Durably persisted and visible to readers.
    Committed,
    /// Durably replaced by a rollback marker; readers see a gap.
    RolledBack,
}

#[derive(Debug)]
struct Slot {
    tx: Transaction,
    state: SlotState,
}

#[derive(Debug, Default)]
struct LogState {
    /// Sequence number the next push will be assigned.
    next_seq: u64,
    /// Sequence number of the slot at the front of `slots`.
    /// Invariant: `next_seq == first_seq + slots.len()`.
    first_seq: u64,
    slots: VecDeque<Slot>,
    bundle_seq_no: u64,
}

impl LogState {
    fn slot_mut(&mut self, sequence_no: u64) -> Option<&mut Slot> {
        let index = sequence_no.checked_sub(self.first_seq)?;
        self.slots.get_mut(index as usize)
    }

    fn committed_from(&self, starting_seq_no: u64) -> Vec<Transaction> {
        self.slots
            .iter()
            .filter(|slot| {
                slot.tx.sequence_no >= starting_seq_no && slot.state == SlotState::Committed
            })
            .map(|slot| slot.tx.clone())
            .collect()
    }
}

/// First sequence number past the given watermark; a watermark of 0
/// means "never bundled" and the log is read from the beginning.
fn starting_seq_no(bundle_seq_no: u64) -> u64 {
    if bundle_seq_no == 0 {
        0
    } else {
        bundle_seq_no + 1
    }
}

/// Ordered in-memory log for a single user.
#[derive(Debug, Default)]
pub struct UserLog {
    state: Mutex<LogState>,
}

impl UserLog {
    /// Rebuild a projection from a durable scan and the user's bundle
    /// watermark.
    ///
    /// Rollback records hydrate as RolledBack and everything else as
    /// Committed; there are no Pending slots after a restart. Sequence
    /// numbers missing from the scan (a write whose insert and rollback
    /// marker both vanished) hydrate as RolledBack placeholders so the
    /// slot range stays contiguous.
    pub(crate) fn from_scan(transactions: Vec<Transaction>, bundle_seq_no: u64) -> Self {
        let start = starting_seq_no(bundle_seq_no);
        let mut state = LogState {
            next_seq: start,
            first_seq: start,
            slots: VecDeque::new(),
            bundle_seq_no,
        };
        for tx in transactions {
            if tx.sequence_no < state.first_seq {
                // Covered by the bundle; eligible for eviction anyway.
                continue;
            }
            while state.next_seq < tx.sequence_no {
                let marker = Transaction {
                    user_id: tx.user_id.clone(),
                    sequence_no: state.next_seq,
                    item_id: String::new(),
                    command: Command::Rollback,
                    record: None,
                };
                state.slots.push_back(Slot {
                    tx: marker,
                    state: SlotState::RolledBack,
                });
                state.next_seq += 1;
            }
            let slot_state = if tx.command == Command::Rollback {
                SlotState::RolledBack
            } else {
                SlotState::Committed
            };
            state.slots.push_back(Slot {
                tx,
                state: slot_state,
            });
            state.next_seq += 1;
        }
        UserLog {
            state: Mutex::new(state),
        }
    }

    /// Atomically allocate the next sequence number and append a Pending
    /// slot. The returned transaction carries the assigned number.
    pub fn push_transaction(&self, request: &WriteRequest) -> Transaction {
        let mut state = self.state.lock().unwrap();
        let sequence_no = state.next_seq;
        state.next_seq += 1;
        let tx = Transaction {
            user_id: request.user_id.clone(),
            sequence_no,
            item_id: request.item_id.clone(),
            command: request.command,
            record: request.record.clone(),
        };
        state.slots.push_back(Slot {
            tx: tx.clone(),
            state: SlotState::Pending,
        });
        tx
    }

    /// Mark the slot durably persisted. Idempotent; a no-op for slots
    /// already terminal or evicted.
    pub fn mark_committed(&self, sequence_no: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.slot_mut(sequence_no) {
            if slot.state == SlotState::Pending {
                slot.state = SlotState::Committed;
            }
        }
    }

    /// Mark the slot rolled back, overwriting its command with the
    /// rollback marker. Idempotent; legal from Pending or Committed.
    pub fn mark_rolled_back(&self, sequence_no: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.slot_mut(sequence_no) {
            slot.state = SlotState::RolledBack;
            slot.tx.command = Command::Rollback;
            slot.tx.record = None;
        }
    }

    /// Current bundle watermark; 0 when the user has never bundled.
    pub fn bundle_seq_no(&self) -> u64 {
        self.state.lock().unwrap().bundle_seq_no
    }

    /// First sequence number a tailing reader should receive.
    pub fn starting_seq_no(&self) -> u64 {
        starting_seq_no(self.bundle_seq_no())
    }

    /// Snapshot of the committed entries from `starting_seq_no` onward.
    /// Pending and RolledBack slots are skipped; readers observe gaps at
    /// their sequence numbers.
    pub fn committed_from(&self, starting_seq_no: u64) -> Vec<Transaction> {
        self.state.lock().unwrap().committed_from(starting_seq_no)
    }

    /// The watermark and the committed tail past it, taken under one
    /// lock acquisition so readers never observe a watermark update
    /// without the matching truncation.
    pub fn tail(&self) -> (u64, Vec<Transaction>) {
        let state = self.state.lock().unwrap();
        let start = starting_seq_no(state.bundle_seq_no);
        (state.bundle_seq_no, state.committed_from(start))
    }

    /// Advance the bundle watermark. Monotonic; slots at or below the
    /// new watermark are evicted from the front of the log, stopping at
    /// the first Pending slot (the engine may still need to resolve it).
    pub fn set_bundle_seq_no(&self, bundle_seq_no: u64) {
        let mut state = self.state.lock().unwrap();
        if bundle_seq_no < state.bundle_seq_no {
            return;
        }
        state.bundle_seq_no = bundle_seq_no;
        while let Some(front) = state.slots.front() {
            if front.tx.sequence_no > bundle_seq_no || front.state == SlotState::Pending {
                break;
            }
            state.slots.pop_front();
            state.first_seq += 1;
        }
    }
}

/// Process-wide registry of per-user log projections.
///
/// Projections are created lazily: the first access for a user scans the
/// durable store and seeds the in-memory log; concurrent first accesses
/// hydrate exactly once. A failed hydration leaves nothing behind, so
/// the next access retries.
#[derive(Debug)]
pub struct LogCache {
    store: RecordStoreRef,
    users: DashMap<String, Arc<OnceCell<Arc<UserLog>>>>,
}

impl LogCache {
    /// A cache rebuilding projections from the given store.
    pub fn new(store: RecordStoreRef) -> Self {
        LogCache {
            store,
            users: DashMap::new(),
        }
    }

    /// The projection for `user_id`, hydrating it on first access.
    pub async fn user_log(&self, user_id: &str) -> SyncResult<Arc<UserLog>> {
        if let Some(cell) = self.users.get(user_id) {
            if let Some(log) = cell.get() {
                return Ok(log.clone());
            }
        }
        let cell = self.users.entry(user_id.to_owned()).or_default().clone();
        let log = cell.get_or_try_init(|| self.hydrate(user_id)).await?;
        Ok(log.clone())
    }

    async fn hydrate(&self, user_id: &str) -> SyncResult<Arc<UserLog>> {
        let transactions = self.store.scan_transactions(user_id).await?;
        let bundle_seq_no = self
            .store
            .get_user(user_id)
            .await?
            .map(|user| user.bundle_seq_no)
            .unwrap_or(0);
        debug!(
            user_id,
            entries = transactions.len(),
            bundle_seq_no,
            "hydrated user log projection"
        );
        Ok(Arc::new(UserLog::from_scan(transactions, bundle_seq_no)))
    }
}
