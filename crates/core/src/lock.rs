//! Advisory per-user bundle locks with a bounded lease.
//!
//! The lock gates bundle uploads cooperatively: it is an optimization,
//! not a correctness primitive. The bundle path re-checks ownership at
//! critical points but tolerates concurrent uploads, whose safety comes
//! from bundle-sequence monotonicity and idempotent uploads.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct LockEntry {
    token: String,
    acquired_at: Instant,
}

impl LockEntry {
    fn fresh() -> Self {
        LockEntry {
            token: Uuid::new_v4().simple().to_string(),
            acquired_at: Instant::now(),
        }
    }

    fn expired(&self, lease: Duration) -> bool {
        self.acquired_at.elapsed() >= lease
    }
}

/// Cooperative per-user locks gating bundle uploads.
#[derive(Debug)]
pub struct BundleLocks {
    lease: Duration,
    locks: DashMap<String, LockEntry>,
}

impl BundleLocks {
    /// A lock table whose entries expire after `lease`.
    pub fn new(lease: Duration) -> Self {
        BundleLocks {
            lease,
            locks: DashMap::new(),
        }
    }

    /// Acquire the lock for `user_id`.
    ///
    /// Returns the opaque lock token, or `None` when another caller
    /// holds a live lock. An expired lock is replaced. Two concurrent
    /// acquires for one user yield exactly one token.
    pub fn acquire(&self, user_id: &str) -> Option<String> {
        match self.locks.entry(user_id.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().expired(self.lease) {
                    return None;
                }
                let entry = LockEntry::fresh();
                let token = entry.token.clone();
                occupied.insert(entry);
                Some(token)
            }
            Entry::Vacant(vacant) => {
                let entry = LockEntry::fresh();
                let token = entry.token.clone();
                vacant.insert(entry);
                Some(token)
            }
        }
    }

    /// Whether `token` is the live lock for `user_id`.
    pub fn owns(&self, user_id: &str, token: &str) -> bool {
        self.locks
            .get(user_id)
            .map_or(false, |entry| !entry.expired(self.lease) && entry.token == token)
    }

    /// Release the lock iff the caller owns it; returns whether it did.
    pub fn release(&self, user_id: &str, token: &str) -> bool {
        self.locks
            .remove_if(user_id, |_, entry| {
                !entry.expired(self.lease) && entry.token == token
            })
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_refused_while_live() {
        let locks = BundleLocks::new(Duration::from_secs(30));
        let token = locks.acquire("u").unwrap();
        assert!(locks.acquire("u").is_none());
        assert!(locks.owns("u", &token));
        assert!(!locks.owns("u", "someone-elses-token"));
    }

    #[test]
    fn release_requires_ownership() {
        let locks = BundleLocks::new(Duration::from_secs(30));
        let token = locks.acquire("u").unwrap();
        assert!(!locks.release("u", "wrong"));
        assert!(locks.release("u", &token));
        // Released: a new acquire succeeds with a different token.
        let second = locks.acquire("u").unwrap();
        assert_ne!(second, token);
    }

    #[test]
    fn expired_locks_are_replaced() {
        let locks = BundleLocks::new(Duration::from_millis(5));
        let stale = locks.acquire("u").unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert!(!locks.owns("u", &stale));
        let fresh = locks.acquire("u").unwrap();
        assert_ne!(fresh, stale);
        assert!(locks.owns("u", &fresh));
        // The stale token cannot release the fresh lock.
        assert!(!locks.release("u", &stale));
    }

    #[test]
    fn locks_are_per_user() {
        let locks = BundleLocks::new(Duration::from_secs(30));
        let a = locks.acquire("a").unwrap();
        let b = locks.acquire("b").unwrap();
        assert!(locks.owns("a", &a));
        assert!(locks.owns("b", &b));
        assert!(!locks.owns("a", &b));
    }
}
