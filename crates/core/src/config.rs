//! Engine configuration.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use crate::errors::{SyncError, SyncResult};

/// Option key for the per-record size cap.
pub const MAX_ITEM_BYTES_KEY: &str = "max_item_bytes";
/// Option key for the per-batch size cap.
pub const MAX_BATCH_BYTES_KEY: &str = "max_batch_bytes";
/// Option key for the per-batch delete cap.
pub const MAX_BATCH_DELETES_KEY: &str = "max_batch_deletes";
/// Option key for the bundle lock lease, in seconds.
pub const BUNDLE_LOCK_LEASE_SECONDS_KEY: &str = "bundle_lock_lease_seconds";
/// Option key for the durable transaction table name.
pub const TRANSACTION_TABLE_KEY: &str = "transaction_table_name";
/// Option key for the user table name.
pub const USER_TABLE_KEY: &str = "user_table_name";
/// Option key for the bundle blob bucket name.
pub const BUNDLE_BUCKET_KEY: &str = "bundle_bucket_name";

/// Largest accepted opaque record, in bytes.
pub const DEFAULT_MAX_ITEM_BYTES: usize = 400 * 1024;
/// Largest accepted batch payload total, in bytes.
pub const DEFAULT_MAX_BATCH_BYTES: usize = 10 * 1024 * 1024;
/// Most deletes accepted in one batch.
pub const DEFAULT_MAX_BATCH_DELETES: usize = 100;
/// How long a bundle lock stays live without being released.
pub const DEFAULT_BUNDLE_LOCK_LEASE: Duration = Duration::from_secs(30);
/// Default durable transaction table name.
pub const DEFAULT_TRANSACTION_TABLE_NAME: &str = "vault-transactions";
/// Default user table name.
pub const DEFAULT_USER_TABLE_NAME: &str = "vault-users";
/// Default bundle bucket name.
pub const DEFAULT_BUNDLE_BUCKET_NAME: &str = "vault-bundles";

/// Runtime configuration of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Largest accepted opaque record, in bytes.
    pub max_item_bytes: usize,
    /// Largest accepted batch payload total, in bytes.
    pub max_batch_bytes: usize,
    /// Most deletes accepted in one batch.
    pub max_batch_deletes: usize,
    /// How long a bundle lock stays live without being released.
    pub bundle_lock_lease: Duration,
    /// Durable transaction table name.
    pub transaction_table_name: String,
    /// User table name.
    pub user_table_name: String,
    /// Bundle blob bucket name.
    pub bundle_bucket_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_item_bytes: DEFAULT_MAX_ITEM_BYTES,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            max_batch_deletes: DEFAULT_MAX_BATCH_DELETES,
            bundle_lock_lease: DEFAULT_BUNDLE_LOCK_LEASE,
            transaction_table_name: DEFAULT_TRANSACTION_TABLE_NAME.to_owned(),
            user_table_name: DEFAULT_USER_TABLE_NAME.to_owned(),
            bundle_bucket_name: DEFAULT_BUNDLE_BUCKET_NAME.to_owned(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from string options. Unknown keys are
    /// ignored so the map can be shared with storage backends.
    pub fn from_map(options: &HashMap<String, String>) -> SyncResult<Self> {
        let mut config = Self::default();
        for (key, value) in options {
            match key.as_str() {
                MAX_ITEM_BYTES_KEY => config.max_item_bytes = parse_usize(key, value)?,
                MAX_BATCH_BYTES_KEY => config.max_batch_bytes = parse_usize(key, value)?,
                MAX_BATCH_DELETES_KEY => config.max_batch_deletes = parse_usize(key, value)?,
                BUNDLE_LOCK_LEASE_SECONDS_KEY => {
                    config.bundle_lock_lease = Duration::from_secs(parse_u64(key, value)?)
                }
                TRANSACTION_TABLE_KEY => config.transaction_table_name = value.clone(),
                USER_TABLE_KEY => config.user_table_name = value.clone(),
                BUNDLE_BUCKET_KEY => config.bundle_bucket_name = value.clone(),
                other => debug!(key = other, "ignoring unknown engine option"),
            }
        }
        Ok(config)
    }
}

fn parse_usize(key: &str, value: &str) -> SyncResult<usize> {
    value
        .parse::<usize>()
        .map_err(|_| SyncError::BadInput(format!("failed to parse \"{value}\" for '{key}' as usize")))
}

fn parse_u64(key: &str, value: &str) -> SyncResult<u64> {
    value
        .parse::<u64>()
        .map_err(|_| SyncError::BadInput(format!("failed to parse \"{value}\" for '{key}' as u64")))
}
