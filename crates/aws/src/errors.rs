//! Errors for the DynamoDB-backed record store.

use std::num::ParseIntError;

use vaultlog_core::store::RecordStoreError;

/// Configuration failures while constructing the DynamoDB record store.
#[derive(thiserror::Error, Debug)]
pub enum DynamoDbConfigError {
    /// Billing mode string invalid
    #[error("Invalid billing mode: {0}, supported values: ['PROVISIONED', 'PAY_PER_REQUEST']")]
    InvalidBillingMode(String),

    /// Cannot parse max_elapsed_request_time value into u64
    #[error("Cannot parse max elapsed request time into u64: {source}")]
    ParseMaxElapsedRequestTime { source: ParseIntError },
}

/// Wrap an SDK failure as a transient record store error.
pub(crate) fn transient<E>(err: E) -> RecordStoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    RecordStoreError::Transient {
        source: Box::new(err),
    }
}
