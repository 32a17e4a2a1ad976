//! Constants used for configuring the DynamoDB record store and the S3
//! bundle store.

use std::sync::LazyLock;
use std::time::Duration;

/// Custom S3 endpoint.
pub const AWS_ENDPOINT_URL: &str = "AWS_ENDPOINT_URL";
/// Custom DynamoDB endpoint.
/// If it is supplied, this endpoint takes precedence over the global
/// endpoint set in AWS_ENDPOINT_URL for DynamoDB.
pub const AWS_ENDPOINT_URL_DYNAMODB: &str = "AWS_ENDPOINT_URL_DYNAMODB";
/// The AWS region.
pub const AWS_REGION: &str = "AWS_REGION";
/// The AWS_ACCESS_KEY_ID to use for S3.
pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
/// The AWS_SECRET_ACCESS_KEY to use for S3.
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
/// Allow http connections - mainly useful for integration tests.
pub const AWS_ALLOW_HTTP: &str = "AWS_ALLOW_HTTP";

/// Environment key overriding the transaction log table name.
pub const TRANSACTION_TABLE_KEY_NAME: &str = "VAULTLOG_DYNAMO_TRANSACTION_TABLE";
/// Environment key overriding the user table name.
pub const USER_TABLE_KEY_NAME: &str = "VAULTLOG_DYNAMO_USER_TABLE";
/// Environment key overriding the DynamoDB billing mode.
pub const BILLING_MODE_KEY_NAME: &str = "VAULTLOG_DYNAMO_BILLING_MODE";
/// Environment key bounding the total time spent retrying a throttled
/// DynamoDB request, in seconds.
pub const MAX_ELAPSED_REQUEST_TIME_KEY_NAME: &str = "VAULTLOG_DYNAMO_MAX_ELAPSED_REQUEST_TIME";
/// Environment key overriding the bundle bucket name.
pub const BUNDLE_BUCKET_KEY_NAME: &str = "VAULTLOG_S3_BUNDLE_BUCKET";

pub const DEFAULT_TRANSACTION_TABLE_NAME: &str = "vault-transactions";
pub const DEFAULT_USER_TABLE_NAME: &str = "vault-users";
pub const DEFAULT_BUNDLE_BUCKET_NAME: &str = "vault-bundles";

/// Transaction table partition key.
pub const ATTR_USER_ID: &str = "user-id";
/// Transaction table sort key.
pub const ATTR_SEQUENCE_NO: &str = "sequence-no";
pub const ATTR_ITEM_ID: &str = "item-id";
pub const ATTR_COMMAND: &str = "command";
pub const ATTR_RECORD: &str = "record";

/// User table partition key.
pub const ATTR_USERNAME: &str = "username";
pub const ATTR_BUNDLE_SEQ_NO: &str = "bundle-seq-no";

/// Name of the global secondary index resolving a user id to its user
/// record.
pub const USER_ID_INDEX_NAME: &str = "user-id-index";

// The dashed attribute names cannot appear literally in expressions;
// every expression goes through these placeholders.
pub const EXPR_NAME_USER_ID: &str = "#user_id";
pub const EXPR_NAME_COMMAND: &str = "#command";
pub const EXPR_NAME_BUNDLE_SEQ_NO: &str = "#bundle_seq_no";
pub const EXPR_VALUE_ROLLBACK: &str = ":rollback";
pub const EXPR_VALUE_USER_ID: &str = ":user_id";
pub const EXPR_VALUE_BUNDLE_SEQ_NO: &str = ":bundle_seq_no";

pub static CONDITION_INSERT_IF_ABSENT: LazyLock<String> =
    LazyLock::new(|| format!("attribute_not_exists({EXPR_NAME_USER_ID})"));

pub static CONDITION_ABSENT_OR_ROLLED_BACK: LazyLock<String> = LazyLock::new(|| {
    format!("attribute_not_exists({EXPR_NAME_USER_ID}) OR {EXPR_NAME_COMMAND} = {EXPR_VALUE_ROLLBACK}")
});

pub static KEY_CONDITION_USER_ID: LazyLock<String> =
    LazyLock::new(|| format!("{EXPR_NAME_USER_ID} = {EXPR_VALUE_USER_ID}"));

pub static UPDATE_SET_BUNDLE_SEQ_NO: LazyLock<String> =
    LazyLock::new(|| format!("SET {EXPR_NAME_BUNDLE_SEQ_NO} = {EXPR_VALUE_BUNDLE_SEQ_NO}"));

pub const DEFAULT_MAX_ELAPSED_REQUEST_TIME: Duration = Duration::from_secs(60);
