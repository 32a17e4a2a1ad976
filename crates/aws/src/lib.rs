//! DynamoDB and S3 backed storage for the vaultlog engine.
//!
//! [`DynamoDbRecordStore`] implements the engine's
//! [`RecordStore`] interface against a DynamoDB table keyed by
//! `(user-id, sequence-no)`, using conditional puts for the
//! insert-if-absent and rollback-rewrite predicates, plus the user table
//! whose `bundle-seq-no` attribute carries the bundle watermark. The
//! [`storage`] module builds the S3 [`ObjectStore`](object_store::ObjectStore)
//! holding bundle blobs.

pub mod constants;
pub mod errors;
pub mod storage;

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_dynamodb::error::SdkError;
use aws_sdk_dynamodb::operation::{
    create_table::CreateTableError, put_item::PutItemError, query::QueryError,
    update_item::UpdateItemError,
};
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType,
};
use aws_sdk_dynamodb::Client;
use bytes::Bytes;
use tracing::debug;

use vaultlog_core::config::EngineConfig;
use vaultlog_core::store::{PutCondition, RecordStore, RecordStoreError, UserRecord};
use vaultlog_core::transaction::{Command, Transaction};

use errors::{transient, DynamoDbConfigError};

/// Record store backed by DynamoDB.
pub struct DynamoDbRecordStore {
    client: Client,
    config: DynamoDbStoreConfig,
}

impl std::fmt::Debug for DynamoDbRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "DynamoDbRecordStore(config: {:?})", self.config)
    }
}

/// Configuration of the DynamoDB record store.
#[derive(Debug, Clone)]
pub struct DynamoDbStoreConfig {
    pub billing_mode: BillingMode,
    pub transaction_table_name: String,
    pub user_table_name: String,
    pub max_elapsed_request_time: Duration,
}

impl DynamoDbRecordStore {
    /// Creates a new DynamoDbRecordStore from the supplied storage
    /// options. Explicit arguments take precedence over environment
    /// variables, which take precedence over defaults.
    pub fn try_new(
        sdk_config: &SdkConfig,
        transaction_table_name: Option<String>,
        user_table_name: Option<String>,
        billing_mode: Option<String>,
        max_elapsed_request_time: Option<String>,
        dynamodb_override_endpoint: Option<String>,
    ) -> Result<Self, DynamoDbConfigError> {
        let dynamodb_sdk_config =
            Self::create_dynamodb_sdk_config(sdk_config, dynamodb_override_endpoint);
        let client = Client::new(&dynamodb_sdk_config);

        let transaction_table_name = transaction_table_name
            .or_else(|| std::env::var(constants::TRANSACTION_TABLE_KEY_NAME).ok())
            .unwrap_or_else(|| constants::DEFAULT_TRANSACTION_TABLE_NAME.to_owned());
        let user_table_name = user_table_name
            .or_else(|| std::env::var(constants::USER_TABLE_KEY_NAME).ok())
            .unwrap_or_else(|| constants::DEFAULT_USER_TABLE_NAME.to_owned());

        let billing_mode = if let Some(bm) = billing_mode
            .or_else(|| std::env::var(constants::BILLING_MODE_KEY_NAME).ok())
            .as_ref()
        {
            BillingMode::try_parse(bm.to_ascii_uppercase().as_str())
                .map_err(|_| DynamoDbConfigError::InvalidBillingMode(bm.to_owned()))?
        } else {
            BillingMode::PayPerRequest
        };

        let max_elapsed_request_time = max_elapsed_request_time
            .or_else(|| std::env::var(constants::MAX_ELAPSED_REQUEST_TIME_KEY_NAME).ok())
            .map_or_else(
                || Ok(constants::DEFAULT_MAX_ELAPSED_REQUEST_TIME),
                |secs| u64::from_str(&secs).map(Duration::from_secs),
            )
            .map_err(|err| DynamoDbConfigError::ParseMaxElapsedRequestTime { source: err })?;

        Ok(Self {
            client,
            config: DynamoDbStoreConfig {
                billing_mode,
                transaction_table_name,
                user_table_name,
                max_elapsed_request_time,
            },
        })
    }

    /// Build the record store with the table names from the engine
    /// configuration; everything else comes from the environment.
    pub fn from_engine_config(
        sdk_config: &SdkConfig,
        config: &EngineConfig,
    ) -> Result<Self, DynamoDbConfigError> {
        Self::try_new(
            sdk_config,
            Some(config.transaction_table_name.clone()),
            Some(config.user_table_name.clone()),
            None,
            None,
            std::env::var(constants::AWS_ENDPOINT_URL_DYNAMODB).ok(),
        )
    }

    fn create_dynamodb_sdk_config(
        sdk_config: &SdkConfig,
        dynamodb_override_endpoint: Option<String>,
    ) -> SdkConfig {
        match dynamodb_override_endpoint {
            Some(dynamodb_endpoint_url) => sdk_config
                .to_owned()
                .to_builder()
                .endpoint_url(dynamodb_endpoint_url)
                .build(),
            None => sdk_config.to_owned(),
        }
    }

    /// Get the configuration of the record store.
    pub fn get_config(&self) -> &DynamoDbStoreConfig {
        &self.config
    }

    /// Create the transaction log table.
    ///
    /// Transparently handles the case where the table already exists, so
    /// it's safe to call. The table state is `creating` when this
    /// returns; transient failures might occur when using the store
    /// immediately.
    pub async fn try_create_transaction_table(
        &self,
    ) -> Result<CreateTableResult, RecordStoreError> {
        let attribute_definitions = vec![
            AttributeDefinition::builder()
                .attribute_name(constants::ATTR_USER_ID)
                .attribute_type(ScalarAttributeType::S)
                .build()
                .map_err(transient)?,
            AttributeDefinition::builder()
                .attribute_name(constants::ATTR_SEQUENCE_NO)
                .attribute_type(ScalarAttributeType::N)
                .build()
                .map_err(transient)?,
        ];
        let key_schema = vec![
            KeySchemaElement::builder()
                .attribute_name(constants::ATTR_USER_ID)
                .key_type(KeyType::Hash)
                .build()
                .map_err(transient)?,
            KeySchemaElement::builder()
                .attribute_name(constants::ATTR_SEQUENCE_NO)
                .key_type(KeyType::Range)
                .build()
                .map_err(transient)?,
        ];
        let request = self
            .client
            .create_table()
            .set_attribute_definitions(Some(attribute_definitions))
            .set_key_schema(Some(key_schema))
            .billing_mode(self.config.billing_mode.clone())
            .table_name(&self.config.transaction_table_name)
            .send();
        match request.await {
            Ok(_) => Ok(CreateTableResult::TableCreated),
            Err(sdk_err) => match sdk_err.as_service_error() {
                Some(CreateTableError::ResourceInUseException(_)) => {
                    Ok(CreateTableResult::TableAlreadyExists)
                }
                _ => Err(transient(sdk_err)),
            },
        }
    }

    async fn retry<I, E, F, Fut, Wn>(&self, operation: F, when: Wn) -> Result<I, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<I, E>>,
        Wn: Fn(&E) -> bool,
    {
        use backon::Retryable;
        let backoff = backon::ExponentialBuilder::default()
            .with_factor(2.)
            .with_max_delay(self.config.max_elapsed_request_time);
        operation.retry(backoff).when(when).await
    }
}

#[async_trait]
impl RecordStore for DynamoDbRecordStore {
    async fn put_transaction(
        &self,
        tx: &Transaction,
        condition: PutCondition,
    ) -> Result<(), RecordStoreError> {
        self.retry(
            || async {
                let request = self
                    .client
                    .put_item()
                    .table_name(&self.config.transaction_table_name)
                    .set_item(Some(create_transaction_item(tx)))
                    .expression_attribute_names(constants::EXPR_NAME_USER_ID, constants::ATTR_USER_ID);
                let request = match condition {
                    PutCondition::IfAbsent => request
                        .condition_expression(constants::CONDITION_INSERT_IF_ABSENT.as_str()),
                    PutCondition::IfAbsentOrRolledBack => request
                        .condition_expression(constants::CONDITION_ABSENT_OR_ROLLED_BACK.as_str())
                        .expression_attribute_names(
                            constants::EXPR_NAME_COMMAND,
                            constants::ATTR_COMMAND,
                        )
                        .expression_attribute_values(
                            constants::EXPR_VALUE_ROLLBACK,
                            string_attr(Command::Rollback.as_str()),
                        ),
                };
                let _ = request.send().await?;
                Ok(())
            },
            |err: &SdkError<_, _>| match err.as_service_error() {
                Some(PutItemError::ProvisionedThroughputExceededException(_)) => true,
                _ => false,
            },
        )
        .await
        .map_err(|err| match err.as_service_error() {
            Some(PutItemError::ConditionalCheckFailedException(_)) => RecordStoreError::Conflict {
                user_id: tx.user_id.clone(),
                sequence_no: tx.sequence_no,
            },
            _ => transient(err),
        })
    }

    async fn update_user_bundle_seq_no(
        &self,
        username: &str,
        bundle_seq_no: u64,
    ) -> Result<(), RecordStoreError> {
        self.retry(
            || async {
                let _ = self
                    .client
                    .update_item()
                    .table_name(&self.config.user_table_name)
                    .key(constants::ATTR_USERNAME, string_attr(username))
                    .update_expression(constants::UPDATE_SET_BUNDLE_SEQ_NO.as_str())
                    .expression_attribute_names(
                        constants::EXPR_NAME_BUNDLE_SEQ_NO,
                        constants::ATTR_BUNDLE_SEQ_NO,
                    )
                    .expression_attribute_values(
                        constants::EXPR_VALUE_BUNDLE_SEQ_NO,
                        num_attr(bundle_seq_no),
                    )
                    .send()
                    .await?;
                Ok(())
            },
            |err: &SdkError<UpdateItemError, _>| match err.as_service_error() {
                Some(UpdateItemError::ProvisionedThroughputExceededException(_)) => true,
                _ => false,
            },
        )
        .await
        .map_err(transient)
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, RecordStoreError> {
        let output = self
            .retry(
                || async {
                    self.client
                        .query()
                        .table_name(&self.config.user_table_name)
                        .index_name(constants::USER_ID_INDEX_NAME)
                        .key_condition_expression(constants::KEY_CONDITION_USER_ID.as_str())
                        .expression_attribute_names(
                            constants::EXPR_NAME_USER_ID,
                            constants::ATTR_USER_ID,
                        )
                        .expression_attribute_values(
                            constants::EXPR_VALUE_USER_ID,
                            string_attr(user_id),
                        )
                        .limit(1)
                        .send()
                        .await
                },
                |err: &SdkError<_, _>| match err.as_service_error() {
                    Some(QueryError::ProvisionedThroughputExceededException(_)) => true,
                    _ => false,
                },
            )
            .await
            .map_err(transient)?;
        output.items().first().map(parse_user_item).transpose()
    }

    async fn scan_transactions(&self, user_id: &str) -> Result<Vec<Transaction>, RecordStoreError> {
        let mut transactions = Vec::new();
        let mut exclusive_start_key = None;
        loop {
            let output = self
                .retry(
                    || async {
                        self.client
                            .query()
                            .table_name(&self.config.transaction_table_name)
                            .consistent_read(true)
                            .scan_index_forward(true)
                            .key_condition_expression(constants::KEY_CONDITION_USER_ID.as_str())
                            .expression_attribute_names(
                                constants::EXPR_NAME_USER_ID,
                                constants::ATTR_USER_ID,
                            )
                            .expression_attribute_values(
                                constants::EXPR_VALUE_USER_ID,
                                string_attr(user_id),
                            )
                            .set_exclusive_start_key(exclusive_start_key.clone())
                            .send()
                            .await
                    },
                    |err: &SdkError<_, _>| match err.as_service_error() {
                        Some(QueryError::ProvisionedThroughputExceededException(_)) => true,
                        _ => false,
                    },
                )
                .await
                .map_err(transient)?;
            for item in output.items() {
                transactions.push(parse_transaction_item(item)?);
            }
            match output.last_evaluated_key() {
                Some(key) => exclusive_start_key = Some(key.clone()),
                None => break,
            }
        }
        debug!(
            user_id,
            entries = transactions.len(),
            "scanned transaction log"
        );
        Ok(transactions)
    }
}

/// Represents the possible, positive outcomes of calling
/// `DynamoDbRecordStore::try_create_transaction_table()`.
#[derive(Debug, PartialEq)]
pub enum CreateTableResult {
    /// Table created successfully.
    TableCreated,
    /// Table was not created because it already exists.
    /// Does not imply that the table has the correct schema.
    TableAlreadyExists,
}

fn create_transaction_item(tx: &Transaction) -> HashMap<String, AttributeValue> {
    let mut item = maplit::hashmap! {
        constants::ATTR_USER_ID.to_owned()     => string_attr(&tx.user_id),
        constants::ATTR_SEQUENCE_NO.to_owned() => num_attr(tx.sequence_no),
        constants::ATTR_ITEM_ID.to_owned()     => string_attr(&tx.item_id),
        constants::ATTR_COMMAND.to_owned()     => string_attr(tx.command.as_str()),
    };
    if let Some(record) = &tx.record {
        item.insert(
            constants::ATTR_RECORD.to_owned(),
            AttributeValue::B(Blob::new(record.to_vec())),
        );
    }
    item
}

fn parse_transaction_item(
    item: &HashMap<String, AttributeValue>,
) -> Result<Transaction, RecordStoreError> {
    let user_id = extract_required_string_field(item, constants::ATTR_USER_ID)?.to_owned();
    let sequence_no = extract_required_number_field(item, constants::ATTR_SEQUENCE_NO)?;
    let item_id = extract_required_string_field(item, constants::ATTR_ITEM_ID)?.to_owned();
    let command = extract_required_string_field(item, constants::ATTR_COMMAND)?;
    let command = command.parse::<Command>().map_err(|_| {
        RecordStoreError::inconsistent(format!(
            "unknown command '{command}' in stored item at sequence {sequence_no}"
        ))
    })?;
    let record = match item.get(constants::ATTR_RECORD) {
        Some(attr) => Some(Bytes::from(
            attr.as_b()
                .map_err(|_| {
                    RecordStoreError::inconsistent(format!(
                        "field '{}' exists, but is not of type binary",
                        constants::ATTR_RECORD
                    ))
                })?
                .clone()
                .into_inner(),
        )),
        None => None,
    };
    Ok(Transaction {
        user_id,
        sequence_no,
        item_id,
        command,
        record,
    })
}

fn parse_user_item(item: &HashMap<String, AttributeValue>) -> Result<UserRecord, RecordStoreError> {
    Ok(UserRecord {
        username: extract_required_string_field(item, constants::ATTR_USERNAME)?.to_owned(),
        user_id: extract_required_string_field(item, constants::ATTR_USER_ID)?.to_owned(),
        bundle_seq_no: match item.get(constants::ATTR_BUNDLE_SEQ_NO) {
            Some(_) => extract_required_number_field(item, constants::ATTR_BUNDLE_SEQ_NO)?,
            None => 0,
        },
    })
}

/// Extract a field from an item's attribute value map, producing a
/// descriptive error of the various failure cases.
fn extract_required_string_field<'a>(
    fields: &'a HashMap<String, AttributeValue>,
    field_name: &str,
) -> Result<&'a str, RecordStoreError> {
    fields
        .get(field_name)
        .ok_or_else(|| {
            RecordStoreError::inconsistent(format!(
                "mandatory string field '{field_name}' missing"
            ))
        })?
        .as_s()
        .map_err(|v| {
            RecordStoreError::inconsistent(format!(
                "mandatory string field '{field_name}' exists, but is not a string: {v:#?}"
            ))
        })
        .map(|s| s.as_str())
}

fn extract_required_number_field(
    fields: &HashMap<String, AttributeValue>,
    field_name: &str,
) -> Result<u64, RecordStoreError> {
    fields
        .get(field_name)
        .ok_or_else(|| {
            RecordStoreError::inconsistent(format!(
                "mandatory number field '{field_name}' missing"
            ))
        })?
        .as_n()
        .map_err(|_| {
            RecordStoreError::inconsistent(format!(
                "mandatory number field '{field_name}' exists, but is not of type number"
            ))
        })?
        .parse::<u64>()
        .map_err(|err| {
            RecordStoreError::inconsistent(format!(
                "conversion of field '{field_name}' to number failed, {err}"
            ))
        })
}

fn string_attr<T: ToString>(s: T) -> AttributeValue {
    AttributeValue::S(s.to_string())
}

fn num_attr<T: ToString>(n: T) -> AttributeValue {
    AttributeValue::N(n.to_string())
}

#[cfg(test)]
mod tests {
    use aws_config::BehaviorVersion;
    use aws_config::Region;
    use maplit::hashmap;
    use serial_test::serial;

    use super::*;

    fn transaction_item_roundtrip(tx: &Transaction) -> Result<(), RecordStoreError> {
        let item_data = create_transaction_item(tx);
        let tx_parsed = parse_transaction_item(&item_data)?;
        assert_eq!(tx, &tx_parsed);
        Ok(())
    }

    #[test]
    fn transaction_item_roundtrip_test() -> Result<(), RecordStoreError> {
        transaction_item_roundtrip(&Transaction {
            user_id: "u-1".to_owned(),
            sequence_no: 0,
            item_id: "item-a".to_owned(),
            command: Command::Insert,
            record: Some(Bytes::from_static(b"\x00\x01\x02ciphertext")),
        })?;
        transaction_item_roundtrip(&Transaction {
            user_id: "u-1".to_owned(),
            sequence_no: 139,
            item_id: "item-a".to_owned(),
            command: Command::Delete,
            record: None,
        })?;
        transaction_item_roundtrip(&Transaction {
            user_id: "u-1".to_owned(),
            sequence_no: 140,
            item_id: "item-a".to_owned(),
            command: Command::Rollback,
            record: None,
        })?;
        Ok(())
    }

    #[test]
    fn malformed_items_are_inconsistent_data() {
        let missing_command = hashmap! {
            constants::ATTR_USER_ID.to_owned()     => string_attr("u"),
            constants::ATTR_SEQUENCE_NO.to_owned() => num_attr(0),
            constants::ATTR_ITEM_ID.to_owned()     => string_attr("a"),
        };
        assert!(matches!(
            parse_transaction_item(&missing_command),
            Err(RecordStoreError::InconsistentData { .. })
        ));

        let bad_command = hashmap! {
            constants::ATTR_USER_ID.to_owned()     => string_attr("u"),
            constants::ATTR_SEQUENCE_NO.to_owned() => num_attr(0),
            constants::ATTR_ITEM_ID.to_owned()     => string_attr("a"),
            constants::ATTR_COMMAND.to_owned()     => string_attr("Upsert"),
        };
        assert!(matches!(
            parse_transaction_item(&bad_command),
            Err(RecordStoreError::InconsistentData { .. })
        ));
    }

    #[test]
    fn user_item_parses_with_and_without_watermark() {
        let full = hashmap! {
            constants::ATTR_USERNAME.to_owned()      => string_attr("alice"),
            constants::ATTR_USER_ID.to_owned()       => string_attr("u-1"),
            constants::ATTR_BUNDLE_SEQ_NO.to_owned() => num_attr(17),
        };
        let user = parse_user_item(&full).unwrap();
        assert_eq!(
            user,
            UserRecord {
                username: "alice".to_owned(),
                user_id: "u-1".to_owned(),
                bundle_seq_no: 17,
            }
        );

        let never_bundled = hashmap! {
            constants::ATTR_USERNAME.to_owned() => string_attr("bob"),
            constants::ATTR_USER_ID.to_owned()  => string_attr("u-2"),
        };
        assert_eq!(parse_user_item(&never_bundled).unwrap().bundle_seq_no, 0);
    }

    #[test]
    fn condition_expressions_use_name_placeholders() {
        assert_eq!(
            constants::CONDITION_INSERT_IF_ABSENT.as_str(),
            "attribute_not_exists(#user_id)"
        );
        assert_eq!(
            constants::CONDITION_ABSENT_OR_ROLLED_BACK.as_str(),
            "attribute_not_exists(#user_id) OR #command = :rollback"
        );
        assert_eq!(
            constants::UPDATE_SET_BUNDLE_SEQ_NO.as_str(),
            "SET #bundle_seq_no = :bundle_seq_no"
        );
    }

    #[test]
    #[serial]
    fn store_configs_via_env_variables() {
        std::env::set_var(constants::MAX_ELAPSED_REQUEST_TIME_KEY_NAME, "64");
        std::env::set_var(constants::TRANSACTION_TABLE_KEY_NAME, "some_table");
        std::env::set_var(constants::USER_TABLE_KEY_NAME, "some_users");
        std::env::set_var(constants::BILLING_MODE_KEY_NAME, "PAY_PER_REQUEST");

        let sdk_config = SdkConfig::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::from_static("eu-west-1"))
            .build();
        let store = DynamoDbRecordStore::try_new(&sdk_config, None, None, None, None, None).unwrap();
        let config = store.get_config();
        assert_eq!(config.transaction_table_name, "some_table");
        assert_eq!(config.user_table_name, "some_users");
        assert_eq!(config.billing_mode, BillingMode::PayPerRequest);
        assert_eq!(config.max_elapsed_request_time, Duration::from_secs(64));

        std::env::remove_var(constants::MAX_ELAPSED_REQUEST_TIME_KEY_NAME);
        std::env::remove_var(constants::TRANSACTION_TABLE_KEY_NAME);
        std::env::remove_var(constants::USER_TABLE_KEY_NAME);
        std::env::remove_var(constants::BILLING_MODE_KEY_NAME);
    }

    #[test]
    #[serial]
    fn explicit_arguments_win_over_env() {
        std::env::set_var(constants::TRANSACTION_TABLE_KEY_NAME, "env_table");
        let sdk_config = SdkConfig::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::from_static("eu-west-1"))
            .build();
        let store = DynamoDbRecordStore::try_new(
            &sdk_config,
            Some("explicit_table".to_owned()),
            None,
            None,
            None,
            None,
        )
        .unwrap();
        assert_eq!(store.get_config().transaction_table_name, "explicit_table");
        std::env::remove_var(constants::TRANSACTION_TABLE_KEY_NAME);
    }

    #[test]
    #[serial]
    fn engine_config_table_names_are_used() {
        let engine_config = EngineConfig {
            transaction_table_name: "custom-transactions".to_owned(),
            user_table_name: "custom-users".to_owned(),
            ..Default::default()
        };
        let sdk_config = SdkConfig::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::from_static("eu-west-1"))
            .build();
        let store = DynamoDbRecordStore::from_engine_config(&sdk_config, &engine_config).unwrap();
        assert_eq!(
            store.get_config().transaction_table_name,
            "custom-transactions"
        );
        assert_eq!(store.get_config().user_table_name, "custom-users");
    }

    #[test]
    fn invalid_billing_mode_is_rejected() {
        let sdk_config = SdkConfig::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::from_static("eu-west-1"))
            .build();
        let err = DynamoDbRecordStore::try_new(
            &sdk_config,
            None,
            None,
            Some("per_molecule".to_owned()),
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, DynamoDbConfigError::InvalidBillingMode(_)));
    }

    #[test]
    fn dynamodb_endpoint_override_takes_precedence() {
        let sdk_config = SdkConfig::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::from_static("eu-west-1"))
            .endpoint_url("http://localhost:1234")
            .build();
        let overridden = DynamoDbRecordStore::create_dynamodb_sdk_config(
            &sdk_config,
            Some("http://localhost:2345".to_owned()),
        );
        assert_eq!(overridden.endpoint_url(), Some("http://localhost:2345"));
        let untouched = DynamoDbRecordStore::create_dynamodb_sdk_config(&sdk_config, None);
        assert_eq!(untouched.endpoint_url(), Some("http://localhost:1234"));
    }
}
