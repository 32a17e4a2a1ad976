//! S3-backed bundle storage.

use std::collections::HashMap;
use std::sync::Arc;

use object_store::aws::AmazonS3Builder;

use vaultlog_core::store::BlobStoreRef;

use crate::constants;

/// Options governing the S3 connection used for bundle blobs.
///
/// Values are taken from the option map first and fall back to the
/// environment, so the same map can be shared with the engine
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3BundleStoreOptions {
    pub bucket_name: String,
    pub endpoint_url: Option<String>,
    pub region: Option<String>,
    pub allow_http: bool,
}

impl S3BundleStoreOptions {
    /// Build options from a string map, falling back to the environment.
    pub fn from_map(options: &HashMap<String, String>) -> Self {
        let str_option = |key: &str| {
            options
                .get(key)
                .cloned()
                .or_else(|| std::env::var(key).ok())
        };
        S3BundleStoreOptions {
            bucket_name: str_option(constants::BUNDLE_BUCKET_KEY_NAME)
                .unwrap_or_else(|| constants::DEFAULT_BUNDLE_BUCKET_NAME.to_owned()),
            endpoint_url: str_option(constants::AWS_ENDPOINT_URL),
            region: str_option(constants::AWS_REGION),
            allow_http: str_option(constants::AWS_ALLOW_HTTP)
                .map(|value| str_is_truthy(&value))
                .unwrap_or(false),
        }
    }

    /// Options resolved from the environment alone.
    pub fn try_default() -> Self {
        Self::from_map(&HashMap::new())
    }

    /// Options with the bucket name from the engine configuration and
    /// everything else from the environment.
    pub fn from_engine_config(config: &vaultlog_core::config::EngineConfig) -> Self {
        S3BundleStoreOptions {
            bucket_name: config.bundle_bucket_name.clone(),
            ..Self::try_default()
        }
    }
}

/// Construct the bundle blob store from the given options.
///
/// Credentials come from the usual AWS environment/profile chain via
/// [`AmazonS3Builder::from_env`].
pub fn s3_bundle_store(options: &S3BundleStoreOptions) -> object_store::Result<BlobStoreRef> {
    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(&options.bucket_name)
        .with_allow_http(options.allow_http);
    if let Some(endpoint_url) = &options.endpoint_url {
        builder = builder.with_endpoint(endpoint_url);
    }
    if let Some(region) = &options.region {
        builder = builder.with_region(region);
    }
    Ok(Arc::new(builder.build()?))
}

fn str_is_truthy(value: &str) -> bool {
    value.eq_ignore_ascii_case("1")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("on")
        || value.eq_ignore_ascii_case("yes")
        || value.eq_ignore_ascii_case("y")
}

#[cfg(test)]
mod tests {
    use maplit::hashmap;
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn options_from_map_take_precedence_over_env() {
        std::env::set_var(constants::BUNDLE_BUCKET_KEY_NAME, "env-bucket");
        let options = S3BundleStoreOptions::from_map(&hashmap! {
            constants::BUNDLE_BUCKET_KEY_NAME.to_owned() => "map-bucket".to_owned(),
            constants::AWS_ALLOW_HTTP.to_owned() => "true".to_owned(),
        });
        assert_eq!(options.bucket_name, "map-bucket");
        assert!(options.allow_http);
        std::env::remove_var(constants::BUNDLE_BUCKET_KEY_NAME);
    }

    #[test]
    #[serial]
    fn options_fall_back_to_env_then_defaults() {
        std::env::remove_var(constants::BUNDLE_BUCKET_KEY_NAME);
        std::env::remove_var(constants::AWS_ALLOW_HTTP);
        let options = S3BundleStoreOptions::try_default();
        assert_eq!(options.bucket_name, constants::DEFAULT_BUNDLE_BUCKET_NAME);
        assert!(!options.allow_http);

        std::env::set_var(constants::BUNDLE_BUCKET_KEY_NAME, "env-bucket");
        let options = S3BundleStoreOptions::try_default();
        assert_eq!(options.bucket_name, "env-bucket");
        std::env::remove_var(constants::BUNDLE_BUCKET_KEY_NAME);
    }

    #[test]
    #[serial]
    fn bucket_name_comes_from_engine_config() {
        std::env::remove_var(constants::BUNDLE_BUCKET_KEY_NAME);
        let config = vaultlog_core::config::EngineConfig {
            bundle_bucket_name: "custom-bundles".to_owned(),
            ..Default::default()
        };
        let options = S3BundleStoreOptions::from_engine_config(&config);
        assert_eq!(options.bucket_name, "custom-bundles");
    }

    #[test]
    fn truthy_strings() {
        for value in ["1", "true", "TRUE", "on", "yes", "Y"] {
            assert!(str_is_truthy(value), "{value}");
        }
        for value in ["0", "false", "off", ""] {
            assert!(!str_is_truthy(value), "{value}");
        }
    }
}
