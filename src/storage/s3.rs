//! S3 storage backend implementation.

use object_store::aws::{AmazonS3Builder, AmazonS3ConfigKey};
use object_store::multipart::MultipartStore;
use object_store::path::Path;
use object_store::{ObjectStore, RetryConfig};
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::S3OutputConfig;
use crate::error::{S3ConfigSnafu, StorageError};

use super::{BackendConfig, MultipartOptions, StorageProvider};

/// S3 storage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub bucket: String,
    pub key: Option<Path>,
}

impl StorageProvider {
    /// Create a provider for the configured destination bucket.
    ///
    /// Keys passed to this provider are full object keys; the output directory
    /// is already part of each destination key.
    pub async fn for_s3(config: &S3OutputConfig) -> Result<Self, StorageError> {
        let options = HashMap::from([
            (
                AmazonS3ConfigKey::AccessKeyId.as_ref().to_string(),
                config.access_key.clone(),
            ),
            (
                AmazonS3ConfigKey::SecretAccessKey.as_ref().to_string(),
                config.secret_access_key.clone(),
            ),
        ]);

        Self::construct_s3(
            S3Config {
                endpoint: config.endpoint.clone(),
                region: config.region.clone(),
                bucket: config.bucket_name.clone(),
                key: None,
            },
            options,
        )
        .await
    }

    pub(super) async fn construct_s3(
        config: S3Config,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&config.bucket);

        for (key, value) in &options {
            builder = builder.with_config(key.parse().context(S3ConfigSnafu)?, value.clone());
        }

        // Request-level retries stay short; the reconciler owns the long backoff.
        builder = builder.with_retry(RetryConfig {
            max_retries: 2,
            ..RetryConfig::default()
        });

        if let Some(region) = &config.region {
            builder = builder.with_region(region);
        }

        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false)
                .with_allow_http(true);
        }

        let canonical_url = match (&config.region, &config.endpoint) {
            (_, Some(endpoint)) => format!("s3::{}/{}", endpoint, config.bucket),
            (Some(region), _) => format!("https://s3.{}.amazonaws.com/{}", region, config.bucket),
            _ => format!("https://s3.amazonaws.com/{}", config.bucket),
        };

        let canonical_url = if let Some(key) = &config.key {
            format!("{}/{}", canonical_url, key)
        } else {
            canonical_url
        };

        let s3_store = Arc::new(builder.build().context(S3ConfigSnafu)?);
        let multipart_store: Option<Arc<dyn MultipartStore>> = Some(s3_store.clone());
        let object_store: Arc<dyn ObjectStore> = s3_store;

        Ok(Self {
            config: BackendConfig::S3(config),
            object_store,
            multipart_store,
            canonical_url,
            multipart: MultipartOptions::default(),
            request_timeout: None,
        })
    }
}
