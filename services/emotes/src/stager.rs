//! Staging of raw uploads in private object storage.
//!
//! The worker reads its input from `{internal_prefix}{id}.{ext}` in the
//! private bucket.

use crate::config::S3Config;
use crate::probe::Container;
use anyhow::Context;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use aws_sdk_s3::Client as S3Client;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors raised while staging a raw upload
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Failed to stage {key}: {message}")]
    Upload { key: String, message: String },
}

/// Location of a staged upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedObject {
    pub bucket: String,
    pub key: String,
}

/// Object key for a staged upload
pub fn staging_key(prefix: &str, id: &str, container: Container) -> String {
    format!("{}{}.{}", prefix, id, container.extension())
}

/// Writes validated raw uploads to private storage
#[async_trait]
pub trait ObjectStager: Send + Sync {
    async fn stage(
        &self,
        id: &str,
        container: Container,
        bytes: Vec<u8>,
    ) -> Result<StagedObject, StageError>;
}

/// Stager backed by S3 (or any S3-compatible store)
pub struct S3Stager {
    client: S3Client,
    bucket: String,
    prefix: String,
}

impl S3Stager {
    /// Create a new S3 stager writing to the private bucket
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.private_bucket,
            region = %config.region,
            "S3 stager initialized"
        );

        Ok(Self {
            client,
            bucket: config.private_bucket.clone(),
            prefix: config.internal_prefix.clone(),
        })
    }

    async fn put(&self, key: &str, container: Container, bytes: Vec<u8>) -> anyhow::Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(container.content_type())
            .acl(ObjectCannedAcl::Private)
            .send()
            .await
            .context("Failed to upload emote to S3")?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStager for S3Stager {
    #[instrument(skip(self, bytes), fields(emote_id = %id, size_bytes = bytes.len()))]
    async fn stage(
        &self,
        id: &str,
        container: Container,
        bytes: Vec<u8>,
    ) -> Result<StagedObject, StageError> {
        let key = staging_key(&self.prefix, id, container);
        debug!(key = %key, "Staging upload");

        self.put(&key, container, bytes)
            .await
            .map_err(|e| StageError::Upload {
                key: key.clone(),
                message: format!("{:#}", e),
            })?;

        info!(key = %key, "Upload staged");
        Ok(StagedObject {
            bucket: self.bucket.clone(),
            key,
        })
    }
}

/// Stager that keeps objects in memory
#[derive(Default)]
pub struct MemoryStager {
    bucket: String,
    prefix: String,
    objects: DashMap<String, (String, Vec<u8>)>,
}

impl MemoryStager {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into(),
            objects: DashMap::new(),
        }
    }

    /// Content type and bytes stored under `key`
    pub fn object(&self, key: &str) -> Option<(String, Vec<u8>)> {
        self.objects.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStager for MemoryStager {
    async fn stage(
        &self,
        id: &str,
        container: Container,
        bytes: Vec<u8>,
    ) -> Result<StagedObject, StageError> {
        let key = staging_key(&self.prefix, id, container);
        self.objects
            .insert(key.clone(), (container.content_type().to_string(), bytes));
        Ok(StagedObject {
            bucket: self.bucket.clone(),
            key,
        })
    }
}
