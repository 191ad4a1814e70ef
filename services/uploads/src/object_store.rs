use crate::config::RegionConfig;
use crate::error::StorageError;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use std::collections::HashMap;
use tracing::{debug, info, instrument};

/// Metadata returned by a stat or get
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectInfo {
    pub content_type: String,
    pub size: u64,
    /// User metadata, keys lowercased
    pub metadata: HashMap<String, String>,
}

/// A fetched object
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub info: ObjectInfo,
    pub body: Bytes,
}

/// Minimal object store surface the engine needs from a region
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `Ok(None)` when the object does not exist
    async fn stat(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>, StorageError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StorageError>;

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// Deleting a missing object succeeds
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError>;

    /// Create the bucket if it does not exist yet
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StorageError>;
}

/// S3-compatible region backend
pub struct S3ObjectStore {
    client: S3Client,
    config: RegionConfig,
}

impl S3ObjectStore {
    /// Create a client for one configured region
    pub async fn new(config: &RegionConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.aws_region.clone()));

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "uploads-config",
            ));
        }

        let aws_config = loader.load().await;
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
            region = %config.name,
            aws_region = %config.aws_region,
            endpoint = ?config.endpoint_url,
            "S3 region client initialized"
        );

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Single-part upload for small objects
    async fn simple_upload(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| backend_error("put_object", e))?;

        Ok(())
    }

    /// Multipart upload for large objects
    async fn multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| backend_error("create_multipart_upload", e))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| StorageError::ObjectStore("No upload ID in response".to_string()))?;

        let mut completed_parts = Vec::new();
        let part_size = self.config.part_size_bytes.max(1);
        let mut part_number = 1;
        let mut offset = 0;

        // Upload parts
        while offset < body.len() {
            let end = (offset + part_size).min(body.len());
            let chunk = body.slice(offset..end);

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| backend_error("upload_part", e))?;

            let completed_part = aws_sdk_s3::types::CompletedPart::builder()
                .part_number(part_number)
                .e_tag(upload_part_response.e_tag().unwrap_or_default())
                .build();

            completed_parts.push(completed_part);
            part_number += 1;
            offset = end;
        }

        // Complete multipart upload
        let completed_upload = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| backend_error("complete_multipart_upload", e))?;

        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn stat(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>, StorageError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(output) => Ok(Some(ObjectInfo {
                content_type: output
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string(),
                size: output.content_length().unwrap_or_default().max(0) as u64,
                metadata: lowercase_keys(output.metadata()),
            })),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(None)
                } else {
                    Err(backend_error("head_object", e))
                }
            }
        }
    }

    #[instrument(skip(self), fields(region = %self.config.name))]
    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    StorageError::ObjectNotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    backend_error("get_object", e)
                }
            })?;

        let content_type = output
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let metadata = lowercase_keys(output.metadata());

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::ObjectStore(format!("get_object body: {}", e)))?
            .into_bytes();

        Ok(StoredObject {
            info: ObjectInfo {
                content_type,
                size: body.len() as u64,
                metadata,
            },
            body,
        })
    }

    #[instrument(skip(self, body), fields(region = %self.config.name, size_bytes = body.len()))]
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        // Check if we should use multipart upload
        if body.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(bucket, key, body, content_type).await?;
        } else {
            self.simple_upload(bucket, key, body, content_type).await?;
        }

        debug!(bucket = %bucket, key = %key, "Object uploaded");
        Ok(())
    }

    #[instrument(skip(self), fields(region = %self.config.name))]
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| backend_error("delete_object", e))?;

        debug!(bucket = %bucket, key = %key, "Object deleted");
        Ok(())
    }

    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        if self.client.head_bucket().bucket(bucket).send().await.is_ok() {
            return Ok(());
        }

        match self.client.create_bucket().bucket(bucket).send().await {
            Ok(_) => {
                info!(region = %self.config.name, bucket = %bucket, "Created bucket");
                Ok(())
            }
            Err(e) => {
                let exists = e
                    .as_service_error()
                    .map(|e| e.is_bucket_already_owned_by_you() || e.is_bucket_already_exists())
                    .unwrap_or(false);
                if exists {
                    Ok(())
                } else {
                    Err(backend_error("create_bucket", e))
                }
            }
        }
    }
}

fn backend_error<E>(operation: &str, e: E) -> StorageError
where
    E: std::error::Error,
{
    StorageError::ObjectStore(format!("{}: {}", operation, DisplayErrorContext(&e)))
}

fn lowercase_keys(metadata: Option<&HashMap<String, String>>) -> HashMap<String, String> {
    metadata
        .map(|m| {
            m.iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}
