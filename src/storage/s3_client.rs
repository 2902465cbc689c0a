//! S3-compatible storage client
//!
//! Wraps the AWS SDK multipart-upload calls for S3-compatible storage access.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata},
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart},
    Client,
};
use bytes::Bytes;

use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};

use super::types::{CompletedPart, StorageAdapter};

/// S3-compatible storage client
#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
    endpoint: String,
}

impl S3Client {
    /// Create a new S3 client from configuration
    pub async fn new(config: &StorageConfig) -> StorageResult<Self> {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "resumable-upload",
        );

        let region = config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(true) // Required for MinIO and other S3-compatible services
            .build();

        let client = Client::from_conf(s3_config);

        // Test connection by checking if bucket exists
        let bucket = config.bucket.clone();
        match client.head_bucket().bucket(&bucket).send().await {
            Ok(_) => {
                tracing::info!("Connected to S3 bucket: {}", bucket);
            }
            Err(e) => {
                tracing::warn!(
                    "Could not verify bucket {}: {}. Will attempt operations anyway.",
                    bucket,
                    e
                );
            }
        }

        Ok(Self {
            client,
            bucket,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn fallback_location(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint,
            self.bucket,
            urlencoding::encode(key).replace("%2F", "/")
        )
    }
}

/// Map an SDK failure onto [`StorageError`], keeping the backend message.
fn map_sdk_error<E>(operation: &str, key: &str, err: E) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let message = format!("Failed to {} {}: {}", operation, key, DisplayErrorContext(&err));
    match err.code() {
        Some("EntityTooSmall") => StorageError::PartTooSmall(message),
        Some("NoSuchUpload") => StorageError::UploadNotFound(message),
        _ => StorageError::SdkError(message),
    }
}

#[async_trait]
impl StorageAdapter for S3Client {
    async fn initiate_multipart(
        &self,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> StorageResult<String> {
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type);

        if !metadata.is_empty() {
            request = request.set_metadata(Some(metadata.clone()));
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_sdk_error("initiate multipart upload for", key, e))?;

        response
            .upload_id()
            .map(|id| id.to_string())
            .ok_or_else(|| StorageError::SdkError(format!("No upload id returned for {}", key)))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StorageResult<String> {
        let size = data.len();
        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| map_sdk_error("upload part of", key, e))?;

        tracing::debug!(key = %key, part_number, size, "Uploaded part to S3");

        response
            .e_tag()
            .map(|tag| tag.to_string())
            .ok_or_else(|| StorageError::SdkError(format!("No ETag returned for part {} of {}", part_number, key)))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<String> {
        let s3_parts = parts
            .iter()
            .map(|part| {
                S3CompletedPart::builder()
                    .part_number(part.part_number as i32)
                    .e_tag(&part.completion_tag)
                    .build()
            })
            .collect::<Vec<_>>();

        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(s3_parts))
            .build();

        let response = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|e| map_sdk_error("complete multipart upload for", key, e))?;

        Ok(response
            .location()
            .map(|location| location.to_string())
            .unwrap_or_else(|| self.fallback_location(key)))
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| map_sdk_error("abort multipart upload for", key, e))?;
        Ok(())
    }
}
