//! S3-compatible blob storage
//!
//! Wraps the AWS SDK for S3-compatible storage access. Streamed writes use
//! multipart uploads so large merged files never sit in memory whole.

use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier},
    Client,
};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::StorageBackend;

use super::types::{BlobReader, BlobStore, StorageError};

/// Multipart part size (S3 minimum is 5MB for all but the last part)
const PART_SIZE: usize = 8 * 1024 * 1024;

/// S3-backed blob store
#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    /// Create a new store from an S3 backend configuration
    pub async fn new(backend: &StorageBackend) -> Result<Self, StorageError> {
        let StorageBackend::S3 {
            endpoint,
            bucket,
            access_key,
            secret_key,
            region,
        } = backend
        else {
            return Err(StorageError::Config("not an S3 backend".to_string()));
        };

        let credentials = Credentials::new(access_key, secret_key, None, None, "ingest-server");
        let region = region.clone().unwrap_or_else(|| "us-east-1".to_string());

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(endpoint)
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(true) // Required for MinIO and other S3-compatible services
            .build();

        let client = Client::from_conf(s3_config);

        match client.head_bucket().bucket(bucket).send().await {
            Ok(_) => tracing::info!("Connected to S3 bucket: {}", bucket),
            Err(e) => tracing::warn!(
                "Could not verify bucket {}: {}. Will attempt operations anyway.",
                bucket,
                e
            ),
        }

        Ok(Self {
            client,
            bucket: bucket.clone(),
        })
    }

    fn key(path: &str) -> Result<&str, StorageError> {
        if path.is_empty() || path.starts_with('/') || path.split('/').any(|s| s == ".." || s == ".") {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(path)
    }

    fn sdk_error(action: &str, key: &str, e: impl std::fmt::Display) -> StorageError {
        let message = e.to_string();
        if message.contains("404") || message.contains("NoSuchKey") || message.contains("NotFound") {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::SdkError(format!("Failed to {} {}: {}", action, key, message))
        }
    }

    async fn put_object(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| Self::sdk_error("put object", key, e))?;
        Ok(())
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first: Vec<u8>,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(Vec<CompletedPart>, u64), StorageError> {
        let mut parts = Vec::new();
        let mut total = 0u64;
        let mut buffer = first;
        let mut part_number = 1;

        while !buffer.is_empty() {
            total += buffer.len() as u64;
            let response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buffer))
                .send()
                .await
                .map_err(|e| Self::sdk_error("upload part", key, e))?;

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(response.e_tag().map(|s| s.to_string()))
                    .build(),
            );

            part_number += 1;
            buffer = read_part(reader).await?;
        }

        Ok((parts, total))
    }
}

/// Fill a buffer of up to `PART_SIZE` bytes, stopping early only at EOF
async fn read_part(reader: &mut (dyn AsyncRead + Send + Unpin)) -> Result<Vec<u8>, StorageError> {
    let mut buffer = Vec::with_capacity(PART_SIZE);
    let mut limited = reader.take(PART_SIZE as u64);
    limited.read_to_end(&mut buffer).await?;
    Ok(buffer)
}

#[async_trait::async_trait]
impl BlobStore for S3BlobStore {
    async fn write_stream(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, StorageError> {
        let key = Self::key(path)?;
        let first = read_part(reader).await?;

        if first.len() < PART_SIZE {
            let size = first.len() as u64;
            self.put_object(key, first).await?;
            return Ok(size);
        }

        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| Self::sdk_error("start multipart upload", key, e))?;
        let upload_id = upload
            .upload_id()
            .ok_or_else(|| StorageError::SdkError(format!("No upload id returned for {}", key)))?
            .to_string();

        match self.upload_parts(key, &upload_id, first, reader).await {
            Ok((parts, total)) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| Self::sdk_error("complete multipart upload", key, e))?;
                Ok(total)
            }
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(key = %key, error = %abort, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn open_read(&self, path: &str) -> Result<BlobReader, StorageError> {
        let key = Self::key(path)?;
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::sdk_error("get object", key, e))?;

        Ok(Box::pin(response.body.into_async_read()))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = Self::key(from)?;
        let target = Self::key(to)?;

        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, source))
            .key(target)
            .send()
            .await
            .map_err(|e| Self::sdk_error("copy object", source, e))?;

        self.remove(source).await
    }

    async fn remove(&self, path: &str) -> Result<(), StorageError> {
        let key = Self::key(path)?;
        // DeleteObject succeeds for missing keys
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::sdk_error("delete object", key, e))?;
        Ok(())
    }

    async fn remove_tree(&self, prefix: &str) -> Result<usize, StorageError> {
        let prefix = format!("{}/", Self::key(prefix.trim_end_matches('/'))?);
        let mut removed = 0;
        let mut continuation_token = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| Self::sdk_error("list objects", &prefix, e))?;

            let identifiers = response
                .contents()
                .iter()
                .filter_map(|obj| obj.key())
                .map(|key| {
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(|e| StorageError::SdkError(e.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;

            if !identifiers.is_empty() {
                let count = identifiers.len();
                let delete = Delete::builder()
                    .set_objects(Some(identifiers))
                    .build()
                    .map_err(|e| StorageError::SdkError(e.to_string()))?;

                self.client
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(|e| Self::sdk_error("delete objects", &prefix, e))?;
                removed += count;
            }

            if !response.is_truncated().unwrap_or(false) {
                break;
            }
            continuation_token = response.next_continuation_token().map(|s| s.to_string());
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(S3BlobStore::key("image/abc.png").is_ok());
        assert!(S3BlobStore::key("/abs").is_err());
        assert!(S3BlobStore::key("a/../b").is_err());
        assert!(S3BlobStore::key("").is_err());
    }

    #[tokio::test]
    async fn test_read_part_stops_at_eof() {
        let data = vec![7u8; 1024];
        let mut reader: &[u8] = &data;
        let part = read_part(&mut reader).await.unwrap();
        assert_eq!(part.len(), 1024);
        let rest = read_part(&mut reader).await.unwrap();
        assert!(rest.is_empty());
    }
}
