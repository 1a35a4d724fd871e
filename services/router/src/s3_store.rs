use crate::config::S3Config;
use crate::remote::{object_key, BlobLocation, RemoteBlobStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use tracing::{debug, info, instrument};

/// S3-backed blob store for JSON and media uploads
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3BlobStore {
    /// Create a new S3 blob store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
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
            bucket = %config.bucket,
            region = %config.region,
            "S3 blob store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    /// Resolvable location for an object key
    pub fn location_for(&self, key: &str) -> String {
        object_location(&self.bucket, self.config.public_base_url.as_deref(), key)
    }

    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    async fn upload(&self, bytes: &[u8], key: &str, content_type: &str) -> Result<BlobLocation> {
        debug!(key = %key, "Uploading object to S3");

        // Check if we should use multipart upload
        if bytes.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(bytes, key, content_type).await?;
        } else {
            self.simple_upload(bytes, key, content_type).await?;
        }

        info!(key = %key, size_bytes = bytes.len(), "Object uploaded successfully");

        Ok(BlobLocation {
            key: key.to_string(),
            location: self.location_for(key),
        })
    }

    /// Simple single-part upload for small objects
    async fn simple_upload(&self, bytes: &[u8], key: &str, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(content_type)
            .send()
            .await
            .context("Failed to upload object to S3")?;

        Ok(())
    }

    /// Multipart upload for large objects
    async fn multipart_upload(&self, bytes: &[u8], key: &str, content_type: &str) -> Result<()> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .context("Failed to create multipart upload")?;

        let upload_id = create_response
            .upload_id()
            .context("No upload ID in response")?;

        let mut completed_parts = Vec::new();

        for (index, chunk) in bytes.chunks(self.config.part_size_bytes.max(1)).enumerate() {
            let part_number = index as i32 + 1;

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .context("Failed to upload part")?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .context("Failed to complete multipart upload")?;

        Ok(())
    }
}

#[async_trait]
impl RemoteBlobStore for S3BlobStore {
    async fn put(&self, bytes: &[u8], key: &str, folder: &str) -> Result<BlobLocation> {
        let content_type = content_type_for(key);
        self.upload(bytes, &object_key(folder, key), content_type).await
    }

    async fn put_raw(&self, bytes: &[u8], key: &str, folder: &str) -> Result<BlobLocation> {
        self.upload(bytes, &object_key(folder, key), "application/json")
            .await
    }

    #[instrument(skip(self))]
    async fn list(&self, folder: &str) -> Result<Vec<BlobLocation>> {
        let prefix = object_key(folder, "");
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .context("Failed to list objects")?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(String::from)),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys
            .into_iter()
            .map(|key| BlobLocation {
                location: self.location_for(&key),
                key,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("Failed to get object")?;

        let body = response
            .body
            .collect()
            .await
            .context("Failed to read object body")?;

        Ok(body.into_bytes().to_vec())
    }
}

fn object_location(bucket: &str, public_base_url: Option<&str>, key: &str) -> String {
    match public_base_url {
        Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
        None => format!("s3://{}/{}", bucket, key),
    }
}

/// Get content type from a key's extension
fn content_type_for(key: &str) -> &'static str {
    let extension = key.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
    match extension.to_lowercase().as_str() {
        "json" => "application/json",
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "wmv" => "video/x-ms-wmv",
        _ => "application/octet-stream",
    }
}
