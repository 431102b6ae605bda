//! AWS S3 multipart store.
//!
//! Drives the native S3 multipart API (`CreateMultipartUpload`,
//! `UploadPart`, `CompleteMultipartUpload`, `AbortMultipartUpload`).
//!
//! Credentials are resolved via the standard AWS credential chain
//! (env vars, `~/.aws/credentials`, IAM role, etc.) unless explicit keys
//! are configured.  The SDK client pools connections and applies its own
//! retry policy per call.

use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info};

use super::backend::{MultipartStore, PartRecord, UploadTarget};

/// Store that forwards the multipart protocol to AWS S3 (or any
/// S3-compatible endpoint).
#[derive(Debug, Clone)]
pub struct AwsMultipartStore {
    /// AWS S3 SDK client.
    client: Client,
}

impl AwsMultipartStore {
    /// Create a new S3 store.
    ///
    /// Loads AWS credentials from the default credential chain unless both
    /// `access_key_id` and `secret_access_key` are given, and initializes the
    /// S3 client for the specified region.
    pub async fn new(
        region: String,
        endpoint_url: Option<String>,
        use_path_style: bool,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
    ) -> anyhow::Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()));

        if let Some(ref endpoint) = endpoint_url {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        match (&access_key_id, &secret_access_key) {
            (Some(ak), Some(sk)) => {
                let creds = aws_sdk_s3::config::Credentials::new(
                    ak,
                    sk,
                    None, // session_token
                    None, // expiry
                    "chunklift-config",
                );
                config_loader = config_loader.credentials_provider(creds);
            }
            (None, None) => {}
            _ => anyhow::bail!(
                "incomplete S3 credentials: both access_key_id and secret_access_key must be set"
            ),
        }

        let sdk_config = config_loader.load().await;

        let s3_config_builder =
            aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(use_path_style);

        let client = Client::from_conf(s3_config_builder.build());

        info!(
            "AWS S3 store initialized: region={} endpoint={}",
            region,
            endpoint_url.as_deref().unwrap_or("default")
        );

        Ok(Self { client })
    }

    /// Wrap an already configured client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Map an AWS SDK error to an anyhow error with context.
    fn map_sdk_error(context: &str, err: impl std::fmt::Display) -> anyhow::Error {
        anyhow::anyhow!("AWS S3 {context}: {err}")
    }
}

/// S3 part numbers are `i32` on the wire and limited to 1..=10000.
fn wire_part_number(part_number: u32) -> anyhow::Result<i32> {
    i32::try_from(part_number)
        .map_err(|_| anyhow::anyhow!("part number {part_number} out of range"))
}

/// Build the `CompleteMultipartUpload` body from the manifest.
fn completed_upload(parts: &[PartRecord]) -> anyhow::Result<CompletedMultipartUpload> {
    let completed_parts = parts
        .iter()
        .map(|part| {
            Ok(CompletedPart::builder()
                .e_tag(&part.etag)
                .part_number(wire_part_number(part.part_number)?)
                .build())
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(CompletedMultipartUpload::builder()
        .set_parts(Some(completed_parts))
        .build())
}

impl MultipartStore for AwsMultipartStore {
    fn initiate_session(
        &self,
        target: &UploadTarget,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let target = target.clone();
        Box::pin(async move {
            debug!(
                "AWS create_multipart_upload: bucket={} key={}",
                target.bucket, target.key
            );

            let resp = self
                .client
                .create_multipart_upload()
                .bucket(&target.bucket)
                .key(&target.key)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("create_multipart_upload", DisplayErrorContext(e)))?;

            let upload_id = resp
                .upload_id()
                .ok_or_else(|| anyhow::anyhow!("AWS did not return upload ID"))?
                .to_string();

            Ok(upload_id)
        })
    }

    fn upload_part(
        &self,
        target: &UploadTarget,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let target = target.clone();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let wire_number = wire_part_number(part_number)?;
            let length = data.len() as i64;

            debug!(
                "AWS upload_part: bucket={} key={} upload={} part={} bytes={}",
                target.bucket, target.key, upload_id, part_number, length
            );

            let resp = self
                .client
                .upload_part()
                .bucket(&target.bucket)
                .key(&target.key)
                .upload_id(&upload_id)
                .part_number(wire_number)
                .content_length(length)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("upload_part", DisplayErrorContext(e)))?;

            // An absent ETag surfaces as an empty tag; the orchestrator
            // refuses to complete with it.
            Ok(resp.e_tag().unwrap_or("").to_string())
        })
    }

    fn complete_session(
        &self,
        target: &UploadTarget,
        upload_id: &str,
        parts: &[PartRecord],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let target = target.clone();
        let upload_id = upload_id.to_string();
        let parts = parts.to_vec();
        Box::pin(async move {
            debug!(
                "AWS complete_multipart_upload: bucket={} key={} upload={} parts={}",
                target.bucket,
                target.key,
                upload_id,
                parts.len()
            );

            let completed = completed_upload(&parts)?;

            self.client
                .complete_multipart_upload()
                .bucket(&target.bucket)
                .key(&target.key)
                .upload_id(&upload_id)
                .multipart_upload(completed)
                .send()
                .await
                .map_err(|e| {
                    Self::map_sdk_error("complete_multipart_upload", DisplayErrorContext(e))
                })?;

            Ok(())
        })
    }

    fn abort_session(
        &self,
        target: &UploadTarget,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let target = target.clone();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            debug!(
                "AWS abort_multipart_upload: bucket={} key={} upload={}",
                target.bucket, target.key, upload_id
            );

            self.client
                .abort_multipart_upload()
                .bucket(&target.bucket)
                .key(&target.key)
                .upload_id(&upload_id)
                .send()
                .await
                .map_err(|e| {
                    Self::map_sdk_error("abort_multipart_upload", DisplayErrorContext(e))
                })?;

            Ok(())
        })
    }
}

// -- Tests -------------------------------------------------------------------
