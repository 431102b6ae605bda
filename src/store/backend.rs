//! Abstract multipart store trait.
//!
//! Every store must implement [`MultipartStore`].  Each method is exactly
//! one remote round trip; retries and connection pooling belong to the
//! implementation, never to the caller.

use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Destination of an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadTarget {
    /// Bucket (container) name.
    pub bucket: String,
    /// Object key inside the bucket.
    pub key: String,
}

impl UploadTarget {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for UploadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// One uploaded part, as referenced in the completion manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartRecord {
    /// 1-based part number.
    pub part_number: u32,
    /// Byte offset of the part within the source.
    pub offset: u64,
    /// Part length in bytes.
    pub length: u64,
    /// Completion tag returned by the store.
    pub etag: String,
}

/// Async multipart upload contract.
pub trait MultipartStore: Send + Sync + 'static {
    /// Create a multipart upload session for `target`, returning its upload ID.
    fn initiate_session(
        &self,
        target: &UploadTarget,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>>;

    /// Transmit one part, returning the store's ETag for it.
    fn upload_part(
        &self,
        target: &UploadTarget,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>>;

    /// Finalize the upload from `parts`, which must be in ascending part
    /// number order and reference every uploaded part.
    fn complete_session(
        &self,
        target: &UploadTarget,
        upload_id: &str,
        parts: &[PartRecord],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Abort the upload and release all part data held by the store.
    fn abort_session(
        &self,
        target: &UploadTarget,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}
