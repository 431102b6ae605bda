//! chunklift library -- multipart uploads to S3-compatible object storage.
//!
//! The core is [`upload::MultipartUploader`], which splits a
//! [`source::ChunkSource`] into fixed-size parts and drives the
//! initiate / upload-part / complete protocol against an injected
//! [`store::backend::MultipartStore`], aborting the remote session on any
//! failure.  The crate also ships the configuration, metrics and HTTP
//! plumbing used by the `chunklift` binary.

pub mod config;
pub mod errors;
pub mod metrics;
pub mod server;
pub mod source;
pub mod store;
pub mod upload;

use std::sync::Arc;

use crate::config::Config;
use crate::store::aws::AwsMultipartStore;
use crate::store::backend::MultipartStore;
use crate::store::memory::MemoryMultipartStore;
use crate::upload::MultipartUploader;

/// Shared application state passed to all handlers via `axum::extract::State`.
#[derive(Debug)]
pub struct AppState {
    /// Loaded configuration.
    pub config: Config,
    /// Uploader bound to the configured store.
    pub uploader: MultipartUploader,
}

/// Build the store selected by `config.storage.backend`.
pub async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn MultipartStore>> {
    let store: Arc<dyn MultipartStore> = match config.storage.backend.as_str() {
        "memory" => {
            tracing::info!(
                "Memory store initialized (max_size_bytes={})",
                config.storage.memory.max_size_bytes
            );
            Arc::new(MemoryMultipartStore::new(
                config.storage.memory.max_size_bytes,
            ))
        }
        "aws" => {
            let aws = &config.storage.aws;
            Arc::new(
                AwsMultipartStore::new(
                    aws.region.clone(),
                    config::non_empty(&aws.endpoint_url),
                    aws.use_path_style,
                    config::non_empty(&aws.access_key_id),
                    config::non_empty(&aws.secret_access_key),
                )
                .await?,
            )
        }
        other => anyhow::bail!("unknown storage backend '{other}'"),
    };
    Ok(store)
}
