//! Configuration loading and types for chunklift.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Every section is optional and falls back to the
//! defaults below.

use serde::Deserialize;
use std::path::Path;

use crate::upload::DEFAULT_CHUNK_SIZE;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Multipart upload settings.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Remote store settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest `Content-Length` accepted by `POST /upload` (default 5 GiB).
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_object_size: default_max_object_size(),
        }
    }
}

/// Multipart upload configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Part size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

/// Remote store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `aws` or `memory`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// AWS S3 configuration.
    #[serde(default)]
    pub aws: AwsStorageConfig,

    /// Memory store configuration.
    #[serde(default)]
    pub memory: MemoryStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            aws: AwsStorageConfig::default(),
            memory: MemoryStorageConfig::default(),
        }
    }
}

/// AWS S3 configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AwsStorageConfig {
    /// AWS region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom S3-compatible endpoint (e.g. MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: String,
    /// Force path-style URL addressing.
    #[serde(default)]
    pub use_path_style: bool,
    /// Explicit AWS access key (falls back to env/credential chain).
    #[serde(default)]
    pub access_key_id: String,
    /// Explicit AWS secret key (falls back to env/credential chain).
    #[serde(default)]
    pub secret_access_key: String,
}

impl Default for AwsStorageConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: String::new(),
            use_path_style: false,
            access_key_id: String::new(),
            secret_access_key: String::new(),
        }
    }
}

/// Memory store configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryStorageConfig {
    /// Maximum bytes held by in-progress parts (0 = unlimited).
    #[serde(default)]
    pub max_size_bytes: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9013
}

fn default_region() -> String {
    "us-west-2".to_string()
}

fn default_storage_backend() -> String {
    "aws".to_string()
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_max_object_size() -> u64 {
    5_368_709_120 // 5 GiB
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Helpers -----------------------------------------------------------------

/// Treat an empty config string as unset.
pub fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_config(&contents)
}

/// Parse configuration from YAML text.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.upload.chunk_size == 0 {
        anyhow::bail!("upload.chunk_size must be greater than zero");
    }
    match config.storage.backend.as_str() {
        "aws" | "memory" => {}
        other => anyhow::bail!("unknown storage.backend '{other}' (expected 'aws' or 'memory')"),
    }
    Ok(config)
}
