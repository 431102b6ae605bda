//! chunklift -- multipart uploads to S3-compatible object storage.
//!
//! `chunklift upload` sends one local file; `chunklift serve` exposes the
//! same pipeline over HTTP.  Ctrl-C during an upload aborts the remote
//! session before the process exits.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use chunklift::config::{Config, LoggingConfig};
use chunklift::source::{ChunkSource, FileSource};
use chunklift::store::backend::UploadTarget;
use chunklift::upload::{CancellationFlag, MultipartUploader, UploadOptions, UploadProgress};

/// Command-line arguments for chunklift.
#[derive(Parser, Debug)]
#[command(
    name = "chunklift",
    version,
    about = "Multipart uploads to S3-compatible object storage"
)]
struct Cli {
    /// Path to the YAML configuration file (defaults apply when omitted).
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Override the storage backend (`aws` or `memory`).
    #[arg(long, global = true)]
    backend: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file as a multipart upload.
    Upload {
        /// Destination bucket.
        #[arg(short, long)]
        bucket: String,

        /// Destination key (defaults to the file name).
        #[arg(short, long)]
        key: Option<String>,

        /// File to upload.
        #[arg(short, long)]
        file: PathBuf,

        /// Part size in bytes (overrides `upload.chunk_size`).
        #[arg(long)]
        chunk_size: Option<u64>,
    },
    /// Serve the HTTP upload endpoint.
    Serve {
        /// Override the bind address (host:port).
        #[arg(short, long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => chunklift::config::load_config(path)?,
        None => Config::default(),
    };
    if let Some(backend) = cli.backend {
        config.storage.backend = backend;
    }

    init_tracing(&config.logging);
    if let Some(path) = &cli.config {
        info!("Loaded configuration from {}", path);
    }

    match cli.command {
        Command::Upload {
            bucket,
            key,
            file,
            chunk_size,
        } => run_upload(config, bucket, key, file, chunk_size).await,
        Command::Serve { bind } => run_server(config, bind).await,
    }
}

/// Initialize tracing. `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_upload(
    config: Config,
    bucket: String,
    key: Option<String>,
    file: PathBuf,
    chunk_size: Option<u64>,
) -> anyhow::Result<()> {
    let key = match key {
        Some(key) => key,
        None => file
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("cannot derive a key from {:?}; pass --key", file))?,
    };
    let chunk_size = chunk_size.unwrap_or(config.upload.chunk_size);

    let mut source = FileSource::open(&file).await?;
    info!(
        "Uploading {:?} ({} bytes) to {}/{}",
        source.path(),
        source.total_len(),
        bucket,
        key
    );

    let store = chunklift::build_store(&config).await?;
    let uploader = MultipartUploader::new(store);

    let cancel = CancellationFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT, aborting after the current part");
            on_signal.cancel();
        }
    });

    let options = UploadOptions {
        progress: Some(Arc::new(|p: UploadProgress| {
            info!(
                "Part {} done: {}/{} bytes ({:.1}%)",
                p.part_number,
                p.bytes_transferred,
                p.total_bytes,
                p.bytes_transferred as f64 * 100.0 / p.total_bytes as f64
            );
        })),
        cancel: Some(cancel),
    };

    let target = UploadTarget::new(bucket, key);
    match uploader
        .upload(&mut source, &target, chunk_size, &options)
        .await
    {
        Ok(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Err(err) => {
            if err.is_terminal() {
                error!(
                    "Upload to {} left orphaned parts on the store; manual cleanup required",
                    target
                );
            }
            Err(err.into())
        }
    }
}

async fn run_server(config: Config, bind: Option<String>) -> anyhow::Result<()> {
    let bind_addr = bind.unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        chunklift::metrics::init_metrics()?;
        chunklift::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let store = chunklift::build_store(&config).await?;
    let state = Arc::new(chunklift::AppState {
        config,
        uploader: MultipartUploader::new(store),
    });

    let app = chunklift::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("chunklift listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("chunklift shut down");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
