//! Server binary for pdf2md-server.
//!
//! A thin shim over the library crate that maps flags and environment
//! variables to `ServiceConfig`, sets up logging and runs the HTTP service.

use anyhow::{Context, Result};
use clap::Parser;
use pdf2md_server::{run, ConversionService, MarkerWorkerLoader, ServiceConfig};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"EXAMPLES:
  # Serve on the default port
  pdf2md-server

  # GPU box, longer timeout
  TORCH_DEVICE=cuda PROCESSING_TIMEOUT=900 pdf2md-server --bind 0.0.0.0:9000

  # Convert a document
  curl -X POST http://localhost:8000/convert -F "file=@document.pdf"

  # Readiness
  curl http://localhost:8000/health

ENVIRONMENT VARIABLES:
  BIND_ADDR           Listen address (default 0.0.0.0:8000)
  MODEL_CACHE_DIR     Model cache directory (default /tmp/marker_models)
  TORCH_DEVICE        Torch device for the converter; anything but "cpu" means GPU
  PROCESSING_TIMEOUT  Seconds allowed per conversion (default 300)
  MAX_FILE_SIZE_MB    Upload limit in MB (default 50)
  MARKER_WORKER       Converter worker executable (default marker_worker)
  MODEL_LOAD_TIMEOUT  Seconds allowed for loading the models (default 600)
  STAGING_DIR         Where uploads are staged (default: system temp dir)
  LOG_LEVEL           Log level when RUST_LOG is unset (default INFO)
"#;

/// Serve PDF-to-Markdown conversion over HTTP.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2md-server",
    version,
    about = "Serve PDF-to-Markdown conversion over HTTP",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8000")]
    bind: String,

    /// Directory the converter caches model weights in.
    #[arg(long, env = "MODEL_CACHE_DIR", default_value = pdf2md_server::config::DEFAULT_MODEL_CACHE_DIR)]
    model_cache_dir: PathBuf,

    /// Torch device passed to the converter (cpu, cuda, mps, …).
    #[arg(long, env = "TORCH_DEVICE")]
    torch_device: Option<String>,

    /// Seconds allowed per conversion.
    #[arg(long, env = "PROCESSING_TIMEOUT", default_value_t = 300)]
    processing_timeout: u64,

    /// Maximum upload size in megabytes.
    #[arg(long, env = "MAX_FILE_SIZE_MB", default_value_t = 50)]
    max_file_size_mb: u64,

    /// Converter worker executable.
    #[arg(long, env = "MARKER_WORKER", default_value = pdf2md_server::config::DEFAULT_WORKER_BIN)]
    marker_worker: PathBuf,

    /// Seconds allowed for the worker to load its models.
    #[arg(long, env = "MODEL_LOAD_TIMEOUT", default_value_t = 600)]
    model_load_timeout: u64,

    /// Directory uploads are staged in.
    #[arg(long, env = "STAGING_DIR")]
    staging_dir: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, env = "LOG_LEVEL", default_value = "INFO")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_lowercase())),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli)?;
    info!(
        "{} {} starting (device: {})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        config.torch_device.as_deref().unwrap_or("cpu")
    );
    if config.gpu_enabled() {
        info!("GPU mode requested; device selection is left to the converter");
    }

    let loader = Arc::new(MarkerWorkerLoader::from_config(&config));
    let service = Arc::new(ConversionService::new(config));

    let listener = tokio::net::TcpListener::bind(&cli.bind)
        .await
        .with_context(|| format!("Failed to bind {}", cli.bind))?;

    run(listener, service, loader, shutdown_signal())
        .await
        .context("Service terminated")?;

    Ok(())
}

/// Map CLI args to `ServiceConfig`.
fn build_config(cli: &Cli) -> Result<ServiceConfig> {
    let mut builder = ServiceConfig::builder()
        .model_cache_dir(&cli.model_cache_dir)
        .torch_device(cli.torch_device.clone())
        .processing_timeout_secs(cli.processing_timeout)
        .max_file_size_mb(cli.max_file_size_mb)
        .worker_bin(&cli.marker_worker)
        .model_load_timeout_secs(cli.model_load_timeout);

    if let Some(ref dir) = cli.staging_dir {
        builder = builder.staging_dir(dir);
    }

    builder.build().context("Invalid configuration")
}

/// Resolve on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
