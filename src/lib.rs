//! # pdf2md-server
//!
//! An HTTP service that converts uploaded PDF documents to Markdown by handing
//! them to an external, model-based converter (Marker). The models are loaded
//! once, at startup, by a long-lived worker process.
//!
//! The service itself does no PDF work. It stages the upload to a temporary
//! file, calls the converter through the [`backend::ModelBundle`] trait, maps
//! the result into JSON and deletes the temporary file again.
//!
//! ## Request Flow
//!
//! ```text
//! client
//!  │  POST /convert (multipart, field "file")
//!  ├─ 1. Check    filename must end in ".pdf"            → 400
//!  ├─ 2. Stage    write bytes to a scoped temp file
//!  ├─ 3. Convert  ModelBundle::convert, bounded by the processing timeout
//!  ├─ 4. Cleanup  temp file removed on every exit path
//!  └─ 5. Respond  {success, markdown_content, metadata}  | 500 {detail}
//! ```
//!
//! `GET /health` reports `{status: "healthy", models_loaded}`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf2md_server::{run, ConversionService, MarkerWorkerLoader, ServiceConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServiceConfig::default();
//!     let loader = Arc::new(MarkerWorkerLoader::from_config(&config));
//!     let service = Arc::new(ConversionService::new(config));
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await?;
//!     run(listener, service, loader, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2md-server` binary (clap + anyhow + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod config;
pub mod convert;
pub mod error;
pub mod output;
pub mod server;
pub mod staging;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::{MarkerWorker, MarkerWorkerLoader, ModelBundle, ModelLoader, RawConversion};
pub use config::{ConvertOptions, ServiceConfig, ServiceConfigBuilder};
pub use convert::ConversionService;
pub use error::{BackendError, ServiceError};
pub use output::{ConversionResponse, ErrorBody, HealthResponse, ResponseMetadata};
pub use server::{build_router, run, AppState};
pub use staging::StagedUpload;
