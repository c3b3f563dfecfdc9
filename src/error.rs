//! Error types for the pdf2md-server library.
//!
//! Two distinct error types reflect two distinct layers:
//!
//! * [`ServiceError`] — everything a request (or the service lifecycle) can
//!   fail with. Each variant belongs to one kind of the taxonomy below and
//!   knows the HTTP status it maps to.
//!
//! * [`BackendError`] — failures raised by the external converter behind
//!   [`crate::backend::ModelBundle`] / [`crate::backend::ModelLoader`]. These
//!   are wrapped by [`ServiceError::Conversion`] or [`ServiceError::ModelLoad`].
//!
//! | Kind | Variants | Status |
//! |------|----------|--------|
//! | invalid input | `UnsupportedFileType`, `MalformedUpload`, `MissingFile`, `PayloadTooLarge` | 400 / 422 / 413 |
//! | not ready | `ModelsNotLoaded` | 503 |
//! | processing failure | `Staging`, `Conversion`, `Timeout` | 500 |
//! | fatal (startup) | `ModelLoad`, `ModelsAlreadyLoaded`, `Server`, `InvalidConfig` | 500 |

use axum::http::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

/// All errors surfaced by the conversion service.
#[derive(Debug, Error)]
pub enum ServiceError {
    // ── Invalid input ─────────────────────────────────────────────────────
    /// The uploaded filename does not carry the supported extension.
    #[error("Only PDF files are supported")]
    UnsupportedFileType { filename: String },

    /// The request body could not be read as `multipart/form-data`.
    #[error("Malformed upload: {detail}")]
    MalformedUpload { detail: String },

    /// The multipart body has no `file` field.
    #[error("No file field in upload")]
    MissingFile,

    /// The upload is larger than the configured limit.
    #[error("Upload exceeds the {limit_mb} MB limit")]
    PayloadTooLarge { limit_mb: u64 },

    // ── Not ready ─────────────────────────────────────────────────────────
    /// A conversion arrived before the model bundle finished loading.
    #[error("Models are not loaded yet")]
    ModelsNotLoaded,

    // ── Processing failures ───────────────────────────────────────────────
    /// Writing the upload to its temporary file failed.
    #[error("failed to stage upload: {source}")]
    Staging {
        #[source]
        source: std::io::Error,
    },

    /// The external converter reported an error.
    #[error("{0}")]
    Conversion(#[from] BackendError),

    /// The converter did not finish within the processing timeout.
    #[error("processing timed out after {secs}s")]
    Timeout { secs: u64 },

    // ── Startup ───────────────────────────────────────────────────────────
    /// Loading the model bundle failed.
    #[error("Failed to load models: {0}")]
    ModelLoad(#[source] BackendError),

    /// A second bundle was offered after the first one was installed.
    #[error("Models are already loaded")]
    ModelsAlreadyLoaded,

    /// The serve loop failed or its task panicked.
    #[error("Server on '{addr}' failed: {source}")]
    Server {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ServiceError {
    /// HTTP status this error is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::UnsupportedFileType { .. } | ServiceError::MalformedUpload { .. } => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::MissingFile => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ServiceError::ModelsNotLoaded => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// `true` for failures that happened after the upload was accepted.
    pub fn is_processing_failure(&self) -> bool {
        matches!(
            self,
            ServiceError::Staging { .. }
                | ServiceError::Conversion(_)
                | ServiceError::Timeout { .. }
        )
    }

    /// Message placed in the `detail` field of the error body.
    ///
    /// Processing failures are prefixed with `Conversion failed:` so callers
    /// see the underlying cause; every other kind reports its own message.
    pub fn detail(&self) -> String {
        if self.is_processing_failure() {
            format!("Conversion failed: {self}")
        } else {
            self.to_string()
        }
    }
}

/// Errors raised by a converter backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Free-form failure reported by the converter.
    #[error("{0}")]
    Failed(String),

    /// The converter executable could not be started.
    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The worker exited before it was ready.
    #[error("'{program}' exited with {status}: {stderr}")]
    ProcessFailed {
        program: PathBuf,
        status: String,
        stderr: String,
    },

    /// Reading or preparing converter files failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Talking to the converter worker over its pipes failed.
    #[error("converter worker pipe failed: {source}")]
    Pipe {
        #[source]
        source: std::io::Error,
    },

    /// A request could not be encoded for the worker.
    #[error("failed to encode converter request: {0}")]
    Encode(#[source] serde_json::Error),

    /// The worker did not report its models loaded in time.
    #[error("'{program}' did not load its models within {secs}s")]
    StartupTimeout { program: PathBuf, secs: u64 },

    /// The worker process is gone.
    #[error("converter worker '{program}' is no longer running")]
    WorkerExited { program: PathBuf },
}
