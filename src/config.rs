//! Configuration types for the conversion service.
//!
//! All service behaviour is controlled through [`ServiceConfig`], built via
//! its [`ServiceConfigBuilder`]. The binary maps its flags and environment
//! variables onto the builder; tests construct configs directly.
//!
//! The options handed to the converter on every request are fixed and live in
//! [`ConvertOptions`].

use crate::error::ServiceError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Filename suffix accepted by `POST /convert`. Compared case-sensitively.
pub const SUPPORTED_EXTENSION: &str = ".pdf";

/// Default directory the converter caches its model weights in.
pub const DEFAULT_MODEL_CACHE_DIR: &str = "/tmp/marker_models";

/// Default converter worker executable.
pub const DEFAULT_WORKER_BIN: &str = "marker_worker";

/// Configuration for the conversion service.
///
/// # Example
/// ```rust
/// use pdf2md_server::ServiceConfig;
///
/// let config = ServiceConfig::builder()
///     .processing_timeout_secs(120)
///     .max_file_size_mb(20)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_upload_bytes(), 20 * 1024 * 1024);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Directory the converter caches model weights in. Default: `/tmp/marker_models`.
    pub model_cache_dir: PathBuf,

    /// Raw `TORCH_DEVICE` value. `None` means CPU.
    pub torch_device: Option<String>,

    /// Upper bound on a single conversion, in seconds. Default: 300.
    pub processing_timeout_secs: u64,

    /// Maximum accepted upload size in megabytes. Default: 50.
    pub max_file_size_mb: u64,

    /// Converter worker, looked up on `PATH` when not absolute. Default: `marker_worker`.
    pub worker_bin: PathBuf,

    /// How long the worker may take to load its models, in seconds. Default: 600.
    pub model_load_timeout_secs: u64,

    /// Directory uploads are staged in. Default: the system temp directory.
    pub staging_dir: PathBuf,

    /// Filename suffix uploads must carry. Default: `.pdf`.
    pub supported_extension: String,

    /// Options passed to the converter on every request.
    pub convert_options: ConvertOptions,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            model_cache_dir: PathBuf::from(DEFAULT_MODEL_CACHE_DIR),
            torch_device: None,
            processing_timeout_secs: 300,
            max_file_size_mb: 50,
            worker_bin: PathBuf::from(DEFAULT_WORKER_BIN),
            model_load_timeout_secs: 600,
            staging_dir: std::env::temp_dir(),
            supported_extension: SUPPORTED_EXTENSION.to_string(),
            convert_options: ConvertOptions::default(),
        }
    }
}

impl ServiceConfig {
    /// Create a new builder for `ServiceConfig`.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }

    /// Whether `TORCH_DEVICE` selects anything other than the CPU.
    ///
    /// Reported at startup and forwarded to the converter; this service does
    /// not act on it.
    pub fn gpu_enabled(&self) -> bool {
        self.torch_device
            .as_deref()
            .map(|d| d != "cpu")
            .unwrap_or(false)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    pub fn model_load_timeout(&self) -> Duration {
        Duration::from_secs(self.model_load_timeout_secs)
    }

    pub fn max_upload_bytes(&self) -> usize {
        (self.max_file_size_mb as usize).saturating_mul(1024 * 1024)
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn model_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.model_cache_dir = dir.into();
        self
    }

    /// Empty strings are treated as unset.
    pub fn torch_device(mut self, device: Option<String>) -> Self {
        self.config.torch_device = device.filter(|d| !d.is_empty());
        self
    }

    pub fn processing_timeout_secs(mut self, secs: u64) -> Self {
        self.config.processing_timeout_secs = secs;
        self
    }

    pub fn max_file_size_mb(mut self, mb: u64) -> Self {
        self.config.max_file_size_mb = mb;
        self
    }

    pub fn worker_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.config.worker_bin = bin.into();
        self
    }

    pub fn model_load_timeout_secs(mut self, secs: u64) -> Self {
        self.config.model_load_timeout_secs = secs;
        self
    }

    pub fn staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.staging_dir = dir.into();
        self
    }

    pub fn supported_extension(mut self, ext: impl Into<String>) -> Self {
        self.config.supported_extension = ext.into();
        self
    }

    pub fn convert_options(mut self, options: ConvertOptions) -> Self {
        self.config.convert_options = options;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServiceConfig, ServiceError> {
        let c = &self.config;
        if c.processing_timeout_secs == 0 {
            return Err(ServiceError::InvalidConfig(
                "processing timeout must be ≥ 1 second".into(),
            ));
        }
        if c.model_load_timeout_secs == 0 {
            return Err(ServiceError::InvalidConfig(
                "model load timeout must be ≥ 1 second".into(),
            ));
        }
        if c.max_file_size_mb == 0 {
            return Err(ServiceError::InvalidConfig(
                "max file size must be ≥ 1 MB".into(),
            ));
        }
        if c.supported_extension.is_empty() {
            return Err(ServiceError::InvalidConfig(
                "supported extension must not be empty".into(),
            ));
        }
        if c.convert_options.batch_multiplier == 0 {
            return Err(ServiceError::InvalidConfig(
                "batch multiplier must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

/// Options handed to the converter for each document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertOptions {
    /// Page limit. `None` converts every page.
    pub max_pages: Option<usize>,
    /// Languages the OCR models should expect.
    pub langs: Vec<String>,
    /// Scales the converter's internal batch sizes.
    pub batch_multiplier: u32,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            max_pages: None,
            langs: vec!["English".to_string()],
            batch_multiplier: 2,
        }
    }
}
