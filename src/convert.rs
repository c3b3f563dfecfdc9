//! The conversion service: model lifecycle plus the per-request flow.
//!
//! [`ConversionService`] is built once at startup and shared by every request
//! handler behind an `Arc`. It owns the configuration and a set-once slot for
//! the model bundle, which gives the two-state lifecycle:
//!
//! ```text
//! NotReady ──install_models()──▶ Ready      (once, never reverted)
//! ```
//!
//! A conversion runs through these steps:
//!
//! ```text
//! filename check ─▶ stage upload ─▶ bundle.convert (bounded by timeout) ─▶ map response
//!                        └──────────── staged file removed on every exit ────────┘
//! ```

use crate::backend::{ModelBundle, ModelLoader};
use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::output::{ConversionResponse, HealthResponse};
use crate::staging::StagedUpload;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Shared, immutable service context.
pub struct ConversionService {
    config: ServiceConfig,
    models: OnceCell<Arc<dyn ModelBundle>>,
}

impl std::fmt::Debug for ConversionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionService")
            .field("config", &self.config)
            .field("models_loaded", &self.models_loaded())
            .finish()
    }
}

impl ConversionService {
    /// A service with no models loaded yet.
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            models: OnceCell::new(),
        }
    }

    /// A service that is ready immediately.
    pub fn with_models(config: ServiceConfig, models: Arc<dyn ModelBundle>) -> Self {
        let service = Self::new(config);
        // A freshly created cell is always empty.
        let _ = service.models.set(models);
        service
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn models_loaded(&self) -> bool {
        self.models.get().is_some()
    }

    /// Make `models` available to requests. Only the first call succeeds.
    pub fn install_models(&self, models: Arc<dyn ModelBundle>) -> Result<(), ServiceError> {
        self.models
            .set(models)
            .map_err(|_| ServiceError::ModelsAlreadyLoaded)
    }

    /// Run `loader` and install what it returns.
    pub async fn load_models(&self, loader: &dyn ModelLoader) -> Result<(), ServiceError> {
        let start = Instant::now();
        info!("Loading models…");
        let models = loader.load_models().await.map_err(ServiceError::ModelLoad)?;
        let name = models.name().to_string();
        self.install_models(models)?;
        info!(
            "Models loaded ({}) in {}ms",
            name,
            start.elapsed().as_millis()
        );
        Ok(())
    }

    pub fn health(&self) -> HealthResponse {
        HealthResponse::new(self.models_loaded())
    }

    /// Reject filenames without the supported extension.
    pub fn check_filename(&self, filename: &str) -> Result<(), ServiceError> {
        if filename.ends_with(&self.config.supported_extension) {
            Ok(())
        } else {
            Err(ServiceError::UnsupportedFileType {
                filename: filename.to_string(),
            })
        }
    }

    /// Convert one uploaded document.
    ///
    /// # Errors
    /// - [`ServiceError::UnsupportedFileType`] before anything is staged
    /// - [`ServiceError::ModelsNotLoaded`] while startup is still running
    /// - [`ServiceError::Staging`], [`ServiceError::Conversion`],
    ///   [`ServiceError::Timeout`] for processing failures
    pub async fn convert_upload(
        &self,
        filename: &str,
        bytes: &[u8],
    ) -> Result<ConversionResponse, ServiceError> {
        self.check_filename(filename)?;
        let models = self.models.get().ok_or(ServiceError::ModelsNotLoaded)?;

        let staged = StagedUpload::write(
            &self.config.staging_dir,
            &self.config.supported_extension,
            bytes,
        )
        .await
        .map_err(|source| ServiceError::Staging { source })?;

        info!(
            "Converting '{}' ({} bytes) with {}",
            filename,
            bytes.len(),
            models.name()
        );
        let start = Instant::now();
        let timeout = self.config.processing_timeout();
        let outcome = tokio::time::timeout(
            timeout,
            models.convert(staged.path(), &self.config.convert_options),
        )
        .await;

        if let Err(e) = staged.close() {
            warn!("Failed to remove staged upload: {}", e);
        }

        let raw = match outcome {
            Ok(result) => result?,
            Err(_) => {
                return Err(ServiceError::Timeout {
                    secs: timeout.as_secs(),
                })
            }
        };
        debug!("{} images extracted and discarded", raw.images.len());

        let response = ConversionResponse::from(raw);
        info!(
            "Converted '{}': {} pages, {} chars in {}ms",
            filename,
            response.metadata.page_count,
            response.markdown_content.len(),
            start.elapsed().as_millis()
        );
        Ok(response)
    }
}
