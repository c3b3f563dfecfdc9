//! The boundary to the external PDF-to-Markdown converter.
//!
//! The service consumes the converter through exactly two operations:
//!
//! ```text
//! ModelLoader::load_models()                 -> ModelBundle      (once, at startup)
//! ModelBundle::convert(path, &ConvertOptions) -> RawConversion   (per request)
//! ```
//!
//! Layout analysis, OCR and inference happen on the far side of these traits.
//! [`marker`] provides the production implementation, which keeps one Marker
//! worker process running with its models in memory; tests plug in their own
//! stubs.

pub mod marker;

use crate::config::ConvertOptions;
use crate::error::BackendError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;

pub use marker::{MarkerWorker, MarkerWorkerLoader};

/// Loads the converter's models. Called once, before any conversion.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load_models(&self) -> Result<Arc<dyn ModelBundle>, BackendError>;
}

/// A loaded set of models, shared read-only by every request.
///
/// Implementations must tolerate concurrent `convert` calls; the service adds
/// no locking or queuing of its own.
#[async_trait]
pub trait ModelBundle: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str {
        "converter"
    }

    /// Convert the PDF at `pdf_path`.
    ///
    /// The future may be dropped before completion when the processing timeout
    /// fires; implementations must stay usable for later calls in that case.
    async fn convert(
        &self,
        pdf_path: &Path,
        options: &ConvertOptions,
    ) -> Result<RawConversion, BackendError>;
}

/// What the converter hands back for one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawConversion {
    /// Extracted Markdown.
    pub text: String,
    /// Names of the images the converter extracted. Not part of the response.
    pub images: Vec<String>,
    /// Converter metadata, e.g. `page_count`, `language`, `processing_time`.
    pub metadata: Map<String, Value>,
}

impl RawConversion {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
