//! Response bodies returned by the HTTP API.

use crate::backend::RawConversion;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// Language reported when the converter does not detect one.
pub const DEFAULT_LANGUAGE: &str = "en";

/// Body of a successful `POST /convert`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionResponse {
    pub success: bool,
    pub markdown_content: String,
    pub metadata: ResponseMetadata,
}

/// Metadata subset surfaced to clients, with defaults for missing keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub page_count: u64,
    pub language: String,
    /// Passed through as reported; integer or float.
    pub processing_time: Number,
}

impl From<RawConversion> for ConversionResponse {
    fn from(raw: RawConversion) -> Self {
        let meta = &raw.metadata;
        let metadata = ResponseMetadata {
            page_count: meta.get("page_count").and_then(as_count).unwrap_or(0),
            language: meta
                .get("language")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_LANGUAGE)
                .to_string(),
            processing_time: match meta.get("processing_time") {
                Some(Value::Number(n)) => n.clone(),
                _ => Number::from(0),
            },
        };

        Self {
            success: true,
            markdown_content: raw.text,
            metadata,
        }
    }
}

/// A non-negative integer, also when the converter reports it as `3.0`.
fn as_count(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
            .map(|f| f as u64)
    })
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub models_loaded: bool,
}

impl HealthResponse {
    pub fn new(models_loaded: bool) -> Self {
        Self {
            status: "healthy".to_string(),
            models_loaded,
        }
    }
}

/// Body of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}
