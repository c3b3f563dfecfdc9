//! Request handlers.

use super::AppState;
use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::output::{ConversionResponse, HealthResponse};
use axum::extract::multipart::{Multipart, MultipartError, MultipartRejection};
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

/// Form field carrying the PDF.
const FILE_FIELD: &str = "file";

/// `GET /health`
pub async fn health_check(State(service): State<AppState>) -> Json<HealthResponse> {
    Json(service.health())
}

/// `POST /convert`
///
/// ```bash
/// curl -X POST http://localhost:8000/convert -F "file=@document.pdf"
/// ```
pub async fn convert_pdf(
    State(service): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ConversionResponse>, ServiceError> {
    let mut multipart = multipart.map_err(|e| ServiceError::MalformedUpload {
        detail: e.body_text(),
    })?;
    let (filename, bytes) = read_file_field(&mut multipart, service.config()).await?;
    let response = service.convert_upload(&filename, &bytes).await?;
    Ok(Json(response))
}

/// Find the `file` field and return its filename and contents.
///
/// The filename is checked by the service; a missing one becomes `""` and is
/// rejected there like any other unsupported name. Contents longer than
/// `max_upload_bytes` are rejected as soon as the limit is crossed.
async fn read_file_field(
    multipart: &mut Multipart,
    config: &ServiceConfig,
) -> Result<(String, Vec<u8>), ServiceError> {
    let limit_mb = config.max_file_size_mb;
    let limit_bytes = config.max_upload_bytes();
    let upload_error = |e: MultipartError| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ServiceError::PayloadTooLarge { limit_mb }
        } else {
            ServiceError::MalformedUpload {
                detail: e.body_text(),
            }
        }
    };

    while let Some(mut field) = multipart.next_field().await.map_err(upload_error)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();

        let mut data = Vec::new();
        while let Some(chunk) = field.chunk().await.map_err(upload_error)? {
            if data.len() + chunk.len() > limit_bytes {
                return Err(ServiceError::PayloadTooLarge { limit_mb });
            }
            data.extend_from_slice(&chunk);
        }
        return Ok((filename, data));
    }

    Err(ServiceError::MissingFile)
}
