//! HTTP surface: router, error mapping and the serve/startup sequence.
//!
//! ```text
//! POST /convert   multipart upload (field `file`) → ConversionResponse
//! GET  /health    → HealthResponse
//! ```
//!
//! [`run`] binds nothing itself; it takes an already bound listener so tests
//! can use an ephemeral port. It starts serving first and then loads the
//! models, so `/health` answers `models_loaded: false` during startup.

mod handlers;

use crate::backend::ModelLoader;
use crate::convert::ConversionService;
use crate::error::ServiceError;
use crate::output::ErrorBody;
use axum::extract::DefaultBodyLimit;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub use handlers::{convert_pdf, health_check};

/// Room left in the body limit for multipart boundaries and part headers.
/// The file itself is held to `max_upload_bytes` by the handler.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// State shared by all handlers.
pub type AppState = Arc<ConversionService>;

/// Build the API router.
pub fn build_router(service: AppState) -> Router {
    let body_limit = service
        .config()
        .max_upload_bytes()
        .saturating_add(MULTIPART_OVERHEAD);
    Router::new()
        .route("/convert", post(convert_pdf))
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request rejected ({}): {}", status.as_u16(), self);
        }
        (
            status,
            Json(ErrorBody {
                detail: self.detail(),
            }),
        )
            .into_response()
    }
}

/// Serve on `listener`, load the models, and keep serving until `shutdown`.
///
/// A model-load failure is fatal: the server task is stopped and the error
/// returned.
pub async fn run<F>(
    listener: TcpListener,
    service: AppState,
    loader: Arc<dyn ModelLoader>,
    shutdown: F,
) -> Result<(), ServiceError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    info!("Listening on {}", addr);

    let app = build_router(Arc::clone(&service));
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
    });

    if let Err(e) = service.load_models(loader.as_ref()).await {
        error!("{}", e);
        server.abort();
        return Err(e);
    }

    match server.await {
        Ok(Ok(())) => {
            info!("Server stopped");
            Ok(())
        }
        Ok(Err(source)) => Err(ServiceError::Server { addr, source }),
        Err(join) => Err(ServiceError::Server {
            addr,
            source: std::io::Error::other(join.to_string()),
        }),
    }
}
