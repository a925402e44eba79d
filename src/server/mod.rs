//! HTTP server for CAPTCHA prediction.

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerSettings;
use crate::recognition::{ImageInput, PredictionError, PredictionService};

/// Multipart overhead allowed on top of the image size limit
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

/// Application state shared across handlers
pub struct AppState {
    service: Arc<PredictionService>,
    timeout: Duration,
}

impl AppState {
    pub fn new(service: Arc<PredictionService>, timeout: Duration) -> Self {
        Self { service, timeout }
    }
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    model_loaded: bool,
}

/// Successful prediction
#[derive(Serialize)]
struct PredictResponse {
    prediction: String,
    /// Forward pass time in milliseconds, two decimals
    inference_time: f64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Build the router
pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.service.rules().max_bytes as usize + MULTIPART_OVERHEAD;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/health", get(health_handler))
        .route("/predict", post(predict_handler))
        .route("/api/predict", post(predict_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server
pub async fn run_server(state: Arc<AppState>, settings: &ServerSettings) -> anyhow::Result<()> {
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid address: {}", e))?;

    info!("Server listening on http://{}", addr);
    info!("Endpoints:");
    info!("  GET  /api/health  - Health check");
    info!("  POST /api/predict - CAPTCHA prediction (multipart field 'image')");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Health check endpoint
async fn health_handler(State(_state): State<Arc<AppState>>) -> Json<HealthResponse> {
    // State only exists once the model has loaded
    Json(HealthResponse {
        status: "healthy",
        model_loaded: true,
    })
}

/// Prediction endpoint
async fn predict_handler(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();

    let mut upload = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() != Some("image") {
                    continue;
                }
                let file_name = field.file_name().unwrap_or_default().to_string();
                match field.bytes().await {
                    Ok(bytes) => {
                        upload = Some((file_name, bytes.to_vec()));
                        break;
                    }
                    Err(e) => {
                        warn!(request_id = %request_id, error = %e, "Failed to read upload");
                        return error_response(StatusCode::BAD_REQUEST, e.body_text());
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "Malformed multipart request");
                return error_response(StatusCode::BAD_REQUEST, e.body_text());
            }
        }
    }

    let Some((file_name, data)) = upload else {
        return error_response(StatusCode::BAD_REQUEST, "No image file provided");
    };

    if file_name.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "No file selected");
    }

    if let Err(e) = state.service.rules().check_extension(&file_name) {
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }

    info!(request_id = %request_id, file = %file_name, bytes = data.len(), "Processing prediction request");

    let service = state.service.clone();
    let input = ImageInput::from_bytes(file_name, data);
    let task = tokio::task::spawn_blocking(move || service.predict(&input));

    let result = match tokio::time::timeout(state.timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => {
            error!(request_id = %request_id, error = %join_error, "Prediction task failed");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal server error: {}", join_error),
            );
        }
        Err(_) => {
            error!(request_id = %request_id, timeout = ?state.timeout, "Prediction timed out");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal server error: prediction timed out after {:?}", state.timeout),
            );
        }
    };

    match result {
        Ok(prediction) => {
            info!(
                request_id = %request_id,
                prediction = %prediction.text,
                inference_ms = prediction.latency_ms,
                "Prediction completed"
            );
            (
                StatusCode::OK,
                Json(PredictResponse {
                    prediction: prediction.text,
                    inference_time: round_ms(prediction.latency_ms),
                }),
            )
                .into_response()
        }
        Err(e) => prediction_error_response(&request_id, e),
    }
}

fn prediction_error_response(request_id: &str, err: PredictionError) -> Response {
    if err.is_client_error() {
        warn!(request_id = %request_id, stage = err.stage(), error = %err, "Rejected input");
        error_response(StatusCode::BAD_REQUEST, err.to_string())
    } else {
        error!(request_id = %request_id, stage = err.stage(), error = %err, "Prediction failed");
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {}", err),
        )
    }
}

fn round_ms(ms: f64) -> f64 {
    (ms * 100.0).round() / 100.0
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
