use anyhow::Context;
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::capture::{CaptureBackendKind, CaptureError};
use crate::config::Config;
use crate::session::{CameraSession, SessionPhase};
use crate::stream::{MjpegStreamer, STREAM_CONTENT_TYPE};

/// Web server state
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    session: Arc<CameraSession>,
    streamer: Arc<MjpegStreamer>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        session: Arc<CameraSession>,
        streamer: Arc<MjpegStreamer>,
    ) -> Self {
        Self {
            config,
            session,
            streamer,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/video_feed", get(video_feed_handler))
        .route("/camera_info", get(camera_info_handler))
        .route("/switch_camera", get(switch_camera_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn run_server<F>(addr: &str, app: Router, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Starting web server on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Web server failed")?;

    info!("Web server stopped");
    Ok(())
}

/// `opencv_device` is a bare index unless a device path was configured
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GenericDevice {
    Index(usize),
    Path(String),
}

struct DeviceReport {
    camera_source: CaptureBackendKind,
    opencv_device: Option<GenericDevice>,
    libcamera_device: Option<String>,
    opencv_available: bool,
    libcamera_available: bool,
}

impl DeviceReport {
    fn collect(state: &AppState) -> Self {
        let status = state.session.status();
        let opencv_available = status.active == Some(CaptureBackendKind::GenericDevice);
        let libcamera_available = status.active == Some(CaptureBackendKind::ModuleCamera);
        let camera = &state.config.camera;

        Self {
            camera_source: status.requested,
            opencv_device: opencv_available.then(|| match &camera.opencv_path {
                Some(path) => GenericDevice::Path(path.clone()),
                None => GenericDevice::Index(camera.opencv_device),
            }),
            libcamera_device: libcamera_available.then(|| camera.libcamera_device.clone()),
            opencv_available,
            libcamera_available,
        }
    }
}

#[derive(Serialize)]
struct IndexResponse {
    message: &'static str,
    camera_source: CaptureBackendKind,
    opencv_device: Option<GenericDevice>,
    libcamera_device: Option<String>,
}

async fn index_handler(State(state): State<AppState>) -> Json<IndexResponse> {
    let report = DeviceReport::collect(&state);
    Json(IndexResponse {
        message: "Camera streaming server is running.",
        camera_source: report.camera_source,
        opencv_device: report.opencv_device,
        libcamera_device: report.libcamera_device,
    })
}

async fn video_feed_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = Body::from_stream(state.streamer.subscribe());
    (
        [
            (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
        ],
        body,
    )
}

#[derive(Serialize)]
struct CameraInfoResponse {
    camera_source: CaptureBackendKind,
    opencv_device: Option<GenericDevice>,
    libcamera_device: Option<String>,
    opencv_available: bool,
    libcamera_available: bool,
}

async fn camera_info_handler(State(state): State<AppState>) -> Json<CameraInfoResponse> {
    let report = DeviceReport::collect(&state);
    Json(CameraInfoResponse {
        camera_source: report.camera_source,
        opencv_device: report.opencv_device,
        libcamera_device: report.libcamera_device,
        opencv_available: report.opencv_available,
        libcamera_available: report.libcamera_available,
    })
}

#[derive(Debug, Deserialize)]
struct SwitchParams {
    source: Option<String>,
}

#[derive(Serialize)]
struct SwitchResponse {
    message: String,
    success: bool,
    camera_source: CaptureBackendKind,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

async fn switch_camera_handler(
    State(state): State<AppState>,
    Query(params): Query<SwitchParams>,
) -> Response {
    let Some(source) = params.source else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "missing 'source' query parameter, expected 'opencv' or 'libcamera'".to_string(),
        );
    };

    // Opening and closing devices blocks
    let session = Arc::clone(&state.session);
    let requested = source.clone();
    let result = match tokio::task::spawn_blocking(move || session.switch(&requested)).await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Camera switch task failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    let camera_source = state.session.status().requested;
    let (status, message, success) = match result {
        Ok(true) => (
            StatusCode::OK,
            format!("Switched to {}", camera_source),
            true,
        ),
        Ok(false) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Camera session is shutting down".to_string(),
            false,
        ),
        Err(e @ CaptureError::InvalidBackend(_)) => {
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Failed to switch to {}: {}", source.trim(), e),
            false,
        ),
    };

    (
        status,
        Json(SwitchResponse {
            message,
            success,
            camera_source,
        }),
    )
        .into_response()
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    camera: SessionPhase,
    active_streams: usize,
    frames_sent: u64,
    frames_skipped: u64,
}

/// Health check handler
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.streamer.stats();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        camera: state.session.status().phase,
        active_streams: stats.active_streams,
        frames_sent: stats.frames_sent,
        frames_skipped: stats.frames_skipped,
    })
}
