// HTTP control API

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConfigError, ConfigUpdate, ConfigView};
use crate::recording::registry::{CameraOutcome, ElapsedSnapshot, SyncOutcome};
use crate::recording::{LaunchError, SessionStatus, StartRequest, SupervisorError, SupervisorRegistry};
use crate::session::RecordingSummary;
use crate::video::{self, VideoError};

/// Shared state for the API handlers
pub struct AppState {
    pub registry: Arc<SupervisorRegistry>,
    pub config: RwLock<Config>,
    /// Where `PUT /api/config` persists changes
    pub config_path: PathBuf,
    /// Client for camera preview streams
    pub http: reqwest::Client,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/recordings/start", post(start_recording))
        .route("/api/recordings/start-all", post(start_all_recordings))
        .route("/api/recordings/stop", post(stop_recording))
        .route("/api/recordings/stop-all", post(stop_all_recordings))
        .route("/api/recordings/pause-all", post(pause_all_recordings))
        .route("/api/recordings/resume-all", post(resume_all_recordings))
        .route("/api/recordings/status", get(get_status))
        .route("/api/recordings/elapsed", get(get_elapsed))
        .route("/api/recordings/history", get(get_history))
        .route("/api/recordings/{camera_id}/pause", post(pause_recording))
        .route("/api/recordings/{camera_id}/resume", post(resume_recording))
        .route("/api/recordings/{camera_id}/sync", post(sync_recording))
        .route("/api/foreground", post(foreground))
        .route("/api/config", get(get_config).put(update_config))
        .route("/api/cameras/{camera_id}/frame", get(get_frame))
        .with_state(state)
}

/// Serve the API until `shutdown` fires
pub async fn serve(
    state: Arc<AppState>,
    bind: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", bind, e))?;
    log::info!("[Http] Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

/// Error response: `{ "error": message }` with a matching status code
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        let status = match &e {
            SupervisorError::Launch {
                source: LaunchError::AlreadyActive { .. },
                ..
            } => StatusCode::CONFLICT,
            SupervisorError::InvalidTransition { .. } => StatusCode::CONFLICT,
            SupervisorError::NotFound(_) => StatusCode::NOT_FOUND,
            SupervisorError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            SupervisorError::Launch { .. }
            | SupervisorError::StopFailed { .. }
            | SupervisorError::ReconnectExhausted { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<ConfigError> for ApiError {
    fn from(e: ConfigError) -> Self {
        Self::bad_request(e.to_string())
    }
}

impl From<VideoError> for ApiError {
    fn from(e: VideoError) -> Self {
        let status = match &e {
            VideoError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, e.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            log::error!("[Http] {}: {}", self.status, self.message);
        }
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ============================================================================
// Recording Commands
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    pub camera_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResponse {
    pub camera_id: String,
    pub stopped: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub camera_id: String,
    pub outcome: SyncOutcome,
    pub status: Option<SessionStatus>,
}

fn validate_start(request: &StartRequest) -> Result<(), ApiError> {
    if request.camera_id.trim().is_empty() {
        return Err(ApiError::bad_request("cameraId is required"));
    }
    if request.source_url.trim().is_empty() {
        return Err(ApiError::bad_request("sourceUrl is required"));
    }
    Ok(())
}

async fn start_recording(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartRequest>,
) -> ApiResult<SessionStatus> {
    validate_start(&request)?;
    Ok(Json(state.registry.start(request).await?))
}

async fn start_all_recordings(
    State(state): State<Arc<AppState>>,
    Json(requests): Json<Vec<StartRequest>>,
) -> ApiResult<Vec<CameraOutcome>> {
    for request in &requests {
        validate_start(request)?;
    }
    Ok(Json(state.registry.start_all(requests).await))
}

async fn stop_recording(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StopRequest>,
) -> ApiResult<StopResponse> {
    state.registry.stop(&request.camera_id).await?;
    Ok(Json(StopResponse {
        camera_id: request.camera_id,
        stopped: true,
    }))
}

async fn stop_all_recordings(State(state): State<Arc<AppState>>) -> Json<Vec<CameraOutcome>> {
    Json(state.registry.stop_all().await)
}

async fn pause_all_recordings(State(state): State<Arc<AppState>>) -> Json<Vec<CameraOutcome>> {
    Json(state.registry.pause_all().await)
}

async fn resume_all_recordings(State(state): State<Arc<AppState>>) -> Json<Vec<CameraOutcome>> {
    Json(state.registry.resume_all().await)
}

async fn pause_recording(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
) -> ApiResult<SessionStatus> {
    state.registry.pause(&camera_id).await?;
    current_status(&state, &camera_id)
}

async fn resume_recording(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
) -> ApiResult<SessionStatus> {
    state.registry.resume(&camera_id).await?;
    current_status(&state, &camera_id)
}

fn current_status(state: &AppState, camera_id: &str) -> ApiResult<SessionStatus> {
    state
        .registry
        .status_of(camera_id)
        .map(Json)
        .ok_or_else(|| SupervisorError::NotFound(camera_id.to_string()).into())
}

async fn sync_recording(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
) -> Json<SyncResponse> {
    let outcome = state.registry.sync_from_backend(&camera_id).await;
    Json(SyncResponse {
        status: state.registry.status_of(&camera_id),
        camera_id,
        outcome,
    })
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<Vec<SessionStatus>> {
    Json(state.registry.status())
}

async fn get_elapsed(State(state): State<Arc<AppState>>) -> Json<ElapsedSnapshot> {
    Json(state.registry.elapsed())
}

async fn foreground(State(state): State<Arc<AppState>>) -> Json<ElapsedSnapshot> {
    Json(state.registry.on_foreground().await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub camera_id: Option<String>,
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    50
}

async fn get_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<RecordingSummary>> {
    let limit = query.limit.clamp(1, 1000);
    Ok(Json(state.registry.history(query.camera_id.as_deref(), limit)?))
}

// ============================================================================
// Config Commands
// ============================================================================

async fn get_config(State(state): State<Arc<AppState>>) -> Json<ConfigView> {
    Json(state.config.read().view())
}

async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(update): Json<ConfigUpdate>,
) -> ApiResult<ConfigView> {
    let updated = {
        let mut config = state.config.write();
        config.apply(&update)?;
        config.clone()
    };

    state.registry.update_config(updated.supervisor.clone());
    if let Err(e) = updated.save(&state.config_path) {
        log::warn!("[Http] Config applied but not saved: {}", e);
    }
    Ok(Json(updated.view()))
}

// ============================================================================
// Preview Commands
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct FrameQuery {
    /// Stream address for cameras that are not recording
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameResponse {
    pub camera_id: String,
    pub media_type: &'static str,
    pub data_base64: String,
    pub size_bytes: usize,
    pub sequence: u64,
}

/// One frame of a camera's live stream
async fn get_frame(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
    Query(query): Query<FrameQuery>,
) -> ApiResult<FrameResponse> {
    let url = query
        .url
        .or_else(|| state.registry.source_url(&camera_id))
        .ok_or_else(|| ApiError::from(SupervisorError::NotFound(camera_id.clone())))?;

    let (options, timeout) = {
        let config = state.config.read();
        (config.stream.demux_options(), config.stream.frame_timeout())
    };

    let frame = video::grab_frame(&state.http, &url, options, timeout).await?;
    Ok(Json(FrameResponse {
        camera_id,
        media_type: frame.media_type.as_str(),
        data_base64: base64::engine::general_purpose::STANDARD.encode(&frame.data),
        size_bytes: frame.len(),
        sequence: frame.sequence,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::SessionState;

    fn status_of(e: impl Into<ApiError>) -> StatusCode {
        e.into().status
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_of(SupervisorError::Launch {
                camera_id: "a".into(),
                source: LaunchError::AlreadyActive {
                    camera_id: "a".into(),
                    state: SessionState::Recording,
                },
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(SupervisorError::InvalidTransition {
                camera_id: "a".into(),
                state: SessionState::Idle,
                action: "pause",
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(status_of(SupervisorError::NotFound("a".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(SupervisorError::Launch {
                camera_id: "a".into(),
                source: LaunchError::Spawn(std::io::Error::new(std::io::ErrorKind::NotFound, "ffmpeg")),
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(SupervisorError::StopFailed {
                camera_id: "a".into(),
                reason: "stuck".into(),
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(VideoError::Timeout(std::time::Duration::from_secs(1))),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_start_validation() {
        let mut request = StartRequest {
            camera_id: "cam".into(),
            camera_name: "Cam".into(),
            source_url: " ".into(),
            scenario_id: None,
            scenario_name: None,
        };
        assert!(validate_start(&request).is_err());
        request.source_url = "http://cam/stream".into();
        assert!(validate_start(&request).is_ok());
    }
}
