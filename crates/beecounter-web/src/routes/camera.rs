//! Live view and camera control routes.
//!
//! Endpoints:
//! - `GET /capture` - one JPEG frame
//! - `GET /stream` - multipart JPEG stream, or one no-cache frame in polling mode
//! - `GET /status` - sensor settings as JSON
//! - `GET|POST /control?var=&val=` - write one sensor setting
//! - `POST /api/camera-settings` - persist and apply resolution + quality
//! - `POST /api/set-refresh-rate` - performance update interval
//! - `GET /api/statistics` - live-view statistics

use axum::{
    extract::{Query, State},
    response::{Json, Response},
    routing::{get, post},
    Form, Router,
};
use beecounter_core::capture::FrameSent;
use beecounter_core::{CameraError, CameraReport, DeviceError, StreamMode, StreamOutcome};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::routes::run_blocking;
use crate::session::{ApiSession, LiveView};
use crate::statistics::StreamStatistics;
use crate::transport::blocking_response;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/capture", get(capture))
        .route("/stream", get(stream))
        .route("/status", get(status))
        .route("/control", get(control_query).post(control_form))
        .route("/api/camera-settings", post(camera_settings))
        .route("/api/set-refresh-rate", post(set_refresh_rate))
        .route("/api/statistics", get(statistics))
}

#[derive(Debug, Deserialize)]
pub struct ControlParams {
    pub var: Option<String>,
    pub val: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CameraSettingsForm {
    pub resolution: Option<String>,
    pub quality: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRateForm {
    pub rate: Option<String>,
}

async fn capture(_access: LiveView, State(state): State<AppState>) -> Response {
    let device = state.device.clone();
    let statistics = state.statistics.clone();
    blocking_response(move |sink| {
        let bytes = device.capture(sink)?;
        statistics.record_capture(bytes);
        Ok(())
    })
    .await
}

async fn stream(_access: LiveView, State(state): State<AppState>) -> Response {
    let device = state.device.clone();
    let statistics = state.statistics.clone();
    blocking_response(move |sink| {
        let multipart = device.config().stream_mode == StreamMode::Multipart;
        if multipart {
            statistics.stream_opened();
        }
        let outcome = device.stream(sink, &mut |frame: FrameSent| statistics.record_frame(&frame));
        if multipart {
            statistics.stream_closed();
        }
        match outcome? {
            StreamOutcome::Frame(bytes) => statistics.record_capture(bytes),
            StreamOutcome::Stream(report) => {
                info!(frames = report.frames, end = ?report.end, "stream closed");
            }
        }
        Ok(())
    })
    .await
}

async fn status(_access: LiveView, State(state): State<AppState>) -> Json<CameraReport> {
    Json(state.device.camera_report())
}

fn apply_control(state: &AppState, params: ControlParams) -> ApiResult<Json<Value>> {
    let var = params.var.ok_or(ApiError::MissingParam("var"))?;
    let val = params.val.ok_or(ApiError::MissingParam("val"))?;
    state.device.apply_control(&var, &val)?;
    Ok(Json(json!({ "var": var, "val": val })))
}

async fn control_query(
    _session: ApiSession,
    State(state): State<AppState>,
    Query(params): Query<ControlParams>,
) -> ApiResult<Json<Value>> {
    apply_control(&state, params)
}

async fn control_form(
    _session: ApiSession,
    State(state): State<AppState>,
    Form(params): Form<ControlParams>,
) -> ApiResult<Json<Value>> {
    apply_control(&state, params)
}

async fn camera_settings(
    _session: ApiSession,
    State(state): State<AppState>,
    Form(form): Form<CameraSettingsForm>,
) -> ApiResult<Json<Value>> {
    if !state.device.camera_initialized() {
        return Err(DeviceError::Camera(CameraError::NotInitialized).into());
    }
    let resolution = form.resolution.ok_or(ApiError::MissingParam("resolution"))?;
    let quality = form.quality.ok_or(ApiError::MissingParam("quality"))?;
    let device = state.device.clone();
    let requested_quality = quality.clone();
    let size = run_blocking(move || device.apply_camera_settings(&resolution, &requested_quality)).await?;
    let (width, height) = size.dimensions();
    Ok(Json(json!({
        "resolution": size.name(),
        "quality": quality.trim(),
        "width": width,
        "height": height,
    })))
}

async fn set_refresh_rate(
    _session: ApiSession,
    State(state): State<AppState>,
    Form(form): Form<RefreshRateForm>,
) -> ApiResult<Json<Value>> {
    let raw = form.rate.ok_or(ApiError::MissingParam("rate"))?;
    let rate: u64 = raw
        .trim()
        .parse()
        .map_err(|_| DeviceError::Validation("rate must be an integer".to_string()))?;
    state.device.refresh_rate().set(rate)?;
    info!(rate_ms = rate, "performance refresh rate changed");
    Ok(Json(json!({ "rate": rate })))
}

async fn statistics(_session: ApiSession, State(state): State<AppState>) -> Json<StreamStatistics> {
    Json(state.statistics.snapshot(state.events.client_count()))
}
