//! Collection and manual capture routes.
//!
//! Endpoints:
//! - `POST /api/capture/start` - start the automated collection job
//! - `POST /api/capture/stop` - stop it, keeping the count
//! - `POST /api/capture/photo` - take and store one photo
//! - `GET /api/collection` - job progress and storage usage

use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};

use crate::error::ApiResult;
use crate::routes::run_blocking;
use crate::session::ApiSession;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/capture/start", post(start))
        .route("/api/capture/stop", post(stop))
        .route("/api/capture/photo", post(photo))
        .route("/api/collection", get(collection))
}

async fn start(_session: ApiSession, State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let started = state.device.start_collection()?;
    Ok(Json(json!({
        "message": "Data collection started.",
        "changed": started,
        "collection": state.device.collection()?,
    })))
}

async fn stop(_session: ApiSession, State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let stopped = state.device.stop_collection()?;
    Ok(Json(json!({
        "message": "Data collection stopped.",
        "changed": stopped,
        "collection": state.device.collection()?,
    })))
}

async fn photo(_session: ApiSession, State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let device = state.device.clone();
    let image = run_blocking(move || device.capture_photo()).await?;
    Ok(Json(json!({
        "message": format!("Photo captured and saved as {}", image.path),
        "image": image,
    })))
}

async fn collection(_session: ApiSession, State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let device = state.device.clone();
    let usage = run_blocking(move || device.storage_usage()).await?;
    Ok(Json(json!({
        "collection": state.device.collection()?,
        "storage": usage,
    })))
}
