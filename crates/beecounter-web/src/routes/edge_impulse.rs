//! Edge Impulse routes.
//!
//! Endpoints:
//! - `POST /api/edgeimpulse/settings` - store the API key (`ei-api-key`)
//! - `POST /api/edgeimpulse/upload` - upload every stored image (`ei-label`)
//! - `POST /api/edgeimpulse/download-model` - not supported

use axum::{
    extract::State,
    response::Json,
    routing::post,
    Form, Router,
};
use beecounter_core::DeviceError;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::routes::run_blocking;
use crate::session::ApiSession;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/edgeimpulse/settings", post(settings))
        .route("/api/edgeimpulse/upload", post(upload))
        .route("/api/edgeimpulse/download-model", post(download_model))
}

#[derive(Debug, Deserialize)]
pub struct SettingsForm {
    #[serde(rename = "ei-api-key")]
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UploadForm {
    #[serde(rename = "ei-label")]
    pub label: Option<String>,
}

async fn settings(
    _session: ApiSession,
    State(state): State<AppState>,
    Form(form): Form<SettingsForm>,
) -> ApiResult<Json<Value>> {
    let key = form.api_key.ok_or(ApiError::MissingParam("ei-api-key"))?;
    let device = state.device.clone();
    run_blocking(move || device.set_ei_api_key(&key)).await?;
    Ok(Json(json!({ "message": "API key saved." })))
}

async fn upload(
    _session: ApiSession,
    State(state): State<AppState>,
    Form(form): Form<UploadForm>,
) -> ApiResult<Json<Value>> {
    let label = form.label.ok_or(ApiError::MissingParam("ei-label"))?;
    // The task reports through ei_upload_status events.
    let _task = state.uploads.start(&label)?;
    Ok(Json(json!({ "message": "Upload process started." })))
}

async fn download_model(_session: ApiSession) -> ApiResult<Json<Value>> {
    Err(DeviceError::Unsupported("Model download is not supported".to_string()).into())
}
