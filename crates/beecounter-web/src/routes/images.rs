//! Stored image routes.
//!
//! Endpoints:
//! - `GET /api/images` - list stored captures
//! - `GET /images?serve=<name>` - download one
//! - `GET /images?delete=<name>` - delete one

use axum::{
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use beecounter_core::storage::{StoredImage, IMAGE_URL_PREFIX};
use serde::Deserialize;
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::routes::run_blocking;
use crate::session::ApiSession;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/images", get(list))
        .route("/images", get(image))
}

#[derive(Debug, Deserialize)]
pub struct ImageParams {
    pub serve: Option<String>,
    pub delete: Option<String>,
}

async fn list(_session: ApiSession, State(state): State<AppState>) -> ApiResult<Json<Vec<StoredImage>>> {
    let device = state.device.clone();
    Ok(Json(run_blocking(move || device.list_images()).await?))
}

async fn image(
    _session: ApiSession,
    State(state): State<AppState>,
    Query(params): Query<ImageParams>,
) -> ApiResult<Response> {
    let device = state.device.clone();
    match (params.delete, params.serve) {
        (Some(name), _) => {
            let deleted = name.clone();
            run_blocking(move || device.delete_image(&name)).await?;
            Ok(Json(json!({ "message": format!("Deleted: {}{}", IMAGE_URL_PREFIX, deleted) })).into_response())
        }
        (None, Some(name)) => {
            let jpeg = run_blocking(move || device.read_image(&name)).await?;
            Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response())
        }
        (None, None) => Err(ApiError::MissingParam("serve or delete")),
    }
}
