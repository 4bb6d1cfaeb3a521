//! HTTP route handlers.
//!
//! Routes are grouped by concern, each submodule exposing `routes()`.

pub mod admin;
pub mod auth;
pub mod camera;
pub mod collection;
pub mod edge_impulse;
pub mod events;
pub mod images;
pub mod pages;

use axum::Router;
use beecounter_core::DeviceError;
use tower_http::trace::TraceLayer;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// Create the main Axum router with all routes.
///
/// Routes are organized as:
/// - `/`, `/login`, `/changepass`, `/logout` - pages and session handling
/// - `/capture`, `/stream`, `/status`, `/control` - live view
/// - `/api/...` - JSON API used by the pages
/// - `/images` - stored capture access
/// - `/admin/...`, `/factory-reset` - administration
/// - `/events` - Server-Sent Events
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(pages::routes())
        .merge(auth::routes())
        .merge(camera::routes())
        .merge(collection::routes())
        .merge(images::routes())
        .merge(edge_impulse::routes())
        .merge(admin::routes())
        .merge(events::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run device work that touches the filesystem or the encoder off the
/// async workers.
pub(crate) async fn run_blocking<T, F>(work: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DeviceError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::Internal(format!("blocking task failed: {}", e)))?
        .map_err(ApiError::from)
}
