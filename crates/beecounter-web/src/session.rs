//! Session extractors.
//!
//! Handlers declare the access they need by taking one of these as an
//! argument; the check runs before the handler body.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
    response::Redirect,
};
use beecounter_core::DeviceError;

use crate::error::ApiError;
use crate::AppState;

pub fn cookie_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::COOKIE).and_then(|v| v.to_str().ok())
}

pub fn is_authenticated(headers: &HeaderMap, state: &AppState) -> bool {
    state.device.auth().is_authenticated(cookie_header(headers))
}

/// Valid session required; rejects with 401 JSON.
pub struct ApiSession;

#[async_trait]
impl FromRequestParts<AppState> for ApiSession {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if is_authenticated(&parts.headers, state) {
            Ok(ApiSession)
        } else {
            Err(DeviceError::AuthRequired.into())
        }
    }
}

/// Valid session required; rejects by redirecting to `/login`.
pub struct PageSession;

#[async_trait]
impl FromRequestParts<AppState> for PageSession {
    type Rejection = Redirect;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if is_authenticated(&parts.headers, state) {
            Ok(PageSession)
        } else {
            Err(Redirect::to("/login"))
        }
    }
}

/// Live-view access: open unless `protect_live_view` is set.
pub struct LiveView;

#[async_trait]
impl FromRequestParts<AppState> for LiveView {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if !state.device.config().protect_live_view || is_authenticated(&parts.headers, state) {
            Ok(LiveView)
        } else {
            Err(DeviceError::AuthRequired.into())
        }
    }
}
