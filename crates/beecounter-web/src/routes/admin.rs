//! Administration routes.
//!
//! Endpoints:
//! - `GET /admin` - settings page
//! - `POST /admin/changepass` - change password (current password required)
//! - `POST /admin/timezone` - POSIX TZ string
//! - `POST /admin/device-name`
//! - `GET /admin/error-log`, `POST /admin/error-log/clear`
//! - `POST /admin/reboot`
//! - `POST /factory-reset` - wipe preferences and restart

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Router,
};
use beecounter_core::auth::PasswordError;
use beecounter_core::DeviceError;
use serde::Deserialize;
use tracing::warn;

use crate::error::{ApiError, ApiResult};
use crate::routes::pages::{escape_html, page};
use crate::routes::run_blocking;
use crate::session::PageSession;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/admin", get(admin_page))
        .route("/admin/changepass", post(change_password))
        .route("/admin/timezone", post(set_timezone))
        .route("/admin/device-name", post(set_device_name))
        .route("/admin/error-log", get(error_log))
        .route("/admin/error-log/clear", post(clear_error_log))
        .route("/admin/reboot", post(reboot))
        .route("/factory-reset", post(factory_reset))
}

/// Flash messages carried in the redirect query.
#[derive(Debug, Default, Deserialize)]
pub struct AdminQuery {
    pub error: Option<String>,
    pub success: Option<String>,
    pub tz_success: Option<String>,
    pub tz_error: Option<String>,
    pub name_success: Option<String>,
    pub name_error: Option<String>,
}

impl AdminQuery {
    fn banner(&self) -> String {
        let (class, text) = if let Some(error) = &self.error {
            ("error", error.as_str())
        } else if self.success.is_some() {
            ("ok", "Password changed successfully.")
        } else if self.tz_success.is_some() {
            ("ok", "Timezone saved.")
        } else if self.tz_error.is_some() {
            ("error", "Invalid timezone.")
        } else if self.name_success.is_some() {
            ("ok", "Device name saved.")
        } else if self.name_error.is_some() {
            ("error", "Invalid device name.")
        } else {
            return String::new();
        };
        format!("<p class='{}'>{}</p>", class, escape_html(text))
    }
}

#[derive(Debug, Deserialize)]
pub struct AdminPasswordForm {
    pub current_password: Option<String>,
    pub new_password: Option<String>,
    pub confirm_password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TimezoneForm {
    pub timezone: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceNameForm {
    pub device_name: Option<String>,
}

async fn admin_page(
    _session: PageSession,
    State(state): State<AppState>,
    Query(query): Query<AdminQuery>,
) -> ApiResult<Response> {
    let device = &state.device;
    let name = escape_html(&device.device_name()?);
    let timezone = escape_html(&device.timezone()?);
    let ei_status = if device.ei_api_key()?.is_some() {
        "configured"
    } else {
        "not set"
    };
    let body = format!(
        "<h1>Admin</h1>{banner}\
<div class='card'><h2>Change Password</h2><form method='POST' action='/admin/changepass'>\
<p><input type='password' name='current_password' placeholder='Current password' required></p>\
<p><input type='password' name='new_password' placeholder='New password' required></p>\
<p><input type='password' name='confirm_password' placeholder='Confirm new password' required></p>\
<button>Change Password</button></form></div>\
<div class='card'><h2>Device</h2><form method='POST' action='/admin/device-name'>\
<p><input name='device_name' value='{name}' maxlength='32' required> <button>Save Name</button></p></form>\
<form method='POST' action='/admin/timezone'>\
<p><input name='timezone' value='{timezone}' required> <button>Save Timezone</button></p></form></div>\
<div class='card'><h2>Camera</h2><form onsubmit=\"event.preventDefault();fetch('/api/camera-settings',{{method:'POST',body:new URLSearchParams(new FormData(this))}})\">\
<p><input name='resolution' value='SVGA'> <input name='quality' type='number' min='0' max='63' value='12'> <button>Apply</button></p></form></div>\
<div class='card'><h2>Edge Impulse</h2><p>API key: {ei_status}</p>\
<form onsubmit=\"event.preventDefault();fetch('/api/edgeimpulse/settings',{{method:'POST',body:new URLSearchParams(new FormData(this))}})\">\
<p><input name='ei-api-key' placeholder='ei_...' required> <button>Save Key</button></p></form></div>\
<div class='card'><h2>Maintenance</h2><p><a href='/admin/error-log'>View error log</a></p>\
<form method='POST' action='/admin/reboot'><button>Reboot</button></form><br>\
<form method='POST' action='/factory-reset' onsubmit=\"return confirm('Erase all settings?')\"><button>Factory Reset</button></form></div>",
        banner = query.banner(),
    );
    Ok(page("Admin", &body, true).into_response())
}

async fn change_password(
    _session: PageSession,
    State(state): State<AppState>,
    Form(form): Form<AdminPasswordForm>,
) -> ApiResult<Redirect> {
    let device = state.device.clone();
    let result = run_blocking(move || {
        Ok(device.auth().change_admin_password(
            form.current_password.as_deref().unwrap_or_default(),
            form.new_password.as_deref().unwrap_or_default(),
            form.confirm_password.as_deref().unwrap_or_default(),
        ))
    })
    .await?;
    match result {
        Ok(()) => Ok(Redirect::to("/admin?success=1")),
        Err(e @ PasswordError::Prefs(_)) => Err(ApiError::from(DeviceError::from(e))),
        Err(e) => {
            warn!(error = %e, "admin password change rejected");
            Ok(Redirect::to(&format!("/admin?error={}", urlencoding::encode(&e.to_string()))))
        }
    }
}

async fn set_timezone(
    _session: PageSession,
    State(state): State<AppState>,
    Form(form): Form<TimezoneForm>,
) -> ApiResult<Redirect> {
    let device = state.device.clone();
    let tz = form.timezone.unwrap_or_default();
    match run_blocking(move || Ok(device.set_timezone(&tz))).await? {
        Ok(()) => Ok(Redirect::to("/admin?tz_success=1")),
        Err(e) => {
            warn!(error = %e, "timezone rejected");
            Ok(Redirect::to("/admin?tz_error=1"))
        }
    }
}

async fn set_device_name(
    _session: PageSession,
    State(state): State<AppState>,
    Form(form): Form<DeviceNameForm>,
) -> ApiResult<Redirect> {
    let device = state.device.clone();
    let name = form.device_name.unwrap_or_default();
    match run_blocking(move || Ok(device.set_device_name(&name))).await? {
        Ok(()) => Ok(Redirect::to("/admin?name_success=1")),
        Err(e) => {
            warn!(error = %e, "device name rejected");
            Ok(Redirect::to("/admin?name_error=1"))
        }
    }
}

async fn error_log(_session: PageSession, State(state): State<AppState>) -> ApiResult<Response> {
    let device = state.device.clone();
    let contents = run_blocking(move || Ok(device.error_log().contents()?)).await?;
    let body = if contents.is_empty() {
        "<p>No errors logged.</p>".to_string()
    } else {
        format!("<pre style='text-align:left'>{}</pre>", escape_html(&contents))
    };
    let body = format!(
        "<h1>Error Log</h1><div class='card'>{body}</div>\
<form method='POST' action='/admin/error-log/clear'><button>Clear Log</button></form>"
    );
    Ok(page("Error Log", &body, true).into_response())
}

async fn clear_error_log(_session: PageSession, State(state): State<AppState>) -> ApiResult<Redirect> {
    let device = state.device.clone();
    run_blocking(move || Ok(device.error_log().clear()?)).await?;
    Ok(Redirect::to("/admin/error-log"))
}

async fn reboot(_session: PageSession, State(state): State<AppState>) -> Response {
    state.device.reboot();
    page(
        "Rebooting...",
        "<h1>Rebooting...</h1><meta http-equiv='refresh' content='5;url=/' />",
        false,
    )
    .into_response()
}

async fn factory_reset(_session: PageSession, State(state): State<AppState>) -> ApiResult<Response> {
    let device = state.device.clone();
    run_blocking(move || device.factory_reset()).await?;
    Ok(page(
        "Resetting...",
        "<h1>Factory Reset Successful</h1><p>Device is restarting with default settings...</p>",
        false,
    )
    .into_response())
}
