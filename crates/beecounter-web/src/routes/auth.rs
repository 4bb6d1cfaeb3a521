//! Authentication routes.
//!
//! Endpoints:
//! - `GET /login`, `POST /login` - login form and credential check
//! - `GET /changepass`, `POST /changepass` - first-run password change
//! - `GET /logout` - end the session

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Form, Router,
};
use beecounter_core::auth::{LoginError, PasswordError};
use serde::Deserialize;
use tracing::debug;

use crate::error::{ApiError, ApiResult};
use crate::routes::pages::{escape_html, page};
use crate::routes::run_blocking;
use crate::session::{cookie_header, PageSession};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/login", get(login_page).post(do_login))
        .route("/changepass", get(change_password_page).post(do_change_password))
        .route("/logout", get(logout))
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordForm {
    pub new_password: Option<String>,
    pub confirm_password: Option<String>,
}

fn login_form(message: Option<&str>) -> String {
    let message = message
        .map(|m| format!("<p class='error'>{}</p>", escape_html(m)))
        .unwrap_or_default();
    format!(
        "<div class='card'><h2>BeeCounter Login</h2>{message}\
<form method='POST' action='/login'>\
<p><label>Username<br><input type='text' name='username' required></label></p>\
<p><label>Password<br><input type='password' name='password' required></label></p>\
<button type='submit'>Login</button></form></div>"
    )
}

fn change_password_form(message: Option<&str>) -> String {
    let message = message
        .map(|m| format!("<p class='error'>{}</p>", escape_html(m)))
        .unwrap_or_default();
    format!(
        "<div class='card'><h2>Set Admin Password</h2>{message}\
<p>At least 8 characters with an uppercase letter, a lowercase letter, a number and a symbol.</p>\
<form method='POST' action='/changepass'>\
<p><label>New Password<br><input type='password' name='new_password' \
pattern='(?=.*\\d)(?=.*[a-z])(?=.*[A-Z])(?=.*[^A-Za-z0-9]).{{8,}}' required></label></p>\
<p><label>Confirm Password<br><input type='password' name='confirm_password' required></label></p>\
<button type='submit'>Save Password</button></form></div>"
    )
}

async fn login_page() -> impl IntoResponse {
    page("Login", &login_form(None), false)
}

async fn do_login(State(state): State<AppState>, Form(form): Form<LoginForm>) -> ApiResult<Response> {
    let username = form.username.unwrap_or_default();
    let password = form.password.unwrap_or_default();
    let device = state.device.clone();
    let result = run_blocking(move || Ok(device.auth().login(&username, &password))).await?;
    match result {
        Ok(success) => Ok((
            [(header::SET_COOKIE, success.set_cookie())],
            Redirect::to(success.redirect()),
        )
            .into_response()),
        Err(LoginError::AccountLocked) => Ok((
            StatusCode::TOO_MANY_REQUESTS,
            page(
                "Account Locked",
                &login_form(Some(&LoginError::AccountLocked.to_string())),
                false,
            ),
        )
            .into_response()),
        Err(LoginError::InvalidCredentials) => Ok((
            StatusCode::UNAUTHORIZED,
            page("Login Failed", &login_form(Some("Invalid username or password.")), false),
        )
            .into_response()),
        Err(e @ LoginError::Prefs(_)) => Err(ApiError::from(beecounter_core::DeviceError::from(e))),
    }
}

async fn change_password_page(_session: PageSession) -> impl IntoResponse {
    page("Change Password", &change_password_form(None), false)
}

async fn do_change_password(
    _session: PageSession,
    State(state): State<AppState>,
    Form(form): Form<ChangePasswordForm>,
) -> ApiResult<Response> {
    let new_password = form.new_password.unwrap_or_default();
    let confirm = form.confirm_password.unwrap_or_default();
    let device = state.device.clone();
    let result = run_blocking(move || Ok(device.auth().change_password(&new_password, &confirm))).await?;
    match result {
        Ok(()) => Ok(Redirect::to("/").into_response()),
        Err(e @ PasswordError::Prefs(_)) => Err(ApiError::from(beecounter_core::DeviceError::from(e))),
        Err(_) => Ok((
            StatusCode::BAD_REQUEST,
            page(
                "Password Change Failed",
                &change_password_form(Some("Passwords do not match or meet complexity rules.")),
                false,
            ),
        )
            .into_response()),
    }
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let cookie = state.device.auth().logout(cookie_header(&headers));
    debug!("logout requested");
    ([(header::SET_COOKIE, cookie)], Redirect::to("/login"))
}
