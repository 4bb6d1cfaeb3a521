//! Device-wide error taxonomy.

use thiserror::Error;

use crate::auth::{LoginError, PasswordError};
use crate::camera::CameraError;
use crate::capture::SinkError;
use crate::encode::EncodeError;
use crate::prefs::PrefsError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("Response aborted: {0}")]
    Transport(#[from] SinkError),

    #[error("Authentication required")]
    AuthRequired,

    #[error("Too many failed attempts. Try again later.")]
    AccountLocked,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Prefs(#[from] PrefsError),

    #[error("Network failure: {0}")]
    Network(String),

    #[error("{0}")]
    Unsupported(String),
}

impl DeviceError {
    /// HTTP status carrying this error to the client.
    pub fn status_code(&self) -> u16 {
        match self {
            DeviceError::Camera(CameraError::NotInitialized) => 503,
            DeviceError::Camera(CameraError::SettingRejected { .. }) => 400,
            DeviceError::Camera(_) => 500,
            DeviceError::Encode(_) => 500,
            DeviceError::Transport(_) => 500,
            DeviceError::AuthRequired => 401,
            DeviceError::InvalidCredentials => 401,
            DeviceError::AccountLocked => 429,
            DeviceError::Validation(_) => 400,
            DeviceError::NotFound(_) => 404,
            DeviceError::Conflict(_) => 409,
            DeviceError::Storage(StorageError::InvalidName(_)) => 400,
            DeviceError::Storage(StorageError::NotFound(_)) => 404,
            DeviceError::Storage(_) => 500,
            DeviceError::Prefs(_) => 500,
            DeviceError::Network(_) => 503,
            DeviceError::Unsupported(_) => 501,
        }
    }
}

impl From<LoginError> for DeviceError {
    fn from(err: LoginError) -> Self {
        match err {
            LoginError::InvalidCredentials => DeviceError::InvalidCredentials,
            LoginError::AccountLocked => DeviceError::AccountLocked,
            LoginError::Prefs(e) => DeviceError::Prefs(e),
        }
    }
}

impl From<PasswordError> for DeviceError {
    fn from(err: PasswordError) -> Self {
        match err {
            PasswordError::Prefs(e) => DeviceError::Prefs(e),
            other => DeviceError::Validation(other.to_string()),
        }
    }
}
