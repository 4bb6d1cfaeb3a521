//! Device configuration.
//!
//! One struct covers both firmware variants; which `/stream` contract is
//! served and whether live view sits behind the login are plain fields.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::auth::{LOCKOUT_WINDOW_MS, MAX_LOGIN_ATTEMPTS};
use crate::encode::TRANSCODE_QUALITY;
use crate::error::DeviceError;
use crate::prefs::DEFAULT_DEVICE_NAME;

/// Which contract `/stream` serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// `multipart/x-mixed-replace` until the client disconnects.
    #[default]
    Multipart,
    /// One no-cache JPEG per request; the page polls.
    Polling,
}

/// Default collection target.
pub const DEFAULT_COLLECTION_TARGET: u32 = 50;

/// Default collection interval: the target spread over 24 hours.
pub const DEFAULT_COLLECTION_INTERVAL_MS: u64 = 24 * 60 * 60 * 1000 / DEFAULT_COLLECTION_TARGET as u64;

pub const MIN_PERFORMANCE_INTERVAL_MS: u64 = 500;
pub const MAX_PERFORMANCE_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub device_name: String,
    pub stream_mode: StreamMode,
    /// Require a session for `/capture`, `/stream` and `/status`.
    pub protect_live_view: bool,
    pub image_dir: PathBuf,
    pub error_log_path: PathBuf,
    pub collection_target: u32,
    pub collection_interval_ms: u64,
    pub transcode_quality: u8,
    pub performance_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub status_log_interval_ms: u64,
    pub wifi_reconnect_timeout_ms: u64,
    pub login_max_attempts: u32,
    pub lockout_window_ms: u64,
    /// Edge Impulse ingestion endpoint.
    pub ei_ingestion_url: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            stream_mode: StreamMode::Multipart,
            protect_live_view: false,
            image_dir: PathBuf::from("images"),
            error_log_path: PathBuf::from("error.log"),
            collection_target: DEFAULT_COLLECTION_TARGET,
            collection_interval_ms: DEFAULT_COLLECTION_INTERVAL_MS,
            transcode_quality: TRANSCODE_QUALITY,
            performance_interval_ms: 5_000,
            health_check_interval_ms: 10_000,
            status_log_interval_ms: 120_000,
            wifi_reconnect_timeout_ms: 30_000,
            login_max_attempts: MAX_LOGIN_ATTEMPTS,
            lockout_window_ms: LOCKOUT_WINDOW_MS,
            ei_ingestion_url: "https://ingestion.edgeimpulse.com/api/training/data".to_string(),
        }
    }
}

impl DeviceConfig {
    /// Put image and log paths under `dir`.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.image_dir = dir.join("images");
        self.error_log_path = dir.join("error.log");
        self
    }

    /// Reject values the collection and encoder loops cannot run with.
    pub fn validate(&self) -> Result<(), DeviceError> {
        let invalid = |msg: &str| Err(DeviceError::Validation(msg.to_string()));
        if self.collection_target == 0 {
            return invalid("collection_target must be at least 1");
        }
        if self.collection_interval_ms == 0 {
            return invalid("collection_interval_ms must be at least 1");
        }
        if !(1..=100).contains(&self.transcode_quality) {
            return invalid("transcode_quality must be between 1 and 100");
        }
        Ok(())
    }
}
