//! ESP32 platform layer for BeeCounter.
//!
//! Implements the core traits against ESP-IDF:
//! - [`camera::EspCamera`] - esp32-camera driver as `FrameSource` + `SensorControl`
//! - [`nvs::NvsBackend`] - preferences in NVS flash
//! - [`wifi::WifiLink`] - station connection with non-blocking reconnect
//! - [`system`] - task watchdog, restart, resource monitor
//! - [`http`] - response sink over `EspHttpServer` connections
//!
//! # Example
//!
//! ```ignore
//! use beecounter_esp32::camera::{CameraPins, EspCamera};
//! use beecounter_esp32::nvs::NvsBackend;
//!
//! let camera = EspCamera::init(&CameraPins::ESP32S3_EYE, psram)?;
//! let prefs = Preferences::new(Arc::new(NvsBackend::new(partition)));
//! ```

pub mod camera;
pub mod http;
pub mod nvs;
pub mod system;
pub mod wifi;
