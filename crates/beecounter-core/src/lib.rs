//! # beecounter-core
//!
//! Core logic for the BeeCounter camera device.
//!
//! This crate provides:
//! - Frame source abstraction and the scoped frame-buffer lifecycle guard
//! - JPEG transcoding for sensors that do not deliver JPEG natively
//! - Capture / multipart stream endpoint logic over a transport-neutral sink
//! - The session gate with login lockout and password policy
//! - A preferences repository with explicit transactional scopes
//! - Image storage, the persistent error log and the collection job
//! - A cooperative scheduler that owns the watchdog heartbeat
//!
//! This crate is intentionally runtime-agnostic and contains no async code,
//! making it usable on both Linux (tokio) and ESP32 (esp-idf) targets.

pub mod auth;
pub mod camera;
pub mod capture;
pub mod clock;
pub mod collection;
pub mod config;
pub mod device;
pub mod encode;
pub mod error;
pub mod events;
pub mod frame;
pub mod network;
pub mod prefs;
pub mod scheduler;
pub mod sensor;
pub mod simulated;
pub mod storage;

pub use auth::{AuthGate, MemorySessionStore, SessionStore};
pub use camera::{CameraError, CameraHandle, FrameBuffer, FrameSource, PixelFormat};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DeviceConfig, StreamMode};
pub use device::{CameraReport, Device, DeviceParts, StreamOutcome};
pub use error::DeviceError;
pub use events::{DeviceEvent, Notifier};
pub use frame::FrameGuard;
pub use prefs::Preferences;
pub use sensor::{FrameSize, SensorControl, SensorSetting, SensorStatus};
pub use simulated::SimulatedCamera;
