//! The assembled device: every collaborator a request handler needs, plus
//! the operations that span more than one of them.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::auth::{AuthGate, SessionStore};
use crate::camera::{CameraError, CameraHandle, FrameSource};
use crate::capture::{self, FrameSent, ResponseSink, StreamReport};
use crate::clock::Clock;
use crate::collection::{CollectionJob, CollectionSnapshot, Collector};
use crate::config::{DeviceConfig, StreamMode};
use crate::encode;
use crate::error::DeviceError;
use crate::events::{Notifier, SystemMonitor};
use crate::frame::FrameGuard;
use crate::network::{ConnectivityWatchdog, NetworkLink, SystemControl};
use crate::prefs::{keys, Preferences, PrefsRead};
use crate::scheduler::{
    CollectionTask, HealthCheck, PerformanceReporter, RefreshRate, Scheduler, StatusLog, Watchdog,
};
use crate::sensor::{parse_quality, FrameSize, SensorSetting, SensorStatus};
use crate::storage::{ErrorLog, ImageStore, StoredImage, StorageUsage};

/// Platform pieces handed to [`Device::new`].
pub struct DeviceParts {
    pub config: DeviceConfig,
    pub camera: Option<CameraHandle>,
    pub prefs: Preferences,
    pub sessions: Arc<dyn SessionStore>,
    pub clock: Arc<dyn Clock>,
    pub notifier: Arc<dyn Notifier>,
    pub monitor: Arc<dyn SystemMonitor>,
    pub link: Arc<dyn NetworkLink>,
    pub system: Arc<dyn SystemControl>,
}

/// `/status` body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CameraReport {
    Ready {
        camera_initialized: bool,
        #[serde(flatten)]
        sensor: SensorStatus,
        width: u32,
        height: u32,
        sensor_id: u16,
    },
    Unavailable {
        camera_initialized: bool,
        error: String,
    },
}

/// What `/stream` produced.
#[derive(Debug)]
pub enum StreamOutcome {
    /// Polling mode: one frame of this many bytes.
    Frame(usize),
    /// Multipart mode: the stream ran until `report.end`.
    Stream(StreamReport),
}

pub struct Device {
    config: DeviceConfig,
    camera: Option<CameraHandle>,
    prefs: Preferences,
    auth: AuthGate,
    sessions: Arc<dyn SessionStore>,
    images: Arc<ImageStore>,
    error_log: Arc<ErrorLog>,
    collector: Arc<Collector>,
    notifier: Arc<dyn Notifier>,
    monitor: Arc<dyn SystemMonitor>,
    link: Arc<dyn NetworkLink>,
    system: Arc<dyn SystemControl>,
    clock: Arc<dyn Clock>,
    refresh_rate: RefreshRate,
}

fn validate_text(field: &str, value: &str, max_len: usize) -> Result<(), DeviceError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(DeviceError::Validation(format!("{} is required", field)));
    }
    if value.chars().count() > max_len || value.chars().any(|c| c.is_control()) {
        return Err(DeviceError::Validation(format!("Invalid {}", field)));
    }
    Ok(())
}

impl Device {
    pub fn new(parts: DeviceParts) -> Result<Self, DeviceError> {
        let DeviceParts {
            config,
            camera,
            prefs,
            sessions,
            clock,
            notifier,
            monitor,
            link,
            system,
        } = parts;

        config.validate()?;
        prefs.ensure_defaults(&config.device_name)?;
        let images = Arc::new(ImageStore::open(&config.image_dir)?);
        let error_log = Arc::new(ErrorLog::new(&config.error_log_path, clock.clone()));
        let auth = AuthGate::new(sessions.clone(), prefs.clone(), clock.clone())
            .with_lockout(config.login_max_attempts, config.lockout_window_ms);
        let collector = Arc::new(Collector::new(
            CollectionJob::new(config.collection_target, config.collection_interval_ms),
            camera.as_ref().map(|c| c.frames.clone()),
            images.clone(),
            notifier.clone(),
            error_log.clone(),
            clock.clone(),
            config.transcode_quality,
        ));
        let refresh_rate = RefreshRate::new(config.performance_interval_ms);

        let device = Self {
            config,
            camera,
            prefs,
            auth,
            sessions,
            images,
            error_log,
            collector,
            notifier,
            monitor,
            link,
            system,
            clock,
            refresh_rate,
        };
        device.system.apply_timezone(&device.timezone()?);
        if device.camera.is_some() {
            device.restore_camera_settings()?;
        } else {
            warn!("camera not initialized; live view and collection unavailable");
        }
        Ok(device)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn auth(&self) -> &AuthGate {
        &self.auth
    }

    pub fn prefs(&self) -> &Preferences {
        &self.prefs
    }

    pub fn images(&self) -> &Arc<ImageStore> {
        &self.images
    }

    pub fn error_log(&self) -> &Arc<ErrorLog> {
        &self.error_log
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn refresh_rate(&self) -> &RefreshRate {
        &self.refresh_rate
    }

    pub fn camera_initialized(&self) -> bool {
        self.camera.is_some()
    }

    fn camera(&self) -> Result<&CameraHandle, DeviceError> {
        self.camera
            .as_ref()
            .ok_or(DeviceError::Camera(CameraError::NotInitialized))
    }

    fn frames(&self) -> Result<&dyn FrameSource, DeviceError> {
        Ok(self.camera()?.frames.as_ref())
    }

    /// Build the main-loop scheduler with the standard task set.
    pub fn scheduler(&self, watchdog: Arc<dyn Watchdog>) -> Scheduler {
        let mut scheduler = Scheduler::new(self.clock.clone(), watchdog);
        scheduler
            .add(CollectionTask::new(self.collector.clone()))
            .add(PerformanceReporter::new(
                self.monitor.clone(),
                self.notifier.clone(),
                self.refresh_rate.clone(),
            ))
            .add(HealthCheck::new(
                self.monitor.clone(),
                self.config.health_check_interval_ms,
            ))
            .add(StatusLog::new(
                self.collector.clone(),
                self.images.clone(),
                self.config.status_log_interval_ms,
            ))
            .add(ConnectivityWatchdog::new(
                self.link.clone(),
                self.system.clone(),
                self.error_log.clone(),
                self.config.wifi_reconnect_timeout_ms,
            ));
        scheduler
    }

    // ------------------------------------------------------------------
    // Live view
    // ------------------------------------------------------------------

    pub fn capture(&self, sink: &mut dyn ResponseSink) -> Result<usize, DeviceError> {
        capture::serve_capture(self.frames()?, self.config.transcode_quality, sink)
    }

    pub fn stream(
        &self,
        sink: &mut dyn ResponseSink,
        on_frame: &mut dyn FnMut(FrameSent),
    ) -> Result<StreamOutcome, DeviceError> {
        let frames = self.frames()?;
        let quality = self.config.transcode_quality;
        match self.config.stream_mode {
            StreamMode::Polling => {
                capture::serve_polling_frame(frames, quality, sink).map(StreamOutcome::Frame)
            }
            StreamMode::Multipart => {
                capture::serve_multipart_stream(frames, quality, sink, on_frame)
                    .map(StreamOutcome::Stream)
            }
        }
    }

    pub fn camera_report(&self) -> CameraReport {
        let Some(camera) = &self.camera else {
            return CameraReport::Unavailable {
                camera_initialized: false,
                error: "Camera not available".to_string(),
            };
        };
        match camera.sensor.status() {
            Ok(sensor) => {
                let (width, height) = sensor.frame_size().dimensions();
                CameraReport::Ready {
                    camera_initialized: true,
                    sensor,
                    width,
                    height,
                    sensor_id: camera.sensor.sensor_id(),
                }
            }
            Err(e) => CameraReport::Unavailable {
                camera_initialized: true,
                error: e.to_string(),
            },
        }
    }

    /// Write one sensor register (`/control?var=&val=`).
    pub fn apply_control(&self, var: &str, val: &str) -> Result<(), DeviceError> {
        let camera = self.camera()?;
        let setting = SensorSetting::parse(var, val)?;
        camera.sensor.apply(setting)?;
        info!(var, val, "sensor control applied");
        Ok(())
    }

    /// Persist and apply resolution + quality (`/api/camera-settings`).
    ///
    /// Unknown resolution names fall back to SVGA.
    pub fn apply_camera_settings(&self, resolution: &str, quality: &str) -> Result<FrameSize, DeviceError> {
        let camera = self.camera()?;
        let quality = parse_quality(quality)?;
        let size = FrameSize::from_name_or_default(resolution);

        let mut scope = self.prefs.write()?;
        scope.set_string(keys::CAM_RESOLUTION, size.name());
        scope.set_u64(keys::CAM_QUALITY, quality as u64);
        scope.commit()?;

        camera.sensor.apply(SensorSetting::Quality(quality))?;
        camera.sensor.apply(SensorSetting::FrameSize(size))?;
        info!(resolution = size.name(), quality, "camera settings applied");
        Ok(size)
    }

    /// Re-apply persisted camera settings (boot).
    pub fn restore_camera_settings(&self) -> Result<(), DeviceError> {
        let camera = self.camera()?;
        let (resolution, quality) = {
            let scope = self.prefs.read()?;
            (
                scope.get_string(keys::CAM_RESOLUTION)?,
                scope.get_string(keys::CAM_QUALITY)?,
            )
        };
        if let Some(quality) = quality {
            match parse_quality(&quality) {
                Ok(q) => camera.sensor.apply(SensorSetting::Quality(q))?,
                Err(e) => warn!(error = %e, "ignoring stored camera quality"),
            }
        }
        if let Some(resolution) = resolution {
            let size = FrameSize::from_name_or_default(&resolution);
            camera.sensor.apply(SensorSetting::FrameSize(size))?;
            info!(resolution = size.name(), "restored camera resolution");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Storage
    // ------------------------------------------------------------------

    /// Take one photo and store it (`/api/capture/photo`).
    pub fn capture_photo(&self) -> Result<StoredImage, DeviceError> {
        let frame = FrameGuard::acquire(self.frames()?)?;
        let jpeg = encode::jpeg_bytes(&frame, self.config.transcode_quality)?;
        let stored = self.images.save(self.clock.unix_time(), &jpeg)?;
        drop(jpeg);
        frame.release();
        Ok(stored)
    }

    pub fn list_images(&self) -> Result<Vec<StoredImage>, DeviceError> {
        Ok(self.images.list()?)
    }

    pub fn read_image(&self, name: &str) -> Result<Vec<u8>, DeviceError> {
        Ok(self.images.read(name)?)
    }

    pub fn delete_image(&self, name: &str) -> Result<(), DeviceError> {
        Ok(self.images.delete(name)?)
    }

    pub fn storage_usage(&self) -> Result<StorageUsage, DeviceError> {
        Ok(self.images.usage()?)
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    pub fn start_collection(&self) -> Result<bool, DeviceError> {
        self.collector.start()
    }

    pub fn stop_collection(&self) -> Result<bool, DeviceError> {
        self.collector.stop()
    }

    pub fn collection(&self) -> Result<CollectionSnapshot, DeviceError> {
        self.collector.snapshot()
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub fn device_name(&self) -> Result<String, DeviceError> {
        Ok(self
            .prefs
            .read()?
            .get_string_or(keys::DEVICE_NAME, &self.config.device_name)?)
    }

    pub fn set_device_name(&self, name: &str) -> Result<(), DeviceError> {
        validate_text("device name", name, 32)?;
        let mut scope = self.prefs.write()?;
        scope.set_string(keys::DEVICE_NAME, name.trim());
        scope.commit()?;
        info!(name = name.trim(), "device name changed");
        Ok(())
    }

    pub fn timezone(&self) -> Result<String, DeviceError> {
        Ok(self
            .prefs
            .read()?
            .get_string_or(keys::TIMEZONE, crate::prefs::DEFAULT_TIMEZONE)?)
    }

    /// Store a POSIX TZ string such as `CET-1CEST,M3.5.0,M10.5.0/3`.
    pub fn set_timezone(&self, tz: &str) -> Result<(), DeviceError> {
        validate_text("timezone", tz, 64)?;
        if tz.trim().chars().any(|c| c.is_whitespace()) {
            return Err(DeviceError::Validation("Invalid timezone".to_string()));
        }
        let mut scope = self.prefs.write()?;
        scope.set_string(keys::TIMEZONE, tz.trim());
        scope.commit()?;
        self.system.apply_timezone(tz.trim());
        info!(tz = tz.trim(), "timezone changed");
        Ok(())
    }

    pub fn ei_api_key(&self) -> Result<Option<String>, DeviceError> {
        Ok(self
            .prefs
            .read()?
            .get_string(keys::EI_API_KEY)?
            .filter(|k| !k.is_empty()))
    }

    pub fn set_ei_api_key(&self, key: &str) -> Result<(), DeviceError> {
        validate_text("API key", key, 128)?;
        let mut scope = self.prefs.write()?;
        scope.set_string(keys::EI_API_KEY, key.trim());
        scope.commit()?;
        info!("Edge Impulse API key saved");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    pub fn reboot(&self) {
        info!("reboot requested");
        self.system.restart("reboot requested");
    }

    /// Wipe preferences, end the session and restart.
    pub fn factory_reset(&self) -> Result<(), DeviceError> {
        let mut scope = self.prefs.write()?;
        scope.clear();
        scope.commit()?;
        self.sessions.clear();
        warn!("factory reset: preferences cleared");
        self.system.restart("factory reset");
        Ok(())
    }
}
