//! BeeCounter camera firmware for ESP32-S3.
//!
//! Same core as the Linux build; only the platform layer differs:
//! - esp32-camera driver instead of the simulated sensor
//! - NVS instead of the JSON preferences file
//! - `EspHttpServer` handlers instead of axum routes
//! - the scheduler thread feeds the hardware task watchdog
//!
//! The web UI pages and the server-sent event channel are served by the
//! Linux build only; the firmware exposes the live view and the JSON API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use beecounter_core::events::NullNotifier;
use beecounter_core::prefs::{keys, PrefsRead};
use beecounter_core::storage::IMAGE_URL_PREFIX;
use beecounter_core::{
    CameraHandle, Device, DeviceConfig, DeviceError, DeviceParts, MemorySessionStore,
    Preferences, StreamOutcome, SystemClock,
};
use beecounter_esp32::camera::{CameraPins, EspCamera};
use beecounter_esp32::http::{
    error_reply, is_authenticated, json_reply, live_view_allowed, query_params, read_form,
    redirect, EspSink,
};
use beecounter_esp32::nvs::NvsBackend;
use beecounter_esp32::system::{mount_spiffs, EspMonitor, EspRestart, IdleCounters, TaskWatchdog};
use beecounter_esp32::wifi::{connect_wifi, WifiLink};
use embedded_svc::http::server::{Connection, Request};
use embedded_svc::http::{Headers, Method};
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::peripherals::Peripherals;
use esp_idf_svc::http::server::{Configuration, EspHttpServer};
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::sntp::EspSntp;
use log::{error, info, warn};
use serde_json::{json, Value};

const DATA_DIR: &str = "/data";
const STORAGE_PARTITION: &str = "storage";

/// Scheduler pass delay.
const PASS_DELAY: Duration = Duration::from_millis(10);

/// Build-time fallback when NVS holds no WiFi credentials.
const DEFAULT_SSID: Option<&str> = option_env!("BEECOUNTER_WIFI_SSID");
const DEFAULT_PASSWORD: Option<&str> = option_env!("BEECOUNTER_WIFI_PASSWORD");

fn wifi_credentials(prefs: &Preferences) -> Result<(String, String)> {
    let scope = prefs.read()?;
    let ssid = scope.get_string_or(keys::WIFI_SSID, DEFAULT_SSID.unwrap_or_default())?;
    let password = scope.get_string_or(keys::WIFI_PASSWORD, DEFAULT_PASSWORD.unwrap_or_default())?;
    Ok((ssid, password))
}

/// Run `f` and reply with its JSON, or with the error.
fn reply_json<C: Connection>(
    request: Request<C>,
    f: impl FnOnce() -> Result<Value, DeviceError>,
) -> Result<()> {
    match f() {
        Ok(body) => json_reply(request, 200, &body),
        Err(err) => error_reply(request, &err),
    }
}

fn require_session<C: Connection>(device: &Device, request: Request<C>) -> Result<Option<Request<C>>> {
    if is_authenticated(device, &request) {
        Ok(Some(request))
    } else {
        error_reply(request, &DeviceError::AuthRequired)?;
        Ok(None)
    }
}

fn register_handlers(server: &mut EspHttpServer<'static>, device: Arc<Device>) -> Result<()> {
    let d = device.clone();
    server.fn_handler::<anyhow::Error, _>("/capture", Method::Get, move |request| {
        if !live_view_allowed(&d, &request) {
            return error_reply(request, &DeviceError::AuthRequired);
        }
        let mut sink = EspSink::new(request);
        let result = d.capture(&mut sink).map(|_| ());
        sink.finish(result)
    })?;

    let d = device.clone();
    server.fn_handler::<anyhow::Error, _>("/stream", Method::Get, move |request| {
        if !live_view_allowed(&d, &request) {
            return error_reply(request, &DeviceError::AuthRequired);
        }
        let mut sink = EspSink::new(request);
        let result = d.stream(&mut sink, &mut |_| {}).map(|outcome| {
            if let StreamOutcome::Stream(report) = outcome {
                info!(
                    "Stream ended after {} frames ({:.1} fps): {:?}",
                    report.frames,
                    report.fps(),
                    report.end
                );
            }
        });
        sink.finish(result)
    })?;

    let d = device.clone();
    server.fn_handler::<anyhow::Error, _>("/status", Method::Get, move |request| {
        if !live_view_allowed(&d, &request) {
            return error_reply(request, &DeviceError::AuthRequired);
        }
        let report = serde_json::to_value(d.camera_report())?;
        json_reply(request, 200, &report)
    })?;

    let d = device.clone();
    server.fn_handler::<anyhow::Error, _>("/control", Method::Get, move |request| {
        let Some(request) = require_session(&d, request)? else {
            return Ok(());
        };
        let params = query_params(request.uri());
        reply_json(request, || {
            let var = params
                .get("var")
                .ok_or_else(|| DeviceError::Validation("Missing parameter: var".into()))?;
            let val = params
                .get("val")
                .ok_or_else(|| DeviceError::Validation("Missing parameter: val".into()))?;
            d.apply_control(var, val)?;
            Ok(json!({ "message": "OK" }))
        })
    })?;

    let d = device.clone();
    server.fn_handler::<anyhow::Error, _>("/login", Method::Post, move |mut request| {
        let form = read_form(&mut request)?;
        let username = form.get("username").map(String::as_str).unwrap_or_default();
        let password = form.get("password").map(String::as_str).unwrap_or_default();
        match d.auth().login(username, password) {
            Ok(success) => redirect(request, success.redirect(), Some(&success.set_cookie())),
            Err(err) => error_reply(request, &DeviceError::from(err)),
        }
    })?;

    let d = device.clone();
    server.fn_handler::<anyhow::Error, _>("/logout", Method::Get, move |request| {
        let cookie = d.auth().logout(request.header("Cookie"));
        redirect(request, "/login", Some(cookie))
    })?;

    let d = device.clone();
    server.fn_handler::<anyhow::Error, _>("/api/camera-settings", Method::Post, move |request| {
        let Some(mut request) = require_session(&d, request)? else {
            return Ok(());
        };
        let form = read_form(&mut request)?;
        reply_json(request, || {
            let resolution = form
                .get("resolution")
                .ok_or_else(|| DeviceError::Validation("Missing parameter: resolution".into()))?;
            let quality = form
                .get("quality")
                .ok_or_else(|| DeviceError::Validation("Missing parameter: quality".into()))?;
            let size = d.apply_camera_settings(resolution, quality)?;
            let (width, height) = size.dimensions();
            Ok(json!({
                "message": "Camera settings updated",
                "resolution": size.name(),
                "quality": quality,
                "width": width,
                "height": height,
            }))
        })
    })?;

    let d = device.clone();
    server.fn_handler::<anyhow::Error, _>("/api/capture/start", Method::Post, move |request| {
        let Some(request) = require_session(&d, request)? else {
            return Ok(());
        };
        reply_json(request, || {
            let changed = d.start_collection()?;
            Ok(json!({
                "message": "Data collection started.",
                "changed": changed,
                "collection": d.collection()?,
            }))
        })
    })?;

    let d = device.clone();
    server.fn_handler::<anyhow::Error, _>("/api/capture/stop", Method::Post, move |request| {
        let Some(request) = require_session(&d, request)? else {
            return Ok(());
        };
        reply_json(request, || {
            let changed = d.stop_collection()?;
            Ok(json!({
                "message": "Data collection stopped.",
                "changed": changed,
                "collection": d.collection()?,
            }))
        })
    })?;

    let d = device.clone();
    server.fn_handler::<anyhow::Error, _>("/api/capture/photo", Method::Post, move |request| {
        let Some(request) = require_session(&d, request)? else {
            return Ok(());
        };
        reply_json(request, || {
            let image = d.capture_photo()?;
            Ok(json!({
                "message": format!("Photo captured and saved as {}", image.path),
                "image": image,
            }))
        })
    })?;

    let d = device.clone();
    server.fn_handler::<anyhow::Error, _>("/api/images", Method::Get, move |request| {
        let Some(request) = require_session(&d, request)? else {
            return Ok(());
        };
        reply_json(request, || Ok(json!(d.list_images()?)))
    })?;

    let d = device.clone();
    server.fn_handler::<anyhow::Error, _>("/images", Method::Get, move |request| {
        let Some(request) = require_session(&d, request)? else {
            return Ok(());
        };
        let params = query_params(request.uri());
        if let Some(name) = params.get("delete") {
            return reply_json(request, || {
                d.delete_image(name)?;
                Ok(json!({ "message": format!("Deleted: {}{}", IMAGE_URL_PREFIX, name) }))
            });
        }
        let Some(name) = params.get("serve") else {
            let err = DeviceError::Validation("Missing parameter: serve or delete".into());
            return error_reply(request, &err);
        };
        match d.read_image(name) {
            Ok(jpeg) => {
                let mut response = request
                    .into_response(200, None, &[("Content-Type", "image/jpeg")])
                    .map_err(|e| anyhow!("{:?}", e))?;
                embedded_svc::io::Write::write_all(&mut response, &jpeg)
                    .map_err(|e| anyhow!("{:?}", e))?;
                Ok(())
            }
            Err(err) => error_reply(request, &err),
        }
    })?;

    let d = device.clone();
    server.fn_handler::<anyhow::Error, _>("/api/collection", Method::Get, move |request| {
        let Some(request) = require_session(&d, request)? else {
            return Ok(());
        };
        reply_json(request, || {
            Ok(json!({
                "collection": d.collection()?,
                "storage": d.storage_usage()?,
            }))
        })
    })?;

    let d = device.clone();
    server.fn_handler::<anyhow::Error, _>("/api/edgeimpulse/settings", Method::Post, move |request| {
        let Some(mut request) = require_session(&d, request)? else {
            return Ok(());
        };
        let form = read_form(&mut request)?;
        reply_json(request, || {
            let key = form
                .get("ei-api-key")
                .ok_or_else(|| DeviceError::Validation("Missing parameter: ei-api-key".into()))?;
            d.set_ei_api_key(key)?;
            Ok(json!({ "message": "Edge Impulse settings saved." }))
        })
    })?;

    let d = device.clone();
    server.fn_handler::<anyhow::Error, _>("/admin/reboot", Method::Post, move |request| {
        let Some(request) = require_session(&d, request)? else {
            return Ok(());
        };
        json_reply(request, 200, &json!({ "message": "Rebooting..." }))?;
        d.reboot();
        Ok(())
    })?;

    let d = device;
    server.fn_handler::<anyhow::Error, _>("/factory-reset", Method::Post, move |request| {
        let Some(request) = require_session(&d, request)? else {
            return Ok(());
        };
        reply_json(request, || {
            d.factory_reset()?;
            Ok(json!({ "message": "Factory reset successful. Device is restarting..." }))
        })
    })?;

    Ok(())
}

fn main() -> Result<()> {
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("Starting BeeCounter firmware");

    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let prefs = Preferences::new(Arc::new(NvsBackend::new(nvs.clone())));
    let (ssid, password) = wifi_credentials(&prefs)?;
    let (wifi, ip) = connect_wifi(&ssid, &password, peripherals.modem, sysloop, Some(nvs))?;
    let link = Arc::new(WifiLink::new(wifi));

    // Wall time for image names and the error log; unsynced until the first reply.
    let _sntp = EspSntp::new_default()?;

    let flash = mount_spiffs(DATA_DIR, STORAGE_PARTITION)?;
    let psram = unsafe { esp_idf_svc::sys::esp_psram_get_size() } > 0;
    let camera = match EspCamera::init(&CameraPins::ESP32S3_EYE, psram) {
        Ok(camera) => {
            info!("Camera frame size: {}", camera.frame_size().name());
            Some(CameraHandle::new(Arc::new(camera)))
        }
        Err(e) => {
            error!("Camera init failed: {}", e);
            None
        }
    };

    let monitor = Arc::new(EspMonitor::new(IdleCounters::start()?, flash, link.clone()));
    let device = Arc::new(Device::new(DeviceParts {
        config: DeviceConfig::default().with_data_dir(DATA_DIR),
        camera,
        prefs,
        sessions: Arc::new(MemorySessionStore::new()),
        clock: Arc::new(SystemClock::new()),
        notifier: Arc::new(NullNotifier),
        monitor,
        link,
        system: Arc::new(EspRestart),
    })?);

    let mut server = EspHttpServer::new(&Configuration {
        stack_size: 10240,
        max_uri_handlers: 24,
        ..Default::default()
    })?;
    register_handlers(&mut server, device.clone())?;
    info!("HTTP server ready at http://{}/", ip);

    // The scheduler runs on this thread and owns the task watchdog.
    let watchdog = Arc::new(TaskWatchdog::subscribe_current()?);
    let mut scheduler = device.scheduler(watchdog);
    info!("Scheduler tasks: {:?}", scheduler.task_names());
    let never = std::sync::atomic::AtomicBool::new(false);
    scheduler.run_until(&never, PASS_DELAY);

    warn!("Scheduler exited");
    Ok(())
}
