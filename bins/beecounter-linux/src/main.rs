//! BeeCounter camera server for Linux.
//!
//! Runs the full web interface against a simulated sensor so the firmware's
//! HTTP surface can be exercised without hardware.
//!
//! Environment:
//! - `BEECOUNTER_CONFIG` - JSON file with a `DeviceConfig`
//! - `BEECOUNTER_PORT` - listen port (default 8080)
//! - `BEECOUNTER_DATA_DIR` - preferences, images and error log (default `./data`)
//! - `BEECOUNTER_SENSOR_FORMAT` - simulated pixel format (default `jpeg`)
//! - `BEECOUNTER_NO_CAMERA` - start as if the camera failed to initialize

mod host;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use beecounter_core::prefs::JsonFileBackend;
use beecounter_core::scheduler::SoftwareWatchdog;
use beecounter_core::storage::ImageStore;
use beecounter_core::{
    CameraHandle, Clock, Device, DeviceConfig, DeviceParts, MemorySessionStore, PixelFormat,
    Preferences, SimulatedCamera, SystemClock,
};
use beecounter_core::network::AlwaysConnected;
use beecounter_web::{create_router, EdgeImpulseClient, EventHub, ServerState};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use host::{HostMonitor, ProcessControl};

/// Scheduler pass delay.
const PASS_DELAY: Duration = Duration::from_millis(50);

/// A scheduler that has not fed the watchdog for this long is reported.
const WATCHDOG_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone)]
struct Settings {
    port: u16,
    data_dir: PathBuf,
    sensor_format: PixelFormat,
    camera: bool,
    device: DeviceConfig,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn load_settings() -> Result<Settings> {
    let device = match std::env::var("BEECOUNTER_CONFIG") {
        Ok(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {path}"))?;
            serde_json::from_str::<DeviceConfig>(&text)
                .with_context(|| format!("parsing config {path}"))?
        }
        Err(_) => DeviceConfig::default(),
    };

    let port = match std::env::var("BEECOUNTER_PORT") {
        Ok(raw) => raw.parse().with_context(|| format!("invalid port {raw:?}"))?,
        Err(_) => 8080,
    };
    let data_dir = std::env::var("BEECOUNTER_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"));
    let sensor_format = match std::env::var("BEECOUNTER_SENSOR_FORMAT") {
        Ok(name) => match PixelFormat::from_name(&name) {
            Some(format) => format,
            None => bail!("unknown sensor format {name:?}"),
        },
        Err(_) => PixelFormat::Jpeg,
    };

    // Relative paths from the config file are resolved under the data dir.
    let mut device = device;
    if device.image_dir.is_relative() {
        device.image_dir = data_dir.join(&device.image_dir);
    }
    if device.error_log_path.is_relative() {
        device.error_log_path = data_dir.join(&device.error_log_path);
    }

    Ok(Settings {
        port,
        data_dir,
        sensor_format,
        camera: !env_flag("BEECOUNTER_NO_CAMERA"),
        device,
    })
}

fn open_preferences(data_dir: &Path) -> Result<Preferences> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let backend = JsonFileBackend::open(data_dir.join("prefs.json"))?;
    Ok(Preferences::new(Arc::new(backend)))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "info,beecounter_web=debug,beecounter_core=debug".into()
        })))
        .with(fmt::layer())
        .init();

    info!("Starting BeeCounter camera server");

    let settings = load_settings()?;
    info!(
        port = settings.port,
        data_dir = %settings.data_dir.display(),
        stream_mode = ?settings.device.stream_mode,
        "Configuration loaded"
    );

    let prefs = open_preferences(&settings.data_dir)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let control = ProcessControl::new();
    let events = EventHub::new();

    let camera = if settings.camera {
        info!(format = ?settings.sensor_format, "Simulated camera ready");
        Some(CameraHandle::new(Arc::new(SimulatedCamera::new(
            settings.sensor_format,
        ))))
    } else {
        warn!("Camera disabled, live view endpoints will report 503");
        None
    };

    let images = Arc::new(ImageStore::open(&settings.device.image_dir)?);
    let ingestion_url = settings.device.ei_ingestion_url.clone();
    let device = Arc::new(Device::new(DeviceParts {
        config: settings.device,
        camera,
        prefs,
        sessions: Arc::new(MemorySessionStore::new()),
        clock: clock.clone(),
        notifier: Arc::new(events.clone()),
        monitor: Arc::new(HostMonitor::new(images)),
        link: Arc::new(AlwaysConnected),
        system: Arc::new(control.clone()),
    })?);

    // Scheduler on its own thread; the watchdog is polled from tokio.
    let watchdog = Arc::new(SoftwareWatchdog::new(clock.clone()));
    let mut scheduler = device.scheduler(watchdog.clone());
    info!(tasks = ?scheduler.task_names(), "Scheduler configured");
    let stop_flag = control.stop_flag();
    let scheduler_thread = std::thread::Builder::new()
        .name("scheduler".into())
        .spawn(move || scheduler.run_until(&stop_flag, PASS_DELAY))
        .context("spawning scheduler thread")?;

    let watchdog_monitor = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            if watchdog.is_starved(WATCHDOG_TIMEOUT_MS) {
                error!(
                    since_feed_ms = watchdog.since_last_feed_ms(),
                    "Scheduler watchdog starved"
                );
            }
        }
    });

    let uploader = Arc::new(EdgeImpulseClient::new(ingestion_url)?);
    let state = Arc::new(ServerState::new(device, events, uploader));
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "HTTP server listening");

    let shutdown = control.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
            _ = shutdown.stopped() => info!("Restart requested"),
        }
    });

    if let Err(e) = server.await {
        error!(error = %e, "HTTP server error");
    }

    control.request_stop();
    watchdog_monitor.abort();
    if scheduler_thread.join().is_err() {
        error!("Scheduler thread panicked");
    }

    info!("BeeCounter stopped");
    Ok(())
}
