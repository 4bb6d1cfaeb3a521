//! Shared fixtures for the router tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{header, Request, Response};
use axum::Router;
use beecounter_core::device::DeviceParts;
use beecounter_core::events::{PerformanceSnapshot, SystemMonitor};
use beecounter_core::network::{AlwaysConnected, SystemControl};
use beecounter_core::{
    CameraHandle, Device, DeviceConfig, ManualClock, MemorySessionStore, PixelFormat, Preferences,
    SimulatedCamera, StreamMode,
};
use beecounter_web::uploader::UploadError;
use beecounter_web::{create_router, EventHub, ServerState, TrainingUploader};
use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tower::ServiceExt;

pub struct StaticMonitor;

impl SystemMonitor for StaticMonitor {
    fn snapshot(&self) -> PerformanceSnapshot {
        PerformanceSnapshot {
            heap_used: 100_000,
            heap_total: 300_000,
            ..Default::default()
        }
    }
}

#[derive(Default)]
pub struct RestartRecorder {
    pub reasons: Mutex<Vec<String>>,
}

impl SystemControl for RestartRecorder {
    fn restart(&self, reason: &str) {
        self.reasons.lock().unwrap().push(reason.to_string());
    }
}

/// Uploader that records files and waits for a permit before each one.
pub struct GatedUploader {
    pub permits: Semaphore,
    pub uploaded: Mutex<Vec<(String, String)>>,
    pub calls: AtomicUsize,
}

impl GatedUploader {
    pub fn open() -> Self {
        Self::with_permits(Semaphore::MAX_PERMITS)
    }

    pub fn with_permits(permits: usize) -> Self {
        Self {
            permits: Semaphore::new(permits),
            uploaded: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }
}

impl TrainingUploader for GatedUploader {
    fn upload<'a>(
        &'a self,
        _api_key: &'a str,
        label: &'a str,
        file_name: &'a str,
        _jpeg: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), UploadError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| UploadError::Task(e.to_string()))?;
            permit.forget();
            self.uploaded
                .lock()
                .unwrap()
                .push((file_name.to_string(), label.to_string()));
            Ok(())
        })
    }
}

pub struct TestApp {
    pub _dir: tempfile::TempDir,
    pub state: Arc<ServerState>,
    pub camera: Option<Arc<SimulatedCamera>>,
    pub clock: ManualClock,
    pub system: Arc<RestartRecorder>,
    pub uploader: Arc<GatedUploader>,
}

pub struct Options {
    pub camera: bool,
    pub stream_mode: StreamMode,
    pub protect_live_view: bool,
    pub uploader: GatedUploader,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            camera: true,
            stream_mode: StreamMode::Multipart,
            protect_live_view: false,
            uploader: GatedUploader::open(),
        }
    }
}

impl TestApp {
    pub fn new() -> Self {
        Self::with(Options::default())
    }

    pub fn without_camera() -> Self {
        Self::with(Options {
            camera: false,
            ..Default::default()
        })
    }

    pub fn with(options: Options) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DeviceConfig::default().with_data_dir(dir.path());
        config.stream_mode = options.stream_mode;
        config.protect_live_view = options.protect_live_view;

        let camera = options
            .camera
            .then(|| Arc::new(SimulatedCamera::new(PixelFormat::Jpeg)));
        let clock = ManualClock::new(10_000, 1_700_000_000);
        let system = Arc::new(RestartRecorder::default());
        let hub = EventHub::new();
        let device = Device::new(DeviceParts {
            config,
            camera: camera.clone().map(CameraHandle::new),
            prefs: Preferences::in_memory(),
            sessions: Arc::new(MemorySessionStore::new()),
            clock: Arc::new(clock.clone()),
            notifier: Arc::new(hub.clone()),
            monitor: Arc::new(StaticMonitor),
            link: Arc::new(AlwaysConnected),
            system: system.clone(),
        })
        .unwrap();

        let uploader = Arc::new(options.uploader);
        let state = Arc::new(ServerState::new(Arc::new(device), hub, uploader.clone()));
        Self {
            _dir: dir,
            state,
            camera,
            clock,
            system,
            uploader,
        }
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str, cookie: Option<&str>) -> Response<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    pub async fn post_form(&self, uri: &str, form: &str, cookie: Option<&str>) -> Response<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        self.send(builder.body(Body::from(form.to_string())).unwrap()).await
    }

    /// Log in with the factory credentials; returns the `Cookie` header value.
    pub async fn login(&self) -> String {
        let response = self
            .post_form("/login", "username=admin&password=admin", None)
            .await;
        session_cookie(&response).expect("login should set a session cookie")
    }
}

pub fn session_cookie(response: &Response<Body>) -> Option<String> {
    response
        .headers()
        .get(header::SET_COOKIE)?
        .to_str()
        .ok()?
        .split(';')
        .next()
        .map(str::to_string)
}

pub fn location(response: &Response<Body>) -> Option<&str> {
    response.headers().get(header::LOCATION)?.to_str().ok()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
