//! # beecounter-web
//!
//! Web UI, REST API and live view for the BeeCounter camera.
//!
//! This crate provides:
//! - The HTML pages (login, first-run password change, monitor, admin)
//! - `/capture`, `/stream` and `/status`, bridged from the blocking capture
//!   code in `beecounter-core` onto streaming response bodies
//! - The collection, image, camera-settings and Edge Impulse APIs
//! - Server-Sent Events on `/events` for live dashboard updates
//! - Stream statistics
//!
//! ## Usage
//!
//! ```rust,ignore
//! use beecounter_web::{create_router, ServerState};
//!
//! let hub = EventHub::new();
//! let device = Arc::new(Device::new(parts_with_notifier(hub.clone()))?);
//! let state = Arc::new(ServerState::new(device, hub, uploader));
//! let app = create_router(state);
//!
//! let listener = TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, app).await?;
//! ```

pub mod error;
pub mod routes;
pub mod server_events;
pub mod session;
pub mod statistics;
pub mod transport;
pub mod uploader;

// Re-exports
pub use error::ApiError;
pub use routes::create_router;
pub use server_events::EventHub;
pub use uploader::{EdgeImpulseClient, TrainingUploader, UploadManager};

use std::sync::Arc;

use beecounter_core::Device;

use crate::statistics::StatisticsCollector;

/// Shared server state for all route handlers.
pub struct ServerState {
    pub device: Arc<Device>,
    pub events: EventHub,
    pub statistics: Arc<StatisticsCollector>,
    pub uploads: UploadManager,
}

impl ServerState {
    /// `events` must be the hub the device was built with.
    pub fn new(device: Arc<Device>, events: EventHub, uploader: Arc<dyn TrainingUploader>) -> Self {
        let uploads = UploadManager::new(uploader, device.clone());
        Self {
            device,
            events,
            statistics: Arc::new(StatisticsCollector::new()),
            uploads,
        }
    }
}

/// Type alias for shared state in Axum handlers.
pub type AppState = Arc<ServerState>;
