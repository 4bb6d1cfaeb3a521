//! Device events pushed to browsers.
//!
//! Every event has a name (the SSE `event:` field) and a JSON payload:
//!
//! ```json
//! performance_update  { "cpu_core_0": 12.5, "cpu_core_1": 3.0, "heap_used": 81234, ... }
//! collection_update   { "progress": 42, "collected": 21, "total": 50 }
//! collection_status   { "state": "complete" }
//! ei_upload_status    { "state": "uploading", "message": "Uploading img-1.jpg (1/3)", ... }
//! ```

use serde::{Deserialize, Serialize};

/// System resource snapshot for `performance_update`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    /// Busy percentage of core 0.
    pub cpu_core_0: f32,
    /// Busy percentage of core 1.
    pub cpu_core_1: f32,
    pub heap_used: u64,
    pub heap_total: u64,
    pub flash_used: u64,
    pub flash_total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_rssi: Option<i32>,
    /// Die temperature in degrees Celsius.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_temp: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionProgress {
    /// Whole percent of the target reached.
    pub progress: u32,
    pub collected: u32,
    pub total: u32,
}

impl CollectionProgress {
    pub fn new(collected: u32, total: u32) -> Self {
        let progress = if total == 0 {
            100
        } else {
            collected.saturating_mul(100) / total
        };
        Self {
            progress,
            collected,
            total,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionState {
    Started,
    Stopped,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Uploading,
    Failed,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStatus {
    pub state: UploadState,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum DeviceEvent {
    PerformanceUpdate(PerformanceSnapshot),
    CollectionUpdate(CollectionProgress),
    CollectionStatus { state: CollectionState },
    EiUploadStatus(UploadStatus),
}

impl DeviceEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            DeviceEvent::PerformanceUpdate(_) => "performance_update",
            DeviceEvent::CollectionUpdate(_) => "collection_update",
            DeviceEvent::CollectionStatus { .. } => "collection_status",
            DeviceEvent::EiUploadStatus(_) => "ei_upload_status",
        }
    }

    /// JSON payload without the event name wrapper.
    pub fn payload_json(&self) -> String {
        let payload = match self {
            DeviceEvent::PerformanceUpdate(p) => serde_json::to_string(p),
            DeviceEvent::CollectionUpdate(p) => serde_json::to_string(p),
            DeviceEvent::CollectionStatus { state } => {
                serde_json::to_string(&serde_json::json!({ "state": state }))
            }
            DeviceEvent::EiUploadStatus(p) => serde_json::to_string(p),
        };
        payload.unwrap_or_else(|_| "{}".to_string())
    }

    pub fn upload(state: UploadState, message: impl Into<String>) -> Self {
        DeviceEvent::EiUploadStatus(UploadStatus {
            state,
            message: message.into(),
            current: None,
            total: None,
        })
    }

    pub fn upload_progress(current: usize, total: usize, file: &str) -> Self {
        DeviceEvent::EiUploadStatus(UploadStatus {
            state: UploadState::Uploading,
            message: format!("Uploading {} ({}/{})", file, current, total),
            current: Some(current),
            total: Some(total),
        })
    }
}

/// Receiver of device events (the SSE hub on the host, the ESP event
/// source on the device).
pub trait Notifier: Send + Sync {
    fn notify(&self, event: DeviceEvent);
}

/// Notifier that drops everything.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _event: DeviceEvent) {}
}

/// Source of resource figures for the performance reporter.
pub trait SystemMonitor: Send + Sync {
    fn snapshot(&self) -> PerformanceSnapshot;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Notifier that records every event.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub events: Mutex<Vec<DeviceEvent>>,
    }

    impl RecordingNotifier {
        pub fn named(&self, name: &str) -> Vec<DeviceEvent> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.name() == name)
                .cloned()
                .collect()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, event: DeviceEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}
