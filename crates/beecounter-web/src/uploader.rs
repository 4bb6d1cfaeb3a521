//! Edge Impulse training-data upload.
//!
//! One upload job at a time walks the image store and POSTs each JPEG to the
//! ingestion API, reporting progress as `ei_upload_status` events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use beecounter_core::events::UploadState;
use beecounter_core::{Device, DeviceError, DeviceEvent};
use futures::future::BoxFuture;
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Pause between files so the device keeps serving other requests.
pub const UPLOAD_PACING: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ingestion API returned HTTP {0}")]
    Status(u16),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("upload task failed: {0}")]
    Task(String),
}

/// Destination for labelled training images.
pub trait TrainingUploader: Send + Sync {
    fn upload<'a>(
        &'a self,
        api_key: &'a str,
        label: &'a str,
        file_name: &'a str,
        jpeg: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), UploadError>>;
}

/// Edge Impulse ingestion endpoint client.
pub struct EdgeImpulseClient {
    client: reqwest::Client,
    url: String,
}

impl EdgeImpulseClient {
    pub fn new(url: impl Into<String>) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl TrainingUploader for EdgeImpulseClient {
    fn upload<'a>(
        &'a self,
        api_key: &'a str,
        label: &'a str,
        file_name: &'a str,
        jpeg: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), UploadError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.url)
                .header("x-api-key", api_key)
                .header("x-file-name", file_name)
                .header("x-label", label)
                .header(CONTENT_TYPE, "image/jpeg")
                .body(jpeg)
                .send()
                .await?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(UploadError::Status(status.as_u16()))
            }
        })
    }
}

/// Clears the busy flag however the job ends.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs at most one upload job.
pub struct UploadManager {
    uploader: Arc<dyn TrainingUploader>,
    device: Arc<Device>,
    busy: Arc<AtomicBool>,
}

impl UploadManager {
    pub fn new(uploader: Arc<dyn TrainingUploader>, device: Arc<Device>) -> Self {
        Self {
            uploader,
            device,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Validate and launch a background upload of every stored image.
    pub fn start(&self, label: &str) -> Result<JoinHandle<()>, DeviceError> {
        let label = label.trim();
        if label.is_empty() {
            return Err(DeviceError::Validation("Missing label".to_string()));
        }
        let api_key = self
            .device
            .ei_api_key()?
            .ok_or_else(|| DeviceError::Validation("API Key not set".to_string()))?;
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DeviceError::Conflict("Upload already in progress".to_string()));
        }

        let guard = BusyGuard(self.busy.clone());
        let uploader = self.uploader.clone();
        let device = self.device.clone();
        let label = label.to_string();
        info!(label = %label, "starting Edge Impulse upload");
        Ok(tokio::spawn(async move {
            let _guard = guard;
            let notifier = device.notifier().clone();
            match upload_all(uploader.as_ref(), &device, &api_key, &label).await {
                Ok(count) => {
                    info!(count, "Edge Impulse upload complete");
                    notifier.notify(DeviceEvent::upload(UploadState::Complete, "Upload complete!"));
                }
                Err((file, e)) => {
                    error!(file = %file, error = %e, "Edge Impulse upload failed");
                    let message = format!("Upload failed for {}: {}", file, e);
                    if let Err(log_err) = device.error_log().append(&message) {
                        warn!(error = %log_err, "could not write error log");
                    }
                    notifier.notify(DeviceEvent::upload(UploadState::Failed, message));
                }
            }
        }))
    }
}

async fn upload_all(
    uploader: &dyn TrainingUploader,
    device: &Arc<Device>,
    api_key: &str,
    label: &str,
) -> Result<usize, (String, UploadError)> {
    let listing = device.clone();
    let images = tokio::task::spawn_blocking(move || listing.list_images())
        .await
        .map_err(|e| ("/images".to_string(), UploadError::Task(e.to_string())))?
        .map_err(|e| ("/images".to_string(), e.into()))?;

    let total = images.len();
    let notifier = device.notifier().clone();
    for (index, image) in images.iter().enumerate() {
        notifier.notify(DeviceEvent::upload_progress(index + 1, total, &image.name));

        let reader = device.clone();
        let name = image.name.clone();
        let jpeg = tokio::task::spawn_blocking(move || reader.read_image(&name))
            .await
            .map_err(|e| (image.name.clone(), UploadError::Task(e.to_string())))?
            .map_err(|e| (image.name.clone(), e.into()))?;

        uploader
            .upload(api_key, label, &image.name, jpeg)
            .await
            .map_err(|e| (image.name.clone(), e))?;
        info!(file = %image.name, index = index + 1, total, "uploaded");
        tokio::time::sleep(UPLOAD_PACING).await;
    }
    Ok(total)
}
