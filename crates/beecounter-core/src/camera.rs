//! Frame source abstraction.
//!
//! A [`FrameSource`] hands out [`FrameBuffer`]s that stay owned by the sensor
//! driver until they are given back with [`FrameSource::release`]. Handlers
//! never call `release` themselves; they hold a [`crate::FrameGuard`] which
//! returns the buffer on every exit path.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sensor::SensorControl;

/// Errors reported by a frame source or sensor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CameraError {
    /// The sensor was never initialized (or initialization failed at boot).
    #[error("Camera not initialized")]
    NotInitialized,

    /// The driver did not deliver a frame within its internal timeout.
    #[error("Camera capture failed: {0}")]
    CaptureFailed(String),

    /// A sensor register write was rejected.
    #[error("Sensor rejected setting {name}: {reason}")]
    SettingRejected { name: String, reason: String },
}

/// Pixel layout of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Jpeg,
    Rgb565,
    Rgb888,
    Grayscale,
    Yuv422,
}

impl PixelFormat {
    /// Bytes per pixel for uncompressed formats.
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Jpeg => None,
            PixelFormat::Rgb565 | PixelFormat::Yuv422 => Some(2),
            PixelFormat::Rgb888 => Some(3),
            PixelFormat::Grayscale => Some(1),
        }
    }

    /// Parse a format name as used in configuration (`jpeg`, `rgb565`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Some(PixelFormat::Jpeg),
            "rgb565" => Some(PixelFormat::Rgb565),
            "rgb888" => Some(PixelFormat::Rgb888),
            "grayscale" | "gray" => Some(PixelFormat::Grayscale),
            "yuv422" => Some(PixelFormat::Yuv422),
            _ => None,
        }
    }
}

/// Pixel storage behind a frame buffer.
enum FramePayload {
    /// Heap memory owned by the frame itself (simulated sensors).
    Owned(Vec<u8>),
    /// Memory owned by the sensor driver's frame pool.
    Driver { ptr: *const u8, len: usize },
}

/// A captured frame.
///
/// Not `Clone`: exactly one owner exists at a time, and handing the buffer
/// to [`FrameSource::release`] consumes it so it can never be read again.
pub struct FrameBuffer {
    token: usize,
    width: u32,
    height: u32,
    format: PixelFormat,
    payload: FramePayload,
}

// SAFETY: driver frame memory is only accessed by the single owner of the
// FrameBuffer and stays valid until the buffer is released.
unsafe impl Send for FrameBuffer {}

impl FrameBuffer {
    /// Create a frame backed by heap memory.
    ///
    /// `token` identifies the buffer to its source on release.
    pub fn owned(token: usize, width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            token,
            width,
            height,
            format,
            payload: FramePayload::Owned(data),
        }
    }

    /// Create a frame that borrows driver-owned memory.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` readable bytes that stay valid and unmodified
    /// until this frame is passed back to the source that created it.
    pub unsafe fn from_driver(
        token: usize,
        width: u32,
        height: u32,
        format: PixelFormat,
        ptr: *const u8,
        len: usize,
    ) -> Self {
        Self {
            token,
            width,
            height,
            format,
            payload: FramePayload::Driver { ptr, len },
        }
    }

    pub fn token(&self) -> usize {
        self.token
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn is_jpeg(&self) -> bool {
        self.format == PixelFormat::Jpeg
    }

    /// Length of the pixel data in bytes.
    pub fn len(&self) -> usize {
        match &self.payload {
            FramePayload::Owned(data) => data.len(),
            FramePayload::Driver { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw pixel (or JPEG) bytes.
    pub fn bytes(&self) -> &[u8] {
        match &self.payload {
            FramePayload::Owned(data) => data,
            // SAFETY: guaranteed by the `from_driver` contract.
            FramePayload::Driver { ptr, len } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
        }
    }

    /// Take back heap storage, if any. Used by simulated sources on release.
    pub fn into_owned_data(self) -> Option<Vec<u8>> {
        match self.payload {
            FramePayload::Owned(data) => Some(data),
            FramePayload::Driver { .. } => None,
        }
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("token", &self.token)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("len", &self.len())
            .finish()
    }
}

/// Source of camera frames.
///
/// `acquire` must be bounded by the driver's own timeout and fail instead of
/// hanging; callers run under a hardware watchdog.
pub trait FrameSource: Send + Sync {
    /// Take one frame from the sensor. Ownership moves to the caller.
    fn acquire(&self) -> Result<FrameBuffer, CameraError>;

    /// Return a frame to the sensor's pool.
    fn release(&self, frame: FrameBuffer);
}

/// A complete camera: frame source plus sensor register control, both views
/// of the same driver.
#[derive(Clone)]
pub struct CameraHandle {
    pub frames: Arc<dyn FrameSource>,
    pub sensor: Arc<dyn SensorControl>,
}

impl CameraHandle {
    pub fn new<C: FrameSource + SensorControl + 'static>(camera: Arc<C>) -> Self {
        Self {
            frames: camera.clone(),
            sensor: camera,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_frame_accessors() {
        let frame = FrameBuffer::owned(7, 2, 1, PixelFormat::Rgb888, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(frame.token(), 7);
        assert_eq!(frame.len(), 6);
        assert_eq!(frame.bytes(), &[1, 2, 3, 4, 5, 6]);
        assert!(!frame.is_jpeg());
        assert_eq!(frame.into_owned_data(), Some(vec![1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn test_driver_frame_reads_borrowed_memory() {
        let pool = vec![0xFFu8, 0xD8, 0xFF, 0xD9];
        let frame = unsafe {
            FrameBuffer::from_driver(1, 1, 1, PixelFormat::Jpeg, pool.as_ptr(), pool.len())
        };
        assert_eq!(frame.bytes(), &pool[..]);
        assert!(frame.is_jpeg());
        assert_eq!(frame.into_owned_data(), None);
    }

    #[test]
    fn test_pixel_format_names() {
        assert_eq!(PixelFormat::from_name("RGB565"), Some(PixelFormat::Rgb565));
        assert_eq!(PixelFormat::from_name("jpg"), Some(PixelFormat::Jpeg));
        assert_eq!(PixelFormat::from_name("bayer"), None);
        assert_eq!(PixelFormat::Rgb565.bytes_per_pixel(), Some(2));
        assert_eq!(PixelFormat::Jpeg.bytes_per_pixel(), None);
    }
}
