//! Simulated camera sensor for host builds and tests.
//!
//! Produces a moving test pattern at the configured frame size and pixel
//! format and keeps acquire/release bookkeeping so callers can verify that
//! every frame handed out comes back exactly once.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::camera::{CameraError, FrameBuffer, FrameSource, PixelFormat};
use crate::encode;
use crate::sensor::{SensorControl, SensorSetting, SensorStatus};

/// Product id reported by the simulated sensor (OV3660).
pub const SIMULATED_SENSOR_ID: u16 = 0x3660;

pub struct SimulatedCamera {
    format: PixelFormat,
    status: Mutex<SensorStatus>,
    outstanding: Mutex<HashSet<usize>>,
    next_token: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
    double_releases: AtomicUsize,
    fail_acquisitions: AtomicUsize,
    corrupt_frames: AtomicUsize,
}

impl SimulatedCamera {
    pub fn new(format: PixelFormat) -> Self {
        Self::with_status(format, SensorStatus::default())
    }

    pub fn with_status(format: PixelFormat, status: SensorStatus) -> Self {
        Self {
            format,
            status: Mutex::new(status),
            outstanding: Mutex::new(HashSet::new()),
            next_token: AtomicUsize::new(1),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            double_releases: AtomicUsize::new(0),
            fail_acquisitions: AtomicUsize::new(0),
            corrupt_frames: AtomicUsize::new(0),
        }
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Make the next `count` acquisitions fail as a driver timeout would.
    pub fn fail_next_acquisitions(&self, count: usize) {
        self.fail_acquisitions.store(count, Ordering::SeqCst);
    }

    /// Deliver the next `count` frames truncated so that transcoding fails.
    ///
    /// Has no effect on JPEG output, which is passed through untouched.
    pub fn corrupt_next_frames(&self, count: usize) {
        self.corrupt_frames.store(count, Ordering::SeqCst);
    }

    /// Successful acquisitions so far.
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Frames returned so far.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Frames currently held by callers.
    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().map(|set| set.len()).unwrap_or(0)
    }

    /// Releases of a token that was not outstanding.
    pub fn double_releases(&self) -> usize {
        self.double_releases.load(Ordering::SeqCst)
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn render(&self, token: usize, width: u32, height: u32) -> Vec<u8> {
        let mut rgb = Vec::with_capacity((width * height * 3) as usize);
        let shift = (token as u32).wrapping_mul(8);
        for y in 0..height {
            for x in 0..width {
                let bar = ((x + shift) / 32) % 8;
                rgb.push(if bar & 1 != 0 { 0xF0 } else { (x % 256) as u8 });
                rgb.push(if bar & 2 != 0 { 0xC0 } else { (y % 256) as u8 });
                rgb.push(if bar & 4 != 0 { 0x30 } else { 0x80 });
            }
        }
        rgb
    }

    fn pack(&self, rgb: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>, CameraError> {
        let data = match self.format {
            PixelFormat::Rgb888 => rgb.to_vec(),
            PixelFormat::Grayscale => rgb
                .chunks_exact(3)
                .map(|p| ((p[0] as u16 * 77 + p[1] as u16 * 150 + p[2] as u16 * 29) >> 8) as u8)
                .collect(),
            PixelFormat::Rgb565 => rgb
                .chunks_exact(3)
                .flat_map(|p| {
                    let v = ((p[0] as u16 & 0xF8) << 8) | ((p[1] as u16 & 0xFC) << 3) | (p[2] as u16 >> 3);
                    v.to_be_bytes()
                })
                .collect(),
            PixelFormat::Yuv422 => rgb
                .chunks_exact(6)
                .flat_map(|p| {
                    let (y0, u, v) = encode::rgb_to_yuv(p[0], p[1], p[2]);
                    let (y1, _, _) = encode::rgb_to_yuv(p[3], p[4], p[5]);
                    [y0, u, y1, v]
                })
                .collect(),
            PixelFormat::Jpeg => {
                // Sensor quality runs 0 (best) to 63; map it onto the encoder's 1..=100.
                let jpeg_quality = 100u8.saturating_sub(quality.min(63)).max(10);
                encode::encode_rgb(rgb, width, height, jpeg_quality)
                    .map_err(|e| CameraError::CaptureFailed(e.to_string()))?
            }
        };
        Ok(data)
    }
}

impl FrameSource for SimulatedCamera {
    fn acquire(&self) -> Result<FrameBuffer, CameraError> {
        if Self::take_one(&self.fail_acquisitions) {
            warn!("simulated sensor timeout");
            return Err(CameraError::CaptureFailed("frame timeout".to_string()));
        }

        let status = self
            .status
            .lock()
            .map_err(|_| CameraError::CaptureFailed("sensor state poisoned".to_string()))?
            .clone();
        let (width, height) = status.frame_size().dimensions();
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);

        let rgb = self.render(token, width, height);
        let mut data = self.pack(&rgb, width, height, status.quality)?;
        if self.format != PixelFormat::Jpeg && Self::take_one(&self.corrupt_frames) {
            data.truncate(data.len() / 2);
        }

        if let Ok(mut outstanding) = self.outstanding.lock() {
            outstanding.insert(token);
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        debug!(token, width, height, len = data.len(), "simulated frame");

        Ok(FrameBuffer::owned(token, width, height, self.format, data))
    }

    fn release(&self, frame: FrameBuffer) {
        let token = frame.token();
        let was_outstanding = self
            .outstanding
            .lock()
            .map(|mut set| set.remove(&token))
            .unwrap_or(false);
        if was_outstanding {
            self.released.fetch_add(1, Ordering::SeqCst);
        } else {
            warn!(token, "frame released twice");
            self.double_releases.fetch_add(1, Ordering::SeqCst);
        }
        drop(frame.into_owned_data());
    }
}

impl SensorControl for SimulatedCamera {
    fn status(&self) -> Result<SensorStatus, CameraError> {
        self.status
            .lock()
            .map(|status| status.clone())
            .map_err(|_| CameraError::CaptureFailed("sensor state poisoned".to_string()))
    }

    fn apply(&self, setting: SensorSetting) -> Result<(), CameraError> {
        let mut status = self.status.lock().map_err(|_| CameraError::SettingRejected {
            name: setting.name().to_string(),
            reason: "sensor state poisoned".to_string(),
        })?;
        status.apply(setting);
        debug!(setting = setting.name(), "simulated sensor register written");
        Ok(())
    }

    fn sensor_id(&self) -> u16 {
        SIMULATED_SENSOR_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::FrameSize;

    fn small(format: PixelFormat) -> SimulatedCamera {
        let mut status = SensorStatus::default();
        status.apply(SensorSetting::FrameSize(FrameSize::Qqvga));
        SimulatedCamera::with_status(format, status)
    }

    #[test]
    fn test_frame_sizes_follow_sensor() {
        let camera = small(PixelFormat::Rgb565);
        let frame = camera.acquire().unwrap();
        assert_eq!((frame.width(), frame.height()), (160, 120));
        assert_eq!(frame.len(), 160 * 120 * 2);
        camera.release(frame);
    }

    #[test]
    fn test_jpeg_frames_have_markers() {
        let camera = small(PixelFormat::Jpeg);
        let frame = camera.acquire().unwrap();
        assert_eq!(&frame.bytes()[..2], &[0xFF, 0xD8]);
        assert!(frame.is_jpeg());
        camera.release(frame);
        assert_eq!(camera.outstanding(), 0);
    }

    #[test]
    fn test_double_release_detected() {
        let camera = small(PixelFormat::Grayscale);
        let frame = camera.acquire().unwrap();
        let token = frame.token();
        camera.release(frame);
        camera.release(FrameBuffer::owned(token, 1, 1, PixelFormat::Grayscale, vec![0]));
        assert_eq!(camera.released(), 1);
        assert_eq!(camera.double_releases(), 1);
    }

    #[test]
    fn test_failure_injection_counts_down() {
        let camera = small(PixelFormat::Grayscale);
        camera.fail_next_acquisitions(2);
        assert!(camera.acquire().is_err());
        assert!(camera.acquire().is_err());
        let frame = camera.acquire().unwrap();
        camera.release(frame);
        assert_eq!(camera.acquired(), 1);
    }

    #[test]
    fn test_corrupt_frame_is_short() {
        let camera = small(PixelFormat::Rgb888);
        camera.corrupt_next_frames(1);
        let frame = camera.acquire().unwrap();
        assert_eq!(frame.len(), 160 * 120 * 3 / 2);
        camera.release(frame);
    }
}
