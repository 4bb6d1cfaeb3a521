//! Scoped frame-buffer ownership.
//!
//! Every frame taken from a [`FrameSource`] is wrapped in a [`FrameGuard`].
//! The guard releases the frame exactly once: either explicitly through
//! [`FrameGuard::release`] or when it goes out of scope on any other path
//! (early return, `?`, transport error, panic unwinding).

use std::ops::Deref;

use tracing::trace;

use crate::camera::{CameraError, FrameBuffer, FrameSource};

/// Exclusive, self-releasing handle to a captured frame.
pub struct FrameGuard<'a> {
    source: &'a dyn FrameSource,
    frame: Option<FrameBuffer>,
}

impl<'a> FrameGuard<'a> {
    /// Acquire a frame from `source` and take scoped ownership of it.
    pub fn acquire(source: &'a dyn FrameSource) -> Result<Self, CameraError> {
        let frame = source.acquire()?;
        trace!(token = frame.token(), len = frame.len(), "frame acquired");
        Ok(Self {
            source,
            frame: Some(frame),
        })
    }

    /// Hand the frame back to the source now instead of at scope end.
    pub fn release(mut self) {
        self.give_back();
    }

    fn give_back(&mut self) {
        if let Some(frame) = self.frame.take() {
            trace!(token = frame.token(), "frame released");
            self.source.release(frame);
        }
    }
}

impl Deref for FrameGuard<'_> {
    type Target = FrameBuffer;

    fn deref(&self) -> &FrameBuffer {
        // Only `release(self)` and `drop` empty the slot, and both consume
        // the guard, so a live guard always holds its frame.
        match &self.frame {
            Some(frame) => frame,
            None => unreachable!("frame guard used after release"),
        }
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.give_back();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::PixelFormat;
    use crate::simulated::SimulatedCamera;

    fn failing() -> Result<(), CameraError> {
        Err(CameraError::CaptureFailed("synthetic".to_string()))
    }

    fn early_return(camera: &SimulatedCamera) -> Result<usize, CameraError> {
        let frame = FrameGuard::acquire(camera)?;
        let len = frame.len();
        failing()?;
        Ok(len)
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let camera = SimulatedCamera::new(PixelFormat::Grayscale);
        {
            let frame = FrameGuard::acquire(&camera).unwrap();
            assert!(frame.len() > 0);
            assert_eq!(camera.outstanding(), 1);
        }
        assert_eq!(camera.acquired(), 1);
        assert_eq!(camera.released(), 1);
        assert_eq!(camera.outstanding(), 0);
    }

    #[test]
    fn test_explicit_release_happens_once() {
        let camera = SimulatedCamera::new(PixelFormat::Jpeg);
        let frame = FrameGuard::acquire(&camera).unwrap();
        frame.release();
        assert_eq!(camera.released(), 1);
        assert_eq!(camera.double_releases(), 0);
    }

    #[test]
    fn test_guard_releases_on_error_path() {
        let camera = SimulatedCamera::new(PixelFormat::Rgb565);
        assert!(early_return(&camera).is_err());
        assert_eq!(camera.acquired(), 1);
        assert_eq!(camera.released(), 1);
    }

    #[test]
    fn test_failed_acquire_needs_no_release() {
        let camera = SimulatedCamera::new(PixelFormat::Jpeg);
        camera.fail_next_acquisitions(1);
        assert!(FrameGuard::acquire(&camera).is_err());
        assert_eq!(camera.acquired(), 0);
        assert_eq!(camera.released(), 0);
    }
}
