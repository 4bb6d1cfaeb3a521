//! Automated image collection.
//!
//! [`CollectionJob`] is the pure state machine (IDLE / COLLECTING);
//! [`Collector`] drives it from the scheduler, taking the sample outside the
//! job lock so that status requests and `stop()` never wait on the camera.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::camera::{CameraError, FrameSource};
use crate::clock::Clock;
use crate::error::DeviceError;
use crate::events::{CollectionProgress, CollectionState, DeviceEvent, Notifier};
use crate::frame::FrameGuard;
use crate::storage::{ErrorLog, ImageStore, StoredImage};
use crate::encode;

/// Outcome of recording one successful sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Progress(CollectionProgress),
    /// The target was reached with this sample; the job is now idle.
    Completed(CollectionProgress),
}

/// Serializable view of the job for status endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CollectionSnapshot {
    pub active: bool,
    pub collected: u32,
    pub target: u32,
    pub interval_ms: u64,
    /// Milliseconds until the next sample, when active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_sample_in_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CollectionJob {
    active: bool,
    collected: u32,
    target: u32,
    interval_ms: u64,
    last_sample_ms: u64,
    /// Bumped on every start/stop so an in-flight sample can tell that the
    /// run it belongs to has ended.
    generation: u64,
}

impl CollectionJob {
    pub fn new(target: u32, interval_ms: u64) -> Self {
        Self {
            active: false,
            collected: 0,
            target,
            interval_ms,
            last_sample_ms: 0,
            generation: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn collected(&self) -> u32 {
        self.collected
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Begin a run. Returns `false` (and changes nothing) if already running.
    pub fn start(&mut self, now_ms: u64) -> bool {
        if self.active {
            return false;
        }
        self.active = true;
        self.collected = 0;
        self.last_sample_ms = now_ms;
        self.generation += 1;
        true
    }

    /// End the run early, keeping the count. Returns `false` if idle.
    pub fn stop(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        self.generation += 1;
        true
    }

    /// A sample is due: running, below target and a full interval elapsed.
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.active
            && self.collected < self.target
            && now_ms.saturating_sub(self.last_sample_ms) >= self.interval_ms
    }

    pub fn record_success(&mut self, now_ms: u64) -> TickOutcome {
        self.last_sample_ms = now_ms;
        self.collected = (self.collected + 1).min(self.target);
        let progress = CollectionProgress::new(self.collected, self.target);
        if self.collected >= self.target {
            self.active = false;
            self.generation += 1;
            TickOutcome::Completed(progress)
        } else {
            TickOutcome::Progress(progress)
        }
    }

    /// A failed sample still uses up its slot; the retry is one interval later.
    pub fn record_failure(&mut self, now_ms: u64) {
        self.last_sample_ms = now_ms;
    }

    pub fn snapshot(&self, now_ms: u64) -> CollectionSnapshot {
        let next = self.active.then(|| {
            (self.last_sample_ms + self.interval_ms).saturating_sub(now_ms)
        });
        CollectionSnapshot {
            active: self.active,
            collected: self.collected,
            target: self.target,
            interval_ms: self.interval_ms,
            next_sample_in_ms: next,
        }
    }
}

/// Runs the collection job against a camera and image store.
pub struct Collector {
    job: Mutex<CollectionJob>,
    camera: Option<Arc<dyn FrameSource>>,
    images: Arc<ImageStore>,
    notifier: Arc<dyn Notifier>,
    error_log: Arc<ErrorLog>,
    clock: Arc<dyn Clock>,
    quality: u8,
}

impl Collector {
    pub fn new(
        job: CollectionJob,
        camera: Option<Arc<dyn FrameSource>>,
        images: Arc<ImageStore>,
        notifier: Arc<dyn Notifier>,
        error_log: Arc<ErrorLog>,
        clock: Arc<dyn Clock>,
        quality: u8,
    ) -> Self {
        Self {
            job: Mutex::new(job),
            camera,
            images,
            notifier,
            error_log,
            clock,
            quality,
        }
    }

    fn with_job<T>(&self, f: impl FnOnce(&mut CollectionJob) -> T) -> Result<T, DeviceError> {
        let mut job = self
            .job
            .lock()
            .map_err(|_| DeviceError::Conflict("collection state poisoned".to_string()))?;
        Ok(f(&mut job))
    }

    pub fn start(&self) -> Result<bool, DeviceError> {
        let now = self.clock.uptime_ms();
        let started = self.with_job(|job| job.start(now))?;
        if started {
            info!("automated collection started");
            self.notifier.notify(DeviceEvent::CollectionStatus {
                state: CollectionState::Started,
            });
        }
        Ok(started)
    }

    pub fn stop(&self) -> Result<bool, DeviceError> {
        let stopped = self.with_job(|job| job.stop())?;
        if stopped {
            info!("automated collection stopped");
            self.notifier.notify(DeviceEvent::CollectionStatus {
                state: CollectionState::Stopped,
            });
        }
        Ok(stopped)
    }

    pub fn snapshot(&self) -> Result<CollectionSnapshot, DeviceError> {
        let now = self.clock.uptime_ms();
        self.with_job(|job| job.snapshot(now))
    }

    /// Acquire, persist and release one frame.
    fn sample(&self) -> Result<StoredImage, DeviceError> {
        let camera = self.camera.as_deref().ok_or(CameraError::NotInitialized)?;
        let frame = FrameGuard::acquire(camera)?;
        let jpeg = encode::jpeg_bytes(&frame, self.quality)?;
        let stored = self.images.save(self.clock.unix_time(), &jpeg)?;
        drop(jpeg);
        frame.release();
        Ok(stored)
    }

    /// Called on every scheduler pass; acts at most once per interval.
    pub fn tick(&self) -> Result<Option<TickOutcome>, DeviceError> {
        let now = self.clock.uptime_ms();
        let generation = self.with_job(|job| job.is_due(now).then(|| job.generation()))?;
        let Some(generation) = generation else {
            return Ok(None);
        };

        let result = self.sample();
        self.settle(generation, result)
    }

    /// Account a finished sample against the run identified by `generation`.
    ///
    /// A sample whose run was stopped or restarted meanwhile is not counted,
    /// and its image is removed from the store.
    fn settle(
        &self,
        generation: u64,
        result: Result<StoredImage, DeviceError>,
    ) -> Result<Option<TickOutcome>, DeviceError> {
        let now = self.clock.uptime_ms();

        let outcome = self.with_job(|job| {
            if job.generation() != generation {
                return None;
            }
            Some(match &result {
                Ok(_) => Some(job.record_success(now)),
                Err(_) => {
                    job.record_failure(now);
                    None
                }
            })
        })?;

        let Some(outcome) = outcome else {
            debug!("collection run ended while sampling; sample discarded");
            if let Ok(image) = &result {
                if let Err(e) = self.images.delete(&image.name) {
                    warn!(name = %image.name, error = %e, "could not remove discarded sample");
                }
            }
            return Ok(None);
        };

        match (&result, outcome) {
            (Err(e), _) => {
                warn!(error = %e, "collection sample failed");
                if let Err(log_err) = self.error_log.append(&format!("Data collection failed: {}", e)) {
                    warn!(error = %log_err, "could not write error log");
                }
                Ok(None)
            }
            (Ok(image), Some(TickOutcome::Progress(progress))) => {
                info!(name = %image.name, collected = progress.collected, total = progress.total, "collection sample saved");
                self.notifier.notify(DeviceEvent::CollectionUpdate(progress));
                Ok(Some(TickOutcome::Progress(progress)))
            }
            (Ok(image), Some(TickOutcome::Completed(progress))) => {
                info!(name = %image.name, total = progress.total, "collection complete");
                self.notifier.notify(DeviceEvent::CollectionUpdate(progress));
                self.notifier.notify(DeviceEvent::CollectionStatus {
                    state: CollectionState::Complete,
                });
                Ok(Some(TickOutcome::Completed(progress)))
            }
            (Ok(_), None) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::PixelFormat;
    use crate::clock::ManualClock;
    use crate::events::testing::RecordingNotifier;
    use crate::sensor::{FrameSize, SensorSetting, SensorStatus};
    use crate::simulated::SimulatedCamera;
    use pretty_assertions::assert_eq;

    const INTERVAL: u64 = 1_000;

    struct Fixture {
        _dir: tempfile::TempDir,
        camera: Arc<SimulatedCamera>,
        clock: ManualClock,
        notifier: Arc<RecordingNotifier>,
        images: Arc<ImageStore>,
        collector: Collector,
    }

    fn fixture(target: u32) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut status = SensorStatus::default();
        status.apply(SensorSetting::FrameSize(FrameSize::R96x96));
        let camera = Arc::new(SimulatedCamera::with_status(PixelFormat::Grayscale, status));
        let clock = ManualClock::new(0, 1_700_000_000);
        let notifier = Arc::new(RecordingNotifier::default());
        let images = Arc::new(ImageStore::open(dir.path().join("images")).unwrap());
        let error_log = Arc::new(ErrorLog::new(dir.path().join("error.log"), Arc::new(clock.clone())));
        let collector = Collector::new(
            CollectionJob::new(target, INTERVAL),
            Some(camera.clone() as Arc<dyn FrameSource>),
            images.clone(),
            notifier.clone(),
            error_log,
            Arc::new(clock.clone()),
            80,
        );
        Fixture {
            _dir: dir,
            camera,
            clock,
            notifier,
            images,
            collector,
        }
    }

    #[test]
    fn test_job_respects_interval() {
        let mut job = CollectionJob::new(3, INTERVAL);
        assert!(!job.is_due(10_000));
        assert!(job.start(100));
        assert!(!job.is_due(100 + INTERVAL - 1));
        assert!(job.is_due(100 + INTERVAL));
        assert!(!job.start(200));
    }

    #[test]
    fn test_job_never_exceeds_target() {
        let mut job = CollectionJob::new(2, INTERVAL);
        job.start(0);
        assert!(matches!(job.record_success(1_000), TickOutcome::Progress(_)));
        assert!(matches!(job.record_success(2_000), TickOutcome::Completed(_)));
        assert!(!job.is_active());
        assert!(!job.is_due(10_000));
        assert_eq!(job.collected(), 2);
    }

    #[test]
    fn test_full_run_completes_once() {
        let f = fixture(50);
        f.collector.start().unwrap();
        let mut completed = 0;
        for _ in 0..50 {
            // A tick between intervals does nothing.
            f.clock.advance_ms(INTERVAL / 2);
            assert_eq!(f.collector.tick().unwrap(), None);
            f.clock.advance_ms(INTERVAL / 2);
            if let Some(TickOutcome::Completed(_)) = f.collector.tick().unwrap() {
                completed += 1;
            }
        }
        f.clock.advance_ms(INTERVAL * 5);
        assert_eq!(f.collector.tick().unwrap(), None);

        assert_eq!(completed, 1);
        let snapshot = f.collector.snapshot().unwrap();
        assert!(!snapshot.active);
        assert_eq!(snapshot.collected, 50);
        assert_eq!(f.notifier.named("collection_update").len(), 50);
        let statuses = f.notifier.named("collection_status");
        assert_eq!(
            statuses.last(),
            Some(&DeviceEvent::CollectionStatus {
                state: CollectionState::Complete
            })
        );
        assert_eq!(
            statuses
                .iter()
                .filter(|e| matches!(e, DeviceEvent::CollectionStatus { state: CollectionState::Complete }))
                .count(),
            1
        );
        assert_eq!(f.images.list().unwrap().len(), 50);
        assert_eq!(f.camera.acquired(), f.camera.released());
    }

    #[test]
    fn test_stop_keeps_count_and_start_resets() {
        let f = fixture(50);
        f.collector.start().unwrap();
        for _ in 0..3 {
            f.clock.advance_ms(INTERVAL);
            f.collector.tick().unwrap();
        }
        assert!(f.collector.stop().unwrap());
        f.clock.advance_ms(INTERVAL * 10);
        assert_eq!(f.collector.tick().unwrap(), None);
        assert_eq!(f.collector.snapshot().unwrap().collected, 3);

        f.collector.start().unwrap();
        assert_eq!(f.collector.snapshot().unwrap().collected, 0);
    }

    #[test]
    fn test_failed_sample_retries_next_interval() {
        let f = fixture(5);
        f.collector.start().unwrap();
        f.camera.fail_next_acquisitions(1);
        f.clock.advance_ms(INTERVAL);
        assert_eq!(f.collector.tick().unwrap(), None);
        assert!(f.collector.snapshot().unwrap().active);
        assert_eq!(f.collector.snapshot().unwrap().collected, 0);

        // Not retried before a full interval has passed.
        f.clock.advance_ms(INTERVAL - 1);
        assert_eq!(f.collector.tick().unwrap(), None);
        f.clock.advance_ms(1);
        assert!(matches!(f.collector.tick().unwrap(), Some(TickOutcome::Progress(_))));
        assert_eq!(f.camera.outstanding(), 0);
    }

    #[test]
    fn test_sample_from_stopped_run_is_discarded() {
        let f = fixture(5);
        f.collector.start().unwrap();
        f.clock.advance_ms(INTERVAL);
        let generation = f.collector.with_job(|job| job.generation()).unwrap();
        let sample = f.collector.sample();
        assert!(sample.is_ok());
        assert_eq!(f.images.list().unwrap().len(), 1);

        f.collector.stop().unwrap();
        assert_eq!(f.collector.settle(generation, sample).unwrap(), None);
        assert!(f.images.list().unwrap().is_empty());
        assert_eq!(f.collector.snapshot().unwrap().collected, 0);
        assert!(f.notifier.named("collection_update").is_empty());
    }

    #[test]
    fn test_encode_failure_releases_frame() {
        let f = fixture(5);
        f.collector.start().unwrap();
        f.camera.corrupt_next_frames(1);
        f.clock.advance_ms(INTERVAL);
        assert_eq!(f.collector.tick().unwrap(), None);
        assert_eq!(f.camera.acquired(), 1);
        assert_eq!(f.camera.released(), 1);
        assert!(f.images.list().unwrap().is_empty());
    }
}
