//! Live-view statistics.
//!
//! Tracks what the camera endpoints have served:
//! - Frames and bytes sent (captures and stream parts)
//! - Currently open multipart streams
//! - Interval between the last two stream frames, and the FPS it implies
//! - Server uptime
//!
//! Reported at `GET /api/statistics`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use beecounter_core::capture::FrameSent;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatistics {
    pub frames_served: u64,
    pub bytes_served: u64,
    pub captures: u64,
    pub active_streams: usize,
    pub sse_clients: usize,
    pub last_frame_interval_ms: f64,
    pub fps: f64,
    /// Server uptime in seconds.
    pub uptime: u64,
}

/// Collects live-view statistics.
pub struct StatisticsCollector {
    start_time: Instant,
    frames_served: AtomicU64,
    bytes_served: AtomicU64,
    captures: AtomicU64,
    active_streams: AtomicUsize,
    /// Microseconds between the last two stream frames.
    last_interval_us: AtomicU64,
}

impl StatisticsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            frames_served: AtomicU64::new(0),
            bytes_served: AtomicU64::new(0),
            captures: AtomicU64::new(0),
            active_streams: AtomicUsize::new(0),
            last_interval_us: AtomicU64::new(0),
        }
    }

    /// Record a single-frame response (`/capture`, polling `/stream`).
    pub fn record_capture(&self, bytes: usize) {
        self.captures.fetch_add(1, Ordering::Relaxed);
        self.frames_served.fetch_add(1, Ordering::Relaxed);
        self.bytes_served.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record one part of a multipart stream.
    pub fn record_frame(&self, frame: &FrameSent) {
        self.frames_served.fetch_add(1, Ordering::Relaxed);
        self.bytes_served.fetch_add(frame.bytes as u64, Ordering::Relaxed);
        if frame.sequence > 1 {
            self.last_interval_us
                .store(frame.interval.as_micros() as u64, Ordering::Relaxed);
        }
    }

    pub fn stream_opened(&self) {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_closed(&self) {
        let _ = self
            .active_streams
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn snapshot(&self, sse_clients: usize) -> StreamStatistics {
        let interval_us = self.last_interval_us.load(Ordering::Relaxed);
        let fps = if interval_us > 0 {
            1_000_000.0 / interval_us as f64
        } else {
            0.0
        };
        StreamStatistics {
            frames_served: self.frames_served.load(Ordering::Relaxed),
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
            captures: self.captures.load(Ordering::Relaxed),
            active_streams: self.active_streams.load(Ordering::Relaxed),
            sse_clients,
            last_frame_interval_ms: interval_us as f64 / 1000.0,
            fps,
            uptime: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_frame_statistics() {
        let stats = StatisticsCollector::new();

        stats.record_capture(1_000);
        stats.record_frame(&FrameSent {
            sequence: 1,
            bytes: 500,
            interval: Duration::ZERO,
        });
        stats.record_frame(&FrameSent {
            sequence: 2,
            bytes: 500,
            interval: Duration::from_millis(100),
        });

        let snapshot = stats.snapshot(0);
        assert_eq!(snapshot.frames_served, 3);
        assert_eq!(snapshot.bytes_served, 2_000);
        assert_eq!(snapshot.captures, 1);
        assert_eq!(snapshot.last_frame_interval_ms, 100.0);
        assert_eq!(snapshot.fps, 10.0);
    }

    #[test]
    fn test_stream_tracking() {
        let stats = StatisticsCollector::new();

        stats.stream_opened();
        stats.stream_opened();
        assert_eq!(stats.snapshot(0).active_streams, 2);

        stats.stream_closed();
        stats.stream_closed();
        stats.stream_closed();
        assert_eq!(stats.snapshot(0).active_streams, 0);
    }
}
