//! Capture and stream endpoint logic.
//!
//! The handlers here are transport-neutral: they write into a
//! [`ResponseSink`], which the axum layer bridges onto a streaming body and
//! the ESP-IDF layer onto `EspHttpConnection`. Every frame is held through a
//! [`FrameGuard`], so the source gets it back on success, encode failure and
//! write failure alike.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::camera::{CameraError, FrameSource};
use crate::encode::{self, EncodeError};
use crate::error::DeviceError;
use crate::frame::FrameGuard;

/// Multipart boundary between stream parts.
pub const STREAM_BOUNDARY: &str = "123456789000000000000987654321";

/// Frames between two frame-rate log lines.
pub const FPS_LOG_INTERVAL: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The peer went away.
    #[error("connection closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Status line and headers of a streamed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
}

impl ResponseHead {
    pub fn ok(content_type: &str) -> Self {
        Self {
            status: 200,
            headers: vec![("Content-Type", content_type.to_string())],
        }
    }

    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Headers for `/capture`.
    pub fn single_capture() -> Self {
        Self::ok("image/jpeg")
            .with_header("Content-Disposition", "inline; filename=capture.jpg")
            .with_header("Access-Control-Allow-Origin", "*")
    }

    /// Headers for the polling variant of `/stream`.
    pub fn polling_frame() -> Self {
        Self::ok("image/jpeg")
            .with_header("Cache-Control", "no-cache, no-store, must-revalidate")
            .with_header("Pragma", "no-cache")
            .with_header("Expires", "0")
            .with_header("Access-Control-Allow-Origin", "*")
    }

    /// Headers for the multipart variant of `/stream`.
    pub fn multipart_stream() -> Self {
        Self::ok(&format!(
            "multipart/x-mixed-replace;boundary={}",
            STREAM_BOUNDARY
        ))
        .with_header("Cache-Control", "no-cache, no-store, must-revalidate")
        .with_header("Access-Control-Allow-Origin", "*")
    }
}

/// Destination for a response body.
///
/// `start` is called at most once, before any `write_chunk`. Errors returned
/// before `start` can still be reported to the client with a status code;
/// after it, the transport can only abort the body.
pub trait ResponseSink {
    fn start(&mut self, head: &ResponseHead) -> Result<(), SinkError>;

    fn write_chunk(&mut self, data: &[u8]) -> Result<(), SinkError>;
}

/// Per-frame callback for stream observers (statistics, tests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSent {
    pub sequence: u64,
    pub bytes: usize,
    pub interval: Duration,
}

/// Why a continuous stream stopped.
#[derive(Debug)]
pub enum StreamEnd {
    Disconnected(SinkError),
    Camera(CameraError),
    Encode(EncodeError),
}

#[derive(Debug)]
pub struct StreamReport {
    pub frames: u64,
    pub bytes: u64,
    pub elapsed: Duration,
    pub end: StreamEnd,
}

impl StreamReport {
    pub fn fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.frames as f64 / secs
        } else {
            0.0
        }
    }
}

/// Serve one frame as a JPEG (`/capture`).
///
/// JPEG frames go to the sink as-is; other formats are transcoded in chunks.
/// Returns the number of body bytes written.
pub fn serve_capture(
    source: &dyn FrameSource,
    quality: u8,
    sink: &mut dyn ResponseSink,
) -> Result<usize, DeviceError> {
    let frame = FrameGuard::acquire(source)?;
    sink.start(&ResponseHead::single_capture())?;

    let written = if frame.is_jpeg() {
        sink.write_chunk(frame.bytes())?;
        frame.len()
    } else {
        encode::transcode_chunked(&frame, quality, sink)?
    };
    debug!(bytes = written, "capture served");
    frame.release();
    Ok(written)
}

/// Serve one frame with no-cache headers (polling `/stream`).
///
/// The whole JPEG is produced before anything is sent, so an encode failure
/// can still be reported with a status code.
pub fn serve_polling_frame(
    source: &dyn FrameSource,
    quality: u8,
    sink: &mut dyn ResponseSink,
) -> Result<usize, DeviceError> {
    let frame = FrameGuard::acquire(source)?;
    let jpeg = encode::jpeg_bytes(&frame, quality)?;
    sink.start(
        &ResponseHead::polling_frame().with_header("Content-Length", jpeg.len().to_string()),
    )?;
    sink.write_chunk(&jpeg)?;
    Ok(jpeg.len())
}

fn part_header(len: usize) -> String {
    format!(
        "\r\n--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        STREAM_BOUNDARY, len
    )
}

/// Run the multipart stream loop until the client goes away or a frame
/// cannot be produced.
///
/// Each iteration owns exactly one frame and at most one transcode buffer;
/// both are gone before the next acquisition.
pub fn serve_multipart_stream(
    source: &dyn FrameSource,
    quality: u8,
    sink: &mut dyn ResponseSink,
    on_frame: &mut dyn FnMut(FrameSent),
) -> Result<StreamReport, DeviceError> {
    sink.start(&ResponseHead::multipart_stream())?;

    let started = Instant::now();
    let mut last_frame = started;
    let mut window_start = started;
    let mut frames: u64 = 0;
    let mut bytes: u64 = 0;

    let end = loop {
        let frame = match FrameGuard::acquire(source) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "stream capture failed");
                break StreamEnd::Camera(e);
            }
        };

        let jpeg = match encode::jpeg_bytes(&frame, quality) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                warn!(error = %e, "stream encode failed");
                break StreamEnd::Encode(e);
            }
        };

        let sent = sink
            .write_chunk(part_header(jpeg.len()).as_bytes())
            .and_then(|()| sink.write_chunk(&jpeg));
        let len = jpeg.len();
        drop(jpeg);
        frame.release();

        if let Err(e) = sent {
            debug!(error = %e, "stream client gone");
            break StreamEnd::Disconnected(e);
        }

        frames += 1;
        bytes += len as u64;
        let now = Instant::now();
        on_frame(FrameSent {
            sequence: frames,
            bytes: len,
            interval: now - last_frame,
        });
        last_frame = now;

        if frames % FPS_LOG_INTERVAL == 0 {
            let window = now - window_start;
            let fps = FPS_LOG_INTERVAL as f64 / window.as_secs_f64().max(f64::EPSILON);
            info!(frames, fps = %format!("{:.1}", fps), "streaming");
            window_start = now;
        }
    };

    let report = StreamReport {
        frames,
        bytes,
        elapsed: started.elapsed(),
        end,
    };
    info!(
        frames = report.frames,
        bytes = report.bytes,
        fps = %format!("{:.1}", report.fps()),
        "stream ended"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::PixelFormat;
    use crate::sensor::{FrameSize, SensorSetting, SensorStatus};
    use crate::simulated::SimulatedCamera;
    use pretty_assertions::assert_eq;

    /// Sink that records everything and can fail on a chosen write.
    #[derive(Default)]
    struct RecordingSink {
        head: Option<ResponseHead>,
        body: Vec<u8>,
        writes: usize,
        fail_on_write: Option<usize>,
    }

    impl RecordingSink {
        fn failing_on(write: usize) -> Self {
            Self {
                fail_on_write: Some(write),
                ..Default::default()
            }
        }
    }

    impl ResponseSink for RecordingSink {
        fn start(&mut self, head: &ResponseHead) -> Result<(), SinkError> {
            assert!(self.head.is_none(), "start called twice");
            self.head = Some(head.clone());
            Ok(())
        }

        fn write_chunk(&mut self, data: &[u8]) -> Result<(), SinkError> {
            assert!(self.head.is_some(), "write before start");
            self.writes += 1;
            if self.fail_on_write == Some(self.writes) {
                return Err(SinkError::Closed);
            }
            self.body.extend_from_slice(data);
            Ok(())
        }
    }

    fn camera(format: PixelFormat) -> SimulatedCamera {
        let mut status = SensorStatus::default();
        status.apply(SensorSetting::FrameSize(FrameSize::Qvga));
        SimulatedCamera::with_status(format, status)
    }

    fn assert_balanced(camera: &SimulatedCamera) {
        assert_eq!(camera.acquired(), camera.released());
        assert_eq!(camera.outstanding(), 0);
        assert_eq!(camera.double_releases(), 0);
    }

    #[test]
    fn test_capture_jpeg_passthrough() {
        let camera = camera(PixelFormat::Jpeg);
        let mut sink = RecordingSink::default();
        let written = serve_capture(&camera, 80, &mut sink).unwrap();
        let head = sink.head.unwrap();
        assert_eq!(head.header("content-type"), Some("image/jpeg"));
        assert_eq!(written, sink.body.len());
        assert_eq!(sink.writes, 1);
        assert_balanced(&camera);
    }

    #[test]
    fn test_capture_transcodes_raw_frames() {
        let camera = camera(PixelFormat::Rgb565);
        let mut sink = RecordingSink::default();
        serve_capture(&camera, 80, &mut sink).unwrap();
        assert_eq!(&sink.body[..2], &[0xFF, 0xD8]);
        assert!(sink.writes > 1);
        assert_balanced(&camera);
    }

    #[test]
    fn test_capture_failure_sends_nothing() {
        let camera = camera(PixelFormat::Jpeg);
        camera.fail_next_acquisitions(1);
        let mut sink = RecordingSink::default();
        let err = serve_capture(&camera, 80, &mut sink).unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert!(sink.head.is_none());
        assert_balanced(&camera);
    }

    #[test]
    fn test_capture_releases_on_encode_failure() {
        let camera = camera(PixelFormat::Grayscale);
        camera.corrupt_next_frames(1);
        let mut sink = RecordingSink::default();
        assert!(matches!(
            serve_capture(&camera, 80, &mut sink),
            Err(DeviceError::Encode(_))
        ));
        assert_eq!(camera.acquired(), 1);
        assert_balanced(&camera);
    }

    #[test]
    fn test_capture_releases_on_write_failure() {
        for format in [PixelFormat::Jpeg, PixelFormat::Yuv422] {
            let camera = camera(format);
            let mut sink = RecordingSink::failing_on(1);
            assert!(serve_capture(&camera, 80, &mut sink).is_err());
            assert_balanced(&camera);
        }
    }

    #[test]
    fn test_polling_frame_headers() {
        let camera = camera(PixelFormat::Grayscale);
        let mut sink = RecordingSink::default();
        let len = serve_polling_frame(&camera, 80, &mut sink).unwrap();
        let head = sink.head.unwrap();
        assert_eq!(
            head.header("Cache-Control"),
            Some("no-cache, no-store, must-revalidate")
        );
        assert_eq!(head.header("Content-Length"), Some(len.to_string().as_str()));
        assert_balanced(&camera);
    }

    #[test]
    fn test_polling_encode_failure_reports_before_start() {
        let camera = camera(PixelFormat::Rgb888);
        camera.corrupt_next_frames(1);
        let mut sink = RecordingSink::default();
        let err = serve_polling_frame(&camera, 80, &mut sink).unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert!(sink.head.is_none());
        assert_balanced(&camera);
    }

    #[test]
    fn test_stream_runs_until_client_leaves() {
        let camera = camera(PixelFormat::Jpeg);
        // Two writes per frame: part header then payload. Fail the 7th write,
        // which is the header of the 4th frame.
        let mut sink = RecordingSink::failing_on(7);
        let mut seen = Vec::new();
        let report =
            serve_multipart_stream(&camera, 80, &mut sink, &mut |sent| seen.push(sent.sequence))
                .unwrap();
        assert_eq!(report.frames, 3);
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(matches!(report.end, StreamEnd::Disconnected(SinkError::Closed)));
        assert_eq!(camera.acquired(), 4);
        assert_balanced(&camera);

        let head = sink.head.unwrap();
        assert_eq!(
            head.header("Content-Type"),
            Some("multipart/x-mixed-replace;boundary=123456789000000000000987654321")
        );
        let body = String::from_utf8_lossy(&sink.body);
        assert_eq!(body.matches("--123456789000000000000987654321\r\n").count(), 3);
    }

    #[test]
    fn test_stream_payload_failure_frees_buffers() {
        let camera = camera(PixelFormat::Rgb565);
        let mut sink = RecordingSink::failing_on(2);
        let report = serve_multipart_stream(&camera, 80, &mut sink, &mut |_| {}).unwrap();
        assert_eq!(report.frames, 0);
        assert_balanced(&camera);
    }

    #[test]
    fn test_stream_ends_on_camera_and_encode_failure() {
        let camera = camera(PixelFormat::Grayscale);
        camera.fail_next_acquisitions(1);
        let mut sink = RecordingSink::default();
        let report = serve_multipart_stream(&camera, 80, &mut sink, &mut |_| {}).unwrap();
        assert!(matches!(report.end, StreamEnd::Camera(_)));

        camera.corrupt_next_frames(1);
        let mut sink = RecordingSink::default();
        let report = serve_multipart_stream(&camera, 80, &mut sink, &mut |_| {}).unwrap();
        assert!(matches!(report.end, StreamEnd::Encode(_)));
        assert_balanced(&camera);
    }

    #[test]
    fn test_part_header_format() {
        assert_eq!(
            part_header(1234),
            "\r\n--123456789000000000000987654321\r\nContent-Type: image/jpeg\r\nContent-Length: 1234\r\n\r\n"
        );
    }
}
