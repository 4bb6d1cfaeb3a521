//! JPEG transcoding for sensors that do not deliver JPEG natively.
//!
//! Two entry points: [`transcode`] encodes into one heap buffer (needed when
//! the byte length must be known up front, as in multipart parts), and
//! [`transcode_chunked`] hands encoder output to a [`ResponseSink`] as it is
//! produced so memory use stays bounded by the chunk size.

use std::borrow::Cow;
use std::io::{self, BufWriter, Write};

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use thiserror::Error;

use crate::camera::{FrameBuffer, PixelFormat};
use crate::capture::{ResponseSink, SinkError};

/// JPEG quality used when transcoding raw frames.
pub const TRANSCODE_QUALITY: u8 = 80;

/// Size of the chunks handed to the sink by [`transcode_chunked`].
pub const CHUNK_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Frame is {actual} bytes, expected {expected} for {width}x{height}")]
    SizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("JPEG encode failed: {0}")]
    Encode(String),

    /// The sink failed while encoder output was being written.
    #[error("Write failed during encode: {0}")]
    Write(#[from] SinkError),
}

/// ITU-R BT.601 full-range RGB to YUV.
pub fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let y = (77 * r + 150 * g + 29 * b) >> 8;
    let u = ((-43 * r - 85 * g + 128 * b) >> 8) + 128;
    let v = ((128 * r - 107 * g - 21 * b) >> 8) + 128;
    (clamp(y), clamp(u), clamp(v))
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let (y, u, v) = (y as i32, u as i32 - 128, v as i32 - 128);
    let r = y + ((359 * v) >> 8);
    let g = y - ((88 * u + 183 * v) >> 8);
    let b = y + ((454 * u) >> 8);
    [clamp(r), clamp(g), clamp(b)]
}

fn clamp(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Expand a raw frame into something the JPEG encoder accepts.
fn encoder_input(frame: &FrameBuffer) -> Result<(Cow<'_, [u8]>, ExtendedColorType), EncodeError> {
    let format = frame.format();
    let data = frame.bytes();
    let pixels = frame.width() as usize * frame.height() as usize;
    let bpp = match format.bytes_per_pixel() {
        Some(bpp) => bpp,
        None => return Err(EncodeError::Encode("frame is already JPEG".to_string())),
    };
    if data.len() != pixels * bpp {
        return Err(EncodeError::SizeMismatch {
            width: frame.width(),
            height: frame.height(),
            expected: pixels * bpp,
            actual: data.len(),
        });
    }

    let converted = match format {
        PixelFormat::Grayscale => (Cow::Borrowed(data), ExtendedColorType::L8),
        PixelFormat::Rgb888 => (Cow::Borrowed(data), ExtendedColorType::Rgb8),
        PixelFormat::Rgb565 => {
            let rgb = data
                .chunks_exact(2)
                .flat_map(|px| {
                    let v = u16::from_be_bytes([px[0], px[1]]);
                    let r = ((v >> 11) & 0x1F) as u8;
                    let g = ((v >> 5) & 0x3F) as u8;
                    let b = (v & 0x1F) as u8;
                    [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]
                })
                .collect();
            (Cow::Owned(rgb), ExtendedColorType::Rgb8)
        }
        PixelFormat::Yuv422 => {
            // YUYV: two pixels share one U/V pair.
            let mut rgb = Vec::with_capacity(pixels * 3);
            for quad in data.chunks_exact(4) {
                rgb.extend_from_slice(&yuv_to_rgb(quad[0], quad[1], quad[3]));
                rgb.extend_from_slice(&yuv_to_rgb(quad[2], quad[1], quad[3]));
            }
            (Cow::Owned(rgb), ExtendedColorType::Rgb8)
        }
        PixelFormat::Jpeg => unreachable!("rejected above"),
    };
    Ok(converted)
}

/// Encode packed RGB888 pixels to JPEG.
pub fn encode_rgb(rgb: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(rgb, width, height, ExtendedColorType::Rgb8)
        .map_err(|e| EncodeError::Encode(e.to_string()))?;
    Ok(out)
}

/// Transcode a raw frame into a heap-allocated JPEG.
pub fn transcode(frame: &FrameBuffer, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let (pixels, color) = encoder_input(frame)?;
    let mut out = Vec::with_capacity(frame.len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(&pixels, frame.width(), frame.height(), color)
        .map_err(|e| EncodeError::Encode(e.to_string()))?;
    Ok(out)
}

/// JPEG bytes of a frame: borrowed when the sensor already produced JPEG,
/// transcoded otherwise.
pub fn jpeg_bytes(frame: &FrameBuffer, quality: u8) -> Result<Cow<'_, [u8]>, EncodeError> {
    if frame.is_jpeg() {
        Ok(Cow::Borrowed(frame.bytes()))
    } else {
        transcode(frame, quality).map(Cow::Owned)
    }
}

/// `io::Write` adapter that forwards to a sink and remembers the sink's error.
struct SinkWriter<'a> {
    sink: &'a mut dyn ResponseSink,
    written: usize,
    failure: Option<SinkError>,
}

impl Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Err(e) = self.sink.write_chunk(buf) {
            let message = e.to_string();
            self.failure = Some(e);
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, message));
        }
        self.written += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Transcode a raw frame, handing output to `sink` in [`CHUNK_SIZE`] pieces.
///
/// Returns the number of JPEG bytes written. A sink failure is reported as
/// [`EncodeError::Write`] so callers can tell a dropped client from a broken
/// encoder.
pub fn transcode_chunked(
    frame: &FrameBuffer,
    quality: u8,
    sink: &mut dyn ResponseSink,
) -> Result<usize, EncodeError> {
    let (pixels, color) = encoder_input(frame)?;
    let mut writer = SinkWriter {
        sink,
        written: 0,
        failure: None,
    };

    let result = {
        let mut buffered = BufWriter::with_capacity(CHUNK_SIZE, &mut writer);
        let encoded = JpegEncoder::new_with_quality(&mut buffered, quality.clamp(1, 100))
            .encode(&pixels, frame.width(), frame.height(), color)
            .map_err(|e| e.to_string());
        encoded.and_then(|()| buffered.flush().map_err(|e| e.to_string()))
    };

    match (result, writer.failure.take()) {
        (_, Some(sink_error)) => Err(EncodeError::Write(sink_error)),
        (Err(message), None) => Err(EncodeError::Encode(message)),
        (Ok(()), None) => Ok(writer.written),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ResponseHead;

    struct Collect {
        chunks: Vec<Vec<u8>>,
        fail_after: Option<usize>,
    }

    impl ResponseSink for Collect {
        fn start(&mut self, _head: &ResponseHead) -> Result<(), SinkError> {
            Ok(())
        }

        fn write_chunk(&mut self, data: &[u8]) -> Result<(), SinkError> {
            if self.fail_after == Some(self.chunks.len()) {
                return Err(SinkError::Closed);
            }
            self.chunks.push(data.to_vec());
            Ok(())
        }
    }

    fn gray_frame(width: u32, height: u32) -> FrameBuffer {
        let data = (0..width * height).map(|i| (i % 251) as u8).collect();
        FrameBuffer::owned(1, width, height, PixelFormat::Grayscale, data)
    }

    #[test]
    fn test_transcode_gray() {
        let jpeg = transcode(&gray_frame(64, 48), TRANSCODE_QUALITY).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn test_transcode_rgb565_and_yuv() {
        let rgb565 = FrameBuffer::owned(1, 16, 16, PixelFormat::Rgb565, vec![0xF8; 16 * 16 * 2]);
        assert!(transcode(&rgb565, 80).is_ok());
        let yuv = FrameBuffer::owned(2, 16, 16, PixelFormat::Yuv422, vec![0x80; 16 * 16 * 2]);
        assert!(transcode(&yuv, 80).is_ok());
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let frame = FrameBuffer::owned(1, 10, 10, PixelFormat::Rgb888, vec![0; 12]);
        assert!(matches!(
            transcode(&frame, 80),
            Err(EncodeError::SizeMismatch { expected: 300, actual: 12, .. })
        ));
    }

    #[test]
    fn test_chunked_matches_one_shot() {
        let frame = gray_frame(320, 240);
        let mut sink = Collect {
            chunks: Vec::new(),
            fail_after: None,
        };
        let written = transcode_chunked(&frame, 80, &mut sink).unwrap();
        let joined: Vec<u8> = sink.chunks.concat();
        assert_eq!(written, joined.len());
        assert_eq!(joined, transcode(&frame, 80).unwrap());
        assert!(sink.chunks.len() > 1);
    }

    #[test]
    fn test_chunked_reports_sink_failure() {
        let frame = gray_frame(320, 240);
        let mut sink = Collect {
            chunks: Vec::new(),
            fail_after: Some(0),
        };
        assert!(matches!(
            transcode_chunked(&frame, 80, &mut sink),
            Err(EncodeError::Write(SinkError::Closed))
        ));
    }

    #[test]
    fn test_yuv_roundtrip_is_close() {
        let (y, u, v) = rgb_to_yuv(200, 100, 50);
        let [r, g, b] = yuv_to_rgb(y, u, v);
        assert!((r as i32 - 200).abs() < 6);
        assert!((g as i32 - 100).abs() < 6);
        assert!((b as i32 - 50).abs() < 6);
    }
}
