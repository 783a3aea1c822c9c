//! Frame sinks
//!
//! A sink consumes processed frames. [`run_stream`] drives a sink in preview
//! mode until it closes, is stopped, or the camera leaves preview;
//! [`capture_once`] feeds it a single software-triggered frame.

use std::borrow::Cow;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use camera_driver::{CameraDriver, ImageFileFormat, Resolution};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, GrayImage, ImageFormat, RgbImage};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::acquisition::ProcessedFrame;
use crate::error::{ControlError, Result};
use crate::mode::{CaptureParams, ModeRequest};
use crate::session::CameraSession;

/// Why a sink refused a frame
#[derive(Debug, Error)]
pub enum SinkError {
    /// The consumer went away; the stream ends cleanly
    #[error("Sink closed")]
    Closed,

    #[error(transparent)]
    Fatal(#[from] ControlError),
}

/// Consumer of processed frames
pub trait FrameSink {
    fn consume(&mut self, frame: &ProcessedFrame<'_>) -> std::result::Result<(), SinkError>;
}

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a stream ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The stop signal was raised
    Stopped,
    /// The sink reported its consumer gone
    Closed,
    /// Another request moved the camera out of preview
    ModeChanged,
}

/// Stream preview frames into `sink`.
///
/// Registers one operation for the whole stream. Frame timeouts are retried,
/// every other driver error ends the stream with that error.
pub fn run_stream<D, S>(
    session: &CameraSession<D>,
    sink: &mut S,
    stop: &StopSignal,
) -> Result<StreamEnd>
where
    D: CameraDriver,
    S: FrameSink + ?Sized,
{
    let op = session.begin(ModeRequest::Preview)?;
    info!("Preview stream started ({} active)", session.in_flight());

    let end = loop {
        if stop.is_stopped() {
            break StreamEnd::Stopped;
        }

        let frame = match session.next_frame(&op) {
            Ok(frame) => frame,
            Err(ControlError::ModeChanged { current, .. }) => {
                debug!("Preview stream yielding to {} mode", current);
                break StreamEnd::ModeChanged;
            }
            Err(e) if e.is_continuable() => {
                warn!("Preview frame skipped: {}", e);
                continue;
            }
            Err(e) => return Err(e),
        };

        match sink.consume(&frame) {
            Ok(()) => {}
            Err(SinkError::Closed) => break StreamEnd::Closed,
            Err(SinkError::Fatal(e)) => return Err(e),
        }
    };

    info!("Preview stream ended: {:?}", end);
    Ok(end)
}

/// Take one capture-mode frame with `params` and hand it to `sink`
pub fn capture_once<D, S>(
    session: &CameraSession<D>,
    params: CaptureParams,
    sink: &mut S,
) -> Result<()>
where
    D: CameraDriver,
    S: FrameSink + ?Sized,
{
    let op = session.begin(ModeRequest::Capture(params))?;
    let frame = session.grab_frame(&op)?;
    sink.consume(&frame).map_err(|e| match e {
        SinkError::Closed => ControlError::Sink("capture sink closed".to_string()),
        SinkError::Fatal(e) => e,
    })
}

/// Writes the frame to disk through the driver's encoder
pub struct FileSink<'a, D: CameraDriver> {
    driver: &'a D,
    path: PathBuf,
    format: ImageFileFormat,
}

impl<'a, D: CameraDriver> FileSink<'a, D> {
    pub fn new(driver: &'a D, path: &Path, format: ImageFileFormat) -> Self {
        Self {
            driver,
            path: path.to_path_buf(),
            format,
        }
    }
}

impl<D: CameraDriver> FrameSink for FileSink<'_, D> {
    fn consume(&mut self, frame: &ProcessedFrame<'_>) -> std::result::Result<(), SinkError> {
        self.driver
            .save_to_file(frame.data(), frame.head(), &self.path, self.format)
            .map_err(|e| SinkError::Fatal(e.into()))
    }
}

/// Keeps the PNG-encoded centre window of the last frame
pub struct RegionSink {
    roi: Resolution,
    png: Option<Vec<u8>>,
}

impl RegionSink {
    pub fn new(roi: Resolution) -> Self {
        Self { roi, png: None }
    }

    pub fn into_png(self) -> Option<Vec<u8>> {
        self.png
    }
}

impl FrameSink for RegionSink {
    fn consume(&mut self, frame: &ProcessedFrame<'_>) -> std::result::Result<(), SinkError> {
        self.png = Some(encode_png_region(frame, self.roi)?);
        Ok(())
    }
}

/// JPEG-encode a processed frame. `quality` is clamped to 1..=100.
pub fn encode_jpeg(frame: &ProcessedFrame<'_>, quality: u8) -> Result<Vec<u8>> {
    let (pixels, color) = encoder_pixels(frame);
    let mut jpeg = Vec::with_capacity(pixels.len() / 8);
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100))
        .encode(&pixels, frame.width(), frame.height(), color)
        .map_err(|e| ControlError::Encode(e.to_string()))?;
    Ok(jpeg)
}

/// PNG of the centred `roi` window, clamped to the frame
pub fn encode_png_region(frame: &ProcessedFrame<'_>, roi: Resolution) -> Result<Vec<u8>> {
    let image = to_image(frame)?;
    let (x, y, width, height) = centered_window(frame.width(), frame.height(), roi);
    let region = image.crop_imm(x, y, width, height);

    let mut png = Cursor::new(Vec::new());
    region
        .write_to(&mut png, ImageFormat::Png)
        .map_err(|e| ControlError::Encode(e.to_string()))?;
    Ok(png.into_inner())
}

/// `(x, y, width, height)` of a window of at most `roi` centred in the frame
pub fn centered_window(
    frame_width: u32,
    frame_height: u32,
    roi: Resolution,
) -> (u32, u32, u32, u32) {
    let width = roi.width.min(frame_width);
    let height = roi.height.min(frame_height);
    ((frame_width - width) / 2, (frame_height - height) / 2, width, height)
}

/// Pixels in encoder order: BGR8 output is swapped to RGB
fn encoder_pixels<'f>(frame: &'f ProcessedFrame<'_>) -> (Cow<'f, [u8]>, ExtendedColorType) {
    if frame.is_monochrome() {
        (Cow::Borrowed(frame.data()), ExtendedColorType::L8)
    } else {
        (Cow::Owned(bgr_to_rgb(frame.data())), ExtendedColorType::Rgb8)
    }
}

fn to_image(frame: &ProcessedFrame<'_>) -> Result<DynamicImage> {
    let (width, height) = (frame.width(), frame.height());
    let image = if frame.is_monochrome() {
        GrayImage::from_raw(width, height, frame.data().to_vec()).map(DynamicImage::ImageLuma8)
    } else {
        RgbImage::from_raw(width, height, bgr_to_rgb(frame.data())).map(DynamicImage::ImageRgb8)
    };
    image.ok_or_else(|| {
        ControlError::Encode(format!("buffer does not hold a {}x{} frame", width, height))
    })
}

fn bgr_to_rgb(bgr: &[u8]) -> Vec<u8> {
    bgr.chunks_exact(3).flat_map(|px| [px[2], px[1], px[0]]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::CameraSettings;
    use camera_driver::{MockBehavior, MockDriver};

    fn session(behavior: MockBehavior) -> CameraSession<MockDriver> {
        let mut settings = CameraSettings::default();
        settings.preview.half_resolution = false;
        settings.grab_timeout_ms = 500;
        CameraSession::open(MockDriver::new(behavior), settings).unwrap()
    }

    struct CountingSink {
        frames: usize,
        limit: usize,
    }

    impl FrameSink for CountingSink {
        fn consume(&mut self, frame: &ProcessedFrame<'_>) -> std::result::Result<(), SinkError> {
            assert_eq!(frame.data().len(), frame.head().processed_len(frame.channels()));
            self.frames += 1;
            if self.frames >= self.limit {
                Err(SinkError::Closed)
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_centered_window() {
        let roi = Resolution { width: 1000, height: 666 };
        assert_eq!(centered_window(3088, 2064, roi), (1044, 699, 1000, 666));
        assert_eq!(centered_window(640, 480, roi), (0, 0, 640, 480));
    }

    proptest::proptest! {
        #[test]
        fn prop_window_fits_frame(
            fw in 1u32..5000,
            fh in 1u32..5000,
            rw in 1u32..5000,
            rh in 1u32..5000,
        ) {
            let (x, y, w, h) = centered_window(fw, fh, Resolution { width: rw, height: rh });
            proptest::prop_assert!(x + w <= fw && y + h <= fh);
            proptest::prop_assert_eq!(w, rw.min(fw));
            proptest::prop_assert_eq!(h, rh.min(fh));
        }
    }

    #[test]
    fn test_stream_until_closed() {
        let session = session(MockBehavior::mono(16, 8));
        let mut sink = CountingSink { frames: 0, limit: 3 };
        let end = run_stream(&session, &mut sink, &StopSignal::new()).unwrap();
        assert_eq!(end, StreamEnd::Closed);
        assert_eq!(sink.frames, 3);
        assert_eq!(session.in_flight(), 0);

        let stats = session.driver().stats();
        assert_eq!(stats.borrows, stats.returns);
        assert_eq!(stats.outstanding, 0);
    }

    #[test]
    fn test_stopped_stream_reads_nothing() {
        let session = session(MockBehavior::mono(16, 8));
        let stop = StopSignal::new();
        stop.stop();
        let mut sink = CountingSink { frames: 0, limit: 10 };
        assert_eq!(run_stream(&session, &mut sink, &stop).unwrap(), StreamEnd::Stopped);
        assert_eq!(sink.frames, 0);
    }

    #[test]
    fn test_jpeg_encoding_mono_and_color() {
        for behavior in [MockBehavior::mono(32, 24), MockBehavior::color(32, 24)] {
            let session = session(behavior);
            let op = session.begin(ModeRequest::Preview).unwrap();
            let frame = session.next_frame(&op).unwrap();
            let jpeg = encode_jpeg(&frame, 60).unwrap();
            assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

            let decoded = image::load_from_memory(&jpeg).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (32, 24));
        }
    }

    #[test]
    fn test_region_capture_is_cropped_png() {
        let settings = CameraSettings {
            roi: Resolution { width: 20, height: 10 },
            ..Default::default()
        };
        let session =
            CameraSession::open(MockDriver::new(MockBehavior::color(64, 48)), settings).unwrap();

        let png = session
            .capture_region(CaptureParams { exposure_s: 0.001, gain: 1 })
            .unwrap();
        let decoded = image::load_from_memory_with_format(&png, ImageFormat::Png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (20, 10));
        assert_eq!(session.in_flight(), 0);
    }
}
