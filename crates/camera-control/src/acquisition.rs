//! Frame acquisition
//!
//! One frame is: (capture mode) software trigger, borrow the raw buffer,
//! run the ISP into the session output buffer, return the raw buffer, hand
//! out a view of the processed pixels. The output buffer stays locked until
//! that view is dropped, so the next conversion cannot overwrite a frame that
//! is still being read.

use std::sync::MutexGuard;

use camera_driver::{CameraDriver, CameraError, ErrorKind, FrameHead};
use tracing::{debug, trace};

use crate::buffer::{OutputBuffer, RawFrame};
use crate::error::{ControlError, Result};
use crate::mode::{OperatingMode, OperationGuard};
use crate::session::CameraSession;

/// Processed frame borrowed from the session output buffer
pub struct ProcessedFrame<'a> {
    output: MutexGuard<'a, Option<OutputBuffer>>,
    head: FrameHead,
    channels: usize,
}

impl ProcessedFrame<'_> {
    pub fn head(&self) -> &FrameHead {
        &self.head
    }

    pub fn width(&self) -> u32 {
        self.head.width
    }

    pub fn height(&self) -> u32 {
        self.head.height
    }

    /// 1 for MONO8, 3 for BGR8
    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn is_monochrome(&self) -> bool {
        self.channels == 1
    }

    /// Processed pixels, `width * height * channels` bytes
    pub fn data(&self) -> &[u8] {
        let len = self.head.processed_len(self.channels);
        self.output
            .as_ref()
            .and_then(|buffer| buffer.as_slice().get(..len))
            .unwrap_or(&[])
    }
}

impl std::fmt::Debug for ProcessedFrame<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessedFrame")
            .field("width", &self.head.width)
            .field("height", &self.head.height)
            .field("channels", &self.channels)
            .finish()
    }
}

impl<D: CameraDriver> CameraSession<D> {
    /// Acquire one frame for the registered operation `op`.
    ///
    /// Fails with `ModeChanged` once the operation's mode is stale, and with a
    /// continuable `Timeout` when no frame arrived in `grab_timeout_ms`.
    pub fn next_frame<'s>(&'s self, op: &OperationGuard<'_>) -> Result<ProcessedFrame<'s>> {
        op.ensure_active()?;
        self.acquire(op)
    }

    /// Acquire a single-shot frame. Unlike [`next_frame`](Self::next_frame)
    /// this still runs when a transition is already waiting on `op`; the wait
    /// is bounded by one grab timeout.
    pub fn grab_frame<'s>(&'s self, op: &OperationGuard<'_>) -> Result<ProcessedFrame<'s>> {
        op.ensure_mode()?;
        self.acquire(op)
    }

    fn acquire<'s>(&'s self, op: &OperationGuard<'_>) -> Result<ProcessedFrame<'s>> {
        let mut output = self.lock_output();
        let channels = self.capabilities().channels();

        let head = {
            let buffer = output.as_mut().ok_or(ControlError::SessionClosed)?;

            if op.mode() == OperatingMode::Capture {
                self.driver().soft_trigger()?;
            }

            let raw = match RawFrame::borrow(self.driver(), self.settings().grab_timeout()) {
                Ok(raw) => raw,
                Err(e) => {
                    if e.is_continuable() {
                        debug!("No frame within {}ms", self.settings().grab_timeout_ms);
                        metrics::counter!("camera_frame_timeouts_total").increment(1);
                    }
                    return Err(e.into());
                }
            };

            let needed = raw.head().processed_len(channels);
            if needed > buffer.len() {
                // `raw` is returned on drop.
                return Err(CameraError::new(
                    ErrorKind::DataIntegrity,
                    "CameraImageProcess",
                    format!(
                        "{}x{} frame needs {} bytes, output buffer holds {}",
                        raw.head().width,
                        raw.head().height,
                        needed,
                        buffer.len()
                    ),
                )
                .into());
            }

            raw.process_into(buffer.as_mut_slice())?;
            raw.give_back()?
        };

        trace!("Frame {}x{} ts={}", head.width, head.height, head.timestamp);
        metrics::counter!("camera_frames_total", "mode" => op.mode().as_str()).increment(1);

        Ok(ProcessedFrame {
            output,
            head,
            channels,
        })
    }
}
