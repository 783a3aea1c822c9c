//! Frame buffer lifecycle
//!
//! Two kinds of buffer exist per session:
//! - the processed [`OutputBuffer`], allocated once at activation and reused
//!   for every frame;
//! - raw buffers, owned by the driver and held here through [`RawFrame`]
//!   only between borrow and return.

use std::time::Duration;

use camera_driver::{CameraDriver, CameraError, FrameHead, RawHandle};
use tracing::{debug, warn};

/// Session-owned ISP output buffer
pub struct OutputBuffer {
    data: Vec<u8>,
}

impl OutputBuffer {
    /// Zeroed buffer of `size` bytes
    pub fn allocate(size: usize) -> Self {
        debug!("Allocating {} byte output buffer", size);
        Self {
            data: vec![0u8; size],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Free the buffer now instead of at drop
    pub fn release(self) {
        debug!("Releasing {} byte output buffer", self.data.len());
    }
}

impl std::fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputBuffer").field("len", &self.data.len()).finish()
    }
}

/// Raw buffer borrowed from the driver.
///
/// Returned to the driver exactly once: by [`RawFrame::give_back`], or by
/// `Drop` on every other exit path.
pub struct RawFrame<'d, D: CameraDriver> {
    driver: &'d D,
    handle: Option<RawHandle>,
    head: FrameHead,
}

impl<'d, D: CameraDriver> RawFrame<'d, D> {
    /// Borrow the next raw frame. On timeout nothing is held.
    pub fn borrow(driver: &'d D, timeout: Duration) -> Result<Self, CameraError> {
        let (handle, head) = driver.borrow_raw(timeout)?;
        Ok(Self {
            driver,
            handle: Some(handle),
            head,
        })
    }

    pub fn head(&self) -> &FrameHead {
        &self.head
    }

    /// Run the ISP into `output`
    pub fn process_into(&self, output: &mut [u8]) -> Result<(), CameraError> {
        match &self.handle {
            Some(handle) => self.driver.process(handle, output, &self.head),
            None => Err(CameraError::new(
                camera_driver::ErrorKind::InvalidParameter,
                "CameraImageProcess",
                "raw frame already returned",
            )),
        }
    }

    /// Return the buffer and report the driver's status
    pub fn give_back(mut self) -> Result<FrameHead, CameraError> {
        match self.handle.take() {
            Some(handle) => self.driver.return_raw(handle).map(|()| self.head),
            None => Ok(self.head),
        }
    }
}

impl<D: CameraDriver> Drop for RawFrame<'_, D> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.driver.return_raw(handle) {
                warn!("Raw buffer release failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camera_driver::mock::MockOp;
    use camera_driver::{
        AeState, DeviceConfiguration, ErrorKind, MockBehavior, MockDriver, Rotation, SdkStatus,
        TriggerMode,
    };

    fn playing_driver() -> MockDriver {
        let driver = MockDriver::new(MockBehavior::mono(4, 4));
        driver.initialize().unwrap();
        driver.activate(0).unwrap();
        driver
            .configure(&DeviceConfiguration {
                trigger_mode: TriggerMode::Continuous,
                ae_state: AeState::Manual,
                exposure_s: 0.001,
                gain: 1,
                rotation: Rotation::None,
                roi: None,
            })
            .unwrap();
        driver.play().unwrap();
        driver
    }

    #[test]
    fn test_output_buffer_allocation() {
        let mut buffer = OutputBuffer::allocate(16);
        assert_eq!(buffer.len(), 16);
        buffer.as_mut_slice()[3] = 9;
        assert_eq!(buffer.as_slice()[3], 9);
        buffer.release();
    }

    #[test]
    fn test_drop_returns_buffer() {
        let driver = playing_driver();
        {
            let raw = RawFrame::borrow(&driver, Duration::from_millis(100)).unwrap();
            assert_eq!(raw.head().width, 4);
            assert_eq!(driver.stats().outstanding, 1);
        }
        let stats = driver.stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.returns, 1);
    }

    #[test]
    fn test_returned_once_after_process_failure() {
        let driver = playing_driver();
        driver.fail_next(MockOp::Process, SdkStatus::Failed.code());

        let raw = RawFrame::borrow(&driver, Duration::from_millis(100)).unwrap();
        let mut out = vec![0u8; 16];
        assert!(raw.process_into(&mut out).is_err());
        drop(raw);

        let stats = driver.stats();
        assert_eq!(stats.borrows, 1);
        assert_eq!(stats.returns, 1);
        assert_eq!(stats.outstanding, 0);
    }

    #[test]
    fn test_give_back_surfaces_status() {
        let driver = playing_driver();
        driver.fail_next(MockOp::Return, SdkStatus::BusError.code());

        let raw = RawFrame::borrow(&driver, Duration::from_millis(100)).unwrap();
        let err = raw.give_back().unwrap_err();
        assert_eq!(err.context(), "CameraReleaseImageBuffer");
        assert_eq!(driver.stats().returns, 1);
    }

    #[test]
    fn test_timeout_holds_nothing() {
        let driver = playing_driver();
        driver.fail_next(MockOp::Borrow, SdkStatus::TimeOut.code());
        let err = RawFrame::borrow(&driver, Duration::from_millis(10)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(driver.stats().outstanding, 0);
    }
}
