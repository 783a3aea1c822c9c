//! In-process camera used when the SDK is not linked
//!
//! Behaves like a single MindVision device: continuous mode free-runs at
//! `frame_interval`, software-trigger mode only yields a frame after
//! `soft_trigger`. Every primitive is counted so tests can check buffer
//! balance and that no configuration ever lands while a frame is in flight.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use image::{GrayImage, ImageFormat, RgbImage};
use tracing::{debug, warn};

use crate::status::{check, CameraError, ErrorKind, SdkStatus};
use crate::{
    CameraDriver, Device, DeviceConfiguration, FrameHead, ImageFileFormat, RawHandle,
    SessionCapabilities, TriggerMode,
};

/// Driver primitives that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Initialize,
    Activate,
    Configure,
    Play,
    SoftTrigger,
    Borrow,
    Process,
    Return,
    Save,
    SetGain,
    SetExposure,
}

/// Static description of the simulated device
#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub capabilities: SessionCapabilities,
    pub devices: Vec<Device>,
    /// Time between frames in continuous mode
    pub frame_interval: Duration,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            capabilities: SessionCapabilities {
                max_width: 640,
                max_height: 480,
                monochrome: true,
            },
            devices: vec![Device {
                id: 1,
                serial_number: "MOCK0001".to_string(),
                series: "MV-SUA".to_string(),
                name: "MV-SUA630M".to_string(),
                friendly_name: "Mock Camera".to_string(),
                link_name: "mock0".to_string(),
                sensor_type: "CMOS".to_string(),
                port_type: "USB3.0".to_string(),
                driver_version: "mock".to_string(),
            }],
            frame_interval: Duration::from_millis(5),
        }
    }
}

impl MockBehavior {
    /// Monochrome sensor of the given size
    pub fn mono(width: u32, height: u32) -> Self {
        Self {
            capabilities: SessionCapabilities {
                max_width: width,
                max_height: height,
                monochrome: true,
            },
            ..Default::default()
        }
    }

    /// Colour sensor of the given size
    pub fn color(width: u32, height: u32) -> Self {
        Self {
            capabilities: SessionCapabilities {
                max_width: width,
                max_height: height,
                monochrome: false,
            },
            ..Default::default()
        }
    }
}

/// Call counters
#[derive(Debug, Clone, Default)]
pub struct MockStats {
    pub initialize_calls: usize,
    pub activate_calls: usize,
    pub configure_calls: usize,
    pub play_calls: usize,
    pub soft_triggers: usize,
    pub borrows: usize,
    pub returns: usize,
    pub processed: usize,
    pub saves: usize,
    /// Handles borrowed and not yet returned
    pub outstanding: usize,
    /// `configure` calls that arrived while a frame was being acquired
    pub configure_races: usize,
    pub configurations: Vec<DeviceConfiguration>,
    pub gain: Option<i32>,
    pub exposure_s: Option<f64>,
}

#[derive(Default)]
struct MockState {
    initialized: bool,
    active: bool,
    playing: bool,
    config: Option<DeviceConfiguration>,
    pending_triggers: usize,
    /// Borrows in progress plus outstanding handles
    acquiring: usize,
    next_handle: usize,
    sequence: u32,
    buffers: HashMap<usize, (Vec<u8>, FrameHead)>,
    failures: HashMap<MockOp, VecDeque<i32>>,
    stats: MockStats,
}

impl MockState {
    fn take_failure(&mut self, op: MockOp, context: &'static str) -> Result<(), CameraError> {
        match self.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(code) => check(code, context),
            None => Ok(()),
        }
    }
}

/// Simulated camera
pub struct MockDriver {
    behavior: MockBehavior,
    state: Mutex<MockState>,
}

impl MockDriver {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Make the next call to `op` fail with `code`. Queued failures are consumed in order.
    pub fn fail_next(&self, op: MockOp, code: i32) {
        self.lock().failures.entry(op).or_default().push_back(code);
    }

    pub fn stats(&self) -> MockStats {
        self.lock().stats.clone()
    }

    pub fn behavior(&self) -> &MockBehavior {
        &self.behavior
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the counters from the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn frame_size(&self, config: &DeviceConfiguration) -> (u32, u32) {
        let caps = &self.behavior.capabilities;
        match config.roi {
            Some(roi) => (roi.width.min(caps.max_width), roi.height.min(caps.max_height)),
            None => (caps.max_width, caps.max_height),
        }
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new(MockBehavior::default())
    }
}

impl CameraDriver for MockDriver {
    fn initialize(&self) -> Result<(), CameraError> {
        let mut state = self.lock();
        state.take_failure(MockOp::Initialize, "CameraSdkInit")?;
        state.initialized = true;
        state.stats.initialize_calls += 1;
        Ok(())
    }

    fn enumerate_devices(&self) -> Result<Vec<Device>, CameraError> {
        let state = self.lock();
        if !state.initialized {
            check(SdkStatus::NotInitialized.code(), "CameraEnumerateDevice")?;
        }
        Ok(self.behavior.devices.clone())
    }

    fn activate(&self, index: usize) -> Result<SessionCapabilities, CameraError> {
        let mut state = self.lock();
        state.take_failure(MockOp::Activate, "CameraInit")?;
        if !state.initialized {
            check(SdkStatus::NotInitialized.code(), "CameraInit")?;
        }
        if index >= self.behavior.devices.len() {
            check(SdkStatus::NoDeviceFound.code(), "CameraInit")?;
        }
        if state.active {
            check(SdkStatus::DeviceIsOpened.code(), "CameraInit")?;
        }
        state.active = true;
        state.stats.activate_calls += 1;
        debug!("Mock camera {} activated", index);
        Ok(self.behavior.capabilities)
    }

    fn configure(&self, config: &DeviceConfiguration) -> Result<(), CameraError> {
        let mut state = self.lock();
        if state.acquiring > 0 {
            warn!("Mock camera reconfigured with {} acquisitions in flight", state.acquiring);
            state.stats.configure_races += 1;
        }
        state.stats.configure_calls += 1;
        state.take_failure(MockOp::Configure, "CameraSetTriggerMode")?;
        if !state.active {
            check(SdkStatus::DeviceIsClosed.code(), "CameraSetTriggerMode")?;
        }
        state.playing = false;
        state.pending_triggers = 0;
        state.stats.gain = Some(config.gain);
        state.stats.exposure_s = Some(config.exposure_s);
        state.stats.configurations.push(config.clone());
        state.config = Some(config.clone());
        Ok(())
    }

    fn play(&self) -> Result<(), CameraError> {
        let mut state = self.lock();
        state.take_failure(MockOp::Play, "CameraPlay")?;
        if state.config.is_none() {
            check(SdkStatus::NotInitialized.code(), "CameraPlay")?;
        }
        state.playing = true;
        state.stats.play_calls += 1;
        Ok(())
    }

    fn soft_trigger(&self) -> Result<(), CameraError> {
        let mut state = self.lock();
        state.take_failure(MockOp::SoftTrigger, "CameraSoftTrigger")?;
        state.pending_triggers += 1;
        state.stats.soft_triggers += 1;
        Ok(())
    }

    fn borrow_raw(&self, timeout: Duration) -> Result<(RawHandle, FrameHead), CameraError> {
        let wait = {
            let mut state = self.lock();
            state.acquiring += 1;
            if let Err(e) = state.take_failure(MockOp::Borrow, "CameraGetImageBuffer") {
                state.acquiring -= 1;
                return Err(e);
            }
            let triggered = match state.config.as_ref().map(|c| c.trigger_mode) {
                Some(TriggerMode::Software) => state.pending_triggers > 0,
                Some(TriggerMode::Continuous) => true,
                None => false,
            };
            if !state.playing || !triggered {
                None
            } else {
                Some(self.behavior.frame_interval.min(timeout))
            }
        };

        let Some(wait) = wait else {
            std::thread::sleep(timeout);
            self.lock().acquiring -= 1;
            return Err(CameraError::status(SdkStatus::TimeOut, "CameraGetImageBuffer"));
        };
        std::thread::sleep(wait);

        let mut state = self.lock();
        let Some(config) = state.config.clone() else {
            state.acquiring -= 1;
            return Err(CameraError::new(
                ErrorKind::NotInitialized,
                "CameraGetImageBuffer",
                "device reconfigured during acquisition",
            ));
        };
        if config.trigger_mode == TriggerMode::Software {
            state.pending_triggers = state.pending_triggers.saturating_sub(1);
        }
        let (width, height) = self.frame_size(&config);
        let sequence = state.sequence;
        state.sequence = state.sequence.wrapping_add(1);

        let raw: Vec<u8> = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x + y + sequence) as u8))
            .collect();
        let head = FrameHead {
            media_type: 0x0108_0001,
            bytes: raw.len() as u32,
            width,
            height,
            is_trigger: config.trigger_mode == TriggerMode::Software,
            timestamp: sequence.wrapping_mul(10),
            exposure_us: (config.exposure_s * 1_000_000.0) as u32,
            analog_gain: config.gain as f32,
        };

        let id = state.next_handle;
        state.next_handle += 1;
        state.buffers.insert(id, (raw, head));
        state.stats.borrows += 1;
        state.stats.outstanding += 1;
        Ok((RawHandle::from_raw(id), head))
    }

    fn process(
        &self,
        raw: &RawHandle,
        output: &mut [u8],
        head: &FrameHead,
    ) -> Result<(), CameraError> {
        let mut state = self.lock();
        state.take_failure(MockOp::Process, "CameraImageProcess")?;
        let Some((data, _)) = state.buffers.get(&raw.as_raw()) else {
            return check(SdkStatus::ParameterInvalid.code(), "CameraImageProcess");
        };
        let channels = self.behavior.capabilities.channels();
        let needed = head.processed_len(channels);
        if output.len() < needed || data.len() < head.processed_len(1) {
            return check(SdkStatus::SizeMismatch.code(), "CameraImageProcess");
        }
        if channels == 1 {
            output[..needed].copy_from_slice(&data[..needed]);
        } else {
            for (px, out) in data.iter().zip(output[..needed].chunks_exact_mut(3)) {
                out.copy_from_slice(&[*px, px.wrapping_add(64), px.wrapping_add(128)]);
            }
        }
        state.stats.processed += 1;
        Ok(())
    }

    fn return_raw(&self, raw: RawHandle) -> Result<(), CameraError> {
        let mut state = self.lock();
        if state.buffers.remove(&raw.as_raw()).is_none() {
            return check(SdkStatus::ParameterInvalid.code(), "CameraReleaseImageBuffer");
        }
        state.acquiring = state.acquiring.saturating_sub(1);
        state.stats.returns += 1;
        state.stats.outstanding -= 1;
        // The handle is gone either way; a forced failure only affects the status.
        state.take_failure(MockOp::Return, "CameraReleaseImageBuffer")
    }

    fn save_to_file(
        &self,
        output: &[u8],
        head: &FrameHead,
        path: &Path,
        format: ImageFileFormat,
    ) -> Result<(), CameraError> {
        self.lock().take_failure(MockOp::Save, "CameraSaveImage")?;
        let file_error = |e: &dyn std::fmt::Display| {
            CameraError::new(ErrorKind::FileError, "CameraSaveImage", e.to_string())
        };

        let channels = self.behavior.capabilities.channels();
        let pixels = output
            .get(..head.processed_len(channels))
            .ok_or_else(|| CameraError::status(SdkStatus::SizeMismatch, "CameraSaveImage"))?
            .to_vec();

        let image_format = match format {
            ImageFileFormat::Raw => {
                std::fs::write(path, &pixels).map_err(|e| file_error(&e))?;
                self.lock().stats.saves += 1;
                return Ok(());
            }
            ImageFileFormat::Bmp => ImageFormat::Bmp,
            ImageFileFormat::Png => ImageFormat::Png,
            ImageFileFormat::Jpeg => ImageFormat::Jpeg,
        };

        let result = if channels == 1 {
            GrayImage::from_raw(head.width, head.height, pixels)
                .ok_or_else(|| file_error(&"buffer does not match frame size"))?
                .save_with_format(path, image_format)
        } else {
            let rgb: Vec<u8> = pixels
                .chunks_exact(3)
                .flat_map(|bgr| [bgr[2], bgr[1], bgr[0]])
                .collect();
            RgbImage::from_raw(head.width, head.height, rgb)
                .ok_or_else(|| file_error(&"buffer does not match frame size"))?
                .save_with_format(path, image_format)
        };
        result.map_err(|e| file_error(&e))?;

        self.lock().stats.saves += 1;
        Ok(())
    }

    fn set_gain(&self, gain: i32) -> Result<(), CameraError> {
        let mut state = self.lock();
        state.take_failure(MockOp::SetGain, "CameraSetAnalogGain")?;
        if let Some(config) = state.config.as_mut() {
            config.gain = gain;
        }
        state.stats.gain = Some(gain);
        Ok(())
    }

    fn set_exposure(&self, exposure_s: f64) -> Result<(), CameraError> {
        let mut state = self.lock();
        state.take_failure(MockOp::SetExposure, "CameraSetExposureTime")?;
        if !(exposure_s > 0.0) {
            return check(SdkStatus::ParameterOutOfBound.code(), "CameraSetExposureTime");
        }
        if let Some(config) = state.config.as_mut() {
            config.exposure_s = exposure_s;
        }
        state.stats.exposure_s = Some(exposure_s);
        Ok(())
    }

    fn deactivate(&self) {
        let mut state = self.lock();
        state.active = false;
        state.playing = false;
        state.config = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AeState, Rotation};

    fn ready(trigger_mode: TriggerMode) -> MockDriver {
        let driver = MockDriver::new(MockBehavior::mono(8, 4));
        driver.initialize().unwrap();
        driver.activate(0).unwrap();
        driver
            .configure(&DeviceConfiguration {
                trigger_mode,
                ae_state: AeState::Manual,
                exposure_s: 0.01,
                gain: 50,
                rotation: Rotation::None,
                roi: None,
            })
            .unwrap();
        driver.play().unwrap();
        driver
    }

    #[test]
    fn test_continuous_frame_cycle() {
        let driver = ready(TriggerMode::Continuous);
        let (raw, head) = driver.borrow_raw(Duration::from_millis(100)).unwrap();
        assert_eq!((head.width, head.height), (8, 4));
        assert_eq!(driver.stats().outstanding, 1);

        let mut out = vec![0u8; 32];
        driver.process(&raw, &mut out, &head).unwrap();
        driver.return_raw(raw).unwrap();

        let stats = driver.stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.processed, 1);
        assert_eq!(out[1], 1);
    }

    #[test]
    fn test_software_trigger_required() {
        let driver = ready(TriggerMode::Software);
        let err = driver.borrow_raw(Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(driver.stats().outstanding, 0);

        driver.soft_trigger().unwrap();
        let (raw, head) = driver.borrow_raw(Duration::from_millis(100)).unwrap();
        assert!(head.is_trigger);
        driver.return_raw(raw).unwrap();
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let driver = ready(TriggerMode::Continuous);
        driver.fail_next(MockOp::Borrow, SdkStatus::TimeOut.code());
        assert!(driver.borrow_raw(Duration::from_millis(10)).is_err());
        let (raw, _) = driver.borrow_raw(Duration::from_millis(100)).unwrap();
        driver.return_raw(raw).unwrap();
    }

    #[test]
    fn test_double_activation_is_busy() {
        let driver = MockDriver::default();
        driver.initialize().unwrap();
        driver.activate(0).unwrap();
        assert_eq!(driver.activate(0).unwrap_err().kind(), ErrorKind::DeviceBusy);
    }

    #[test]
    fn test_small_output_buffer_rejected() {
        let driver = ready(TriggerMode::Continuous);
        let (raw, head) = driver.borrow_raw(Duration::from_millis(100)).unwrap();
        let mut out = vec![0u8; 4];
        let err = driver.process(&raw, &mut out, &head).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataIntegrity);
        driver.return_raw(raw).unwrap();
    }
}
