//! Camera Session
//!
//! Exclusive owner of one activated device: the driver, the processed output
//! buffer and the mode controller. Shared between request handlers as
//! `Arc<CameraSession<D>>`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use camera_driver::{
    CameraDriver, CameraError, Device, DeviceConfiguration, ErrorKind, ImageFileFormat,
    SessionCapabilities,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::buffer::OutputBuffer;
use crate::error::{ControlError, Result};
use crate::mode::{
    CaptureParams, ModeController, ModeRequest, OperatingMode, OperationGuard, Transition,
};
use crate::settings::CameraSettings;
use crate::sink::{capture_once, FileSink, RegionSink};

/// Live exposure and gain as last applied to the device
#[derive(Debug, Clone, Copy, PartialEq)]
struct Exposure {
    exposure_s: f64,
    gain: i32,
}

/// Session status for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub mode: OperatingMode,
    pub transitioning: bool,
    pub in_flight: usize,
    pub exposure_s: f64,
    pub gain: i32,
    pub max_width: u32,
    pub max_height: u32,
    pub monochrome: bool,
    pub buffer_size: usize,
    pub closed: bool,
}

/// One activated camera
pub struct CameraSession<D: CameraDriver> {
    driver: D,
    settings: CameraSettings,
    devices: Vec<Device>,
    capabilities: SessionCapabilities,
    output: Mutex<Option<OutputBuffer>>,
    buffer_len: usize,
    modes: ModeController,
    exposure: Mutex<Exposure>,
    /// Serializes single-shot captures so their parameters cannot interleave
    capture_lock: Mutex<()>,
    closed: AtomicBool,
}

impl<D: CameraDriver> CameraSession<D> {
    /// Initialize the SDK, activate `settings.device_index` and allocate the
    /// output buffer for the sensor's full size.
    pub fn open(driver: D, settings: CameraSettings) -> Result<Self> {
        driver.initialize()?;

        let devices = driver.enumerate_devices()?;
        info!("Found {} camera(s)", devices.len());
        for device in &devices {
            debug!(
                "Camera {}: {} ({}) sn={} port={}",
                device.id, device.friendly_name, device.name, device.serial_number, device.port_type
            );
        }

        if settings.device_index >= devices.len() {
            return Err(CameraError::new(
                ErrorKind::NoDevice,
                "CameraEnumerateDevice",
                format!("device {} requested, {} found", settings.device_index, devices.len()),
            )
            .into());
        }

        let capabilities = driver.activate(settings.device_index)?;
        let buffer = OutputBuffer::allocate(capabilities.output_buffer_size());
        info!(
            "Camera {} active: {}x{} {}",
            settings.device_index,
            capabilities.max_width,
            capabilities.max_height,
            if capabilities.monochrome { "mono" } else { "colour" }
        );

        let exposure = Exposure {
            exposure_s: settings.preview.exposure_ms / 1000.0,
            gain: settings.preview.gain,
        };
        let modes = ModeController::new(settings.transition_timeout());

        Ok(Self {
            driver,
            settings,
            devices,
            capabilities,
            buffer_len: buffer.len(),
            output: Mutex::new(Some(buffer)),
            modes,
            exposure: Mutex::new(exposure),
            capture_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn capabilities(&self) -> &SessionCapabilities {
        &self.capabilities
    }

    pub fn settings(&self) -> &CameraSettings {
        &self.settings
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn mode(&self) -> OperatingMode {
        self.modes.mode()
    }

    /// Registered operations
    pub fn in_flight(&self) -> usize {
        self.modes.in_flight()
    }

    /// Processed buffer size, 0 once the session is closed
    pub fn buffer_size(&self) -> usize {
        if self.closed.load(Ordering::SeqCst) {
            0
        } else {
            self.buffer_len
        }
    }

    /// Switch modes without registering an operation
    pub fn request_mode(&self, request: ModeRequest) -> Result<Transition> {
        self.ensure_open()?;
        let request = self.validate(request)?;
        self.modes.request_with(
            request.mode(),
            || self.apply(&self.configuration_for(&request)),
            || self.update_exposure(&request),
        )
    }

    /// Switch to the requested mode if needed and register one operation in it
    pub fn begin(&self, request: ModeRequest) -> Result<OperationGuard<'_>> {
        self.ensure_open()?;
        let request = self.validate(request)?;
        self.modes.begin_with(
            request.mode(),
            || self.apply(&self.configuration_for(&request)),
            || self.update_exposure(&request),
        )
    }

    /// Change the analog gain without a mode transition
    pub fn set_gain(&self, gain: i32) -> Result<()> {
        self.ensure_open()?;
        self.modes.exclusive(|| self.write_gain(gain))
    }

    /// Change the exposure time (seconds) without a mode transition
    pub fn set_exposure(&self, exposure_s: f64) -> Result<()> {
        self.ensure_open()?;
        validate_exposure(exposure_s)?;
        self.modes.exclusive(|| self.write_exposure(exposure_s))
    }

    /// Capture one still and save it as BMP under `output_dir`.
    ///
    /// `name` is reduced to its final path component; without one the file
    /// is named after the local time.
    pub fn capture_to_file(&self, params: CaptureParams, name: Option<&str>) -> Result<PathBuf> {
        let file_name = match name {
            Some(name) => sanitize_file_name(name)?,
            None => timestamp_file_name(),
        };
        let path = self.settings.output_dir.join(file_name);

        let _capture = self.lock_capture();
        let mut sink = FileSink::new(&self.driver, &path, ImageFileFormat::Bmp);
        capture_once(self, params, &mut sink)?;
        info!("Captured {}", path.display());
        Ok(path)
    }

    /// Capture one still and return the centred `roi` window as PNG
    pub fn capture_region(&self, params: CaptureParams) -> Result<Vec<u8>> {
        let _capture = self.lock_capture();
        let mut sink = RegionSink::new(self.settings.roi);
        capture_once(self, params, &mut sink)?;
        sink.into_png()
            .ok_or_else(|| ControlError::Encode("no frame captured".to_string()))
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let exposure = *self.lock_exposure();
        SessionSnapshot {
            mode: self.modes.mode(),
            transitioning: self.modes.is_transitioning(),
            in_flight: self.modes.in_flight(),
            exposure_s: exposure.exposure_s,
            gain: exposure.gain,
            max_width: self.capabilities.max_width,
            max_height: self.capabilities.max_height,
            monochrome: self.capabilities.monochrome,
            buffer_size: self.buffer_size(),
            closed: self.closed.load(Ordering::SeqCst),
        }
    }

    /// Release the output buffer and close the device. Later calls fail with
    /// `SessionClosed`; calling twice is harmless.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Waits for a frame still being read.
        if let Some(buffer) = self.lock_output().take() {
            buffer.release();
        }
        self.driver.deactivate();
        info!("Camera session closed");
    }

    pub(crate) fn lock_output(&self) -> MutexGuard<'_, Option<OutputBuffer>> {
        self.output.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_exposure(&self) -> MutexGuard<'_, Exposure> {
        self.exposure.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_capture(&self) -> MutexGuard<'_, ()> {
        self.capture_lock.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ControlError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn validate(&self, request: ModeRequest) -> Result<ModeRequest> {
        if let ModeRequest::Capture(params) = &request {
            validate_exposure(params.exposure_s)?;
        }
        Ok(request)
    }

    fn configuration_for(&self, request: &ModeRequest) -> DeviceConfiguration {
        match request {
            ModeRequest::Preview => self.settings.preview_configuration(&self.capabilities),
            ModeRequest::Capture(params) => self.settings.capture_configuration(params),
        }
    }

    /// Full reconfiguration; only called by the mode controller after draining
    fn apply(&self, config: &DeviceConfiguration) -> Result<()> {
        debug!(
            "Configuring camera: trigger={:?} exposure={}s gain={} rotation={:?} roi={:?}",
            config.trigger_mode, config.exposure_s, config.gain, config.rotation, config.roi
        );
        self.driver.configure(config)?;
        self.driver.play()?;
        *self.lock_exposure() = Exposure {
            exposure_s: config.exposure_s,
            gain: config.gain,
        };
        Ok(())
    }

    /// Bring exposure and gain in line with a capture request that found the
    /// camera already in capture mode. Runs under the transition slot.
    fn update_exposure(&self, request: &ModeRequest) -> Result<()> {
        let ModeRequest::Capture(params) = request else {
            return Ok(());
        };
        let current = *self.lock_exposure();
        if current.gain != params.gain {
            self.write_gain(params.gain)?;
        }
        if current.exposure_s != params.exposure_s {
            self.write_exposure(params.exposure_s)?;
        }
        Ok(())
    }

    fn write_gain(&self, gain: i32) -> Result<()> {
        self.driver.set_gain(gain)?;
        self.lock_exposure().gain = gain;
        debug!("Gain set to {}", gain);
        Ok(())
    }

    fn write_exposure(&self, exposure_s: f64) -> Result<()> {
        self.driver.set_exposure(exposure_s)?;
        self.lock_exposure().exposure_s = exposure_s;
        debug!("Exposure set to {}s", exposure_s);
        Ok(())
    }
}

impl<D: CameraDriver> Drop for CameraSession<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn validate_exposure(exposure_s: f64) -> Result<()> {
    if exposure_s.is_finite() && exposure_s > 0.0 {
        Ok(())
    } else {
        Err(ControlError::InvalidParameter(format!(
            "exposure must be a positive number of seconds, got {}",
            exposure_s
        )))
    }
}

/// Final path component of `name`, with `.bmp` added when it has no extension
fn sanitize_file_name(name: &str) -> Result<String> {
    let file_name = Path::new(name.trim())
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ControlError::InvalidParameter(format!("invalid file name {:?}", name)))?;

    if file_name != name.trim() {
        warn!("Capture name {:?} reduced to {:?}", name, file_name);
    }
    if Path::new(file_name).extension().is_some() {
        Ok(file_name.to_string())
    } else {
        Ok(format!("{}.{}", file_name, ImageFileFormat::Bmp.extension()))
    }
}

fn timestamp_file_name() -> String {
    format!(
        "{}.{}",
        chrono::Local::now().format("%Y-%m-%d_%H_%M_%S"),
        ImageFileFormat::Bmp.extension()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use camera_driver::{MockBehavior, MockDriver, TriggerMode};

    fn session() -> CameraSession<MockDriver> {
        CameraSession::open(
            MockDriver::new(MockBehavior::mono(32, 16)),
            CameraSettings::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_open_allocates_full_frame() {
        let session = session();
        assert_eq!(session.buffer_size(), 32 * 16);
        assert_eq!(session.mode(), OperatingMode::Idle);
        assert_eq!(session.devices().len(), 1);
        assert_eq!(session.driver().stats().activate_calls, 1);
    }

    #[test]
    fn test_open_missing_device() {
        let settings = CameraSettings {
            device_index: 3,
            ..Default::default()
        };
        let err = CameraSession::open(MockDriver::default(), settings).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NoDevice);
    }

    #[test]
    fn test_preview_configures_once() {
        let session = session();
        session.request_mode(ModeRequest::Preview).unwrap();
        session.request_mode(ModeRequest::Preview).unwrap();

        let stats = session.driver().stats();
        assert_eq!(stats.configure_calls, 1);
        assert_eq!(stats.play_calls, 1);
        assert_eq!(stats.configurations[0].trigger_mode, TriggerMode::Continuous);
    }

    #[test]
    fn test_capture_params_applied_without_reconfigure() {
        let session = session();
        let first = CaptureParams { exposure_s: 0.01, gain: 10 };
        let second = CaptureParams { exposure_s: 0.02, gain: 20 };

        session.request_mode(ModeRequest::Capture(first)).unwrap();
        let t = session.request_mode(ModeRequest::Capture(second)).unwrap();
        assert_eq!(t, Transition::Unchanged);

        let stats = session.driver().stats();
        assert_eq!(stats.configure_calls, 1);
        assert_eq!(stats.gain, Some(20));
        assert_eq!(stats.exposure_s, Some(0.02));
        let snapshot = session.snapshot();
        assert_eq!(snapshot.gain, 20);
        assert_eq!(snapshot.exposure_s, 0.02);
    }

    #[test]
    fn test_invalid_exposure_rejected() {
        let session = session();
        let err = session
            .request_mode(ModeRequest::Capture(CaptureParams { exposure_s: -1.0, gain: 0 }))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
        assert_eq!(session.driver().stats().configure_calls, 0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let session = session();
        session.shutdown();
        session.shutdown();
        assert_eq!(session.buffer_size(), 0);
        assert!(matches!(
            session.request_mode(ModeRequest::Preview),
            Err(ControlError::SessionClosed)
        ));
        assert!(session.snapshot().closed);
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("shot").unwrap(), "shot.bmp");
        assert_eq!(sanitize_file_name("shot.bmp").unwrap(), "shot.bmp");
        assert_eq!(sanitize_file_name("../../etc/shot").unwrap(), "shot.bmp");
        assert!(sanitize_file_name("..").is_err());
        assert!(sanitize_file_name("").is_err());
    }

    #[test]
    fn test_timestamp_file_name_format() {
        let name = timestamp_file_name();
        // YYYY-MM-DD_HH_MM_SS.bmp
        assert_eq!(name.len(), 23);
        assert!(name.ends_with(".bmp"));
        assert_eq!(&name[4..5], "-");
        assert_eq!(&name[10..11], "_");
    }
}
