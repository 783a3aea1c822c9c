//! Camera Driver Interface
//!
//! Thin boundary around the MindVision camera SDK. The SDK itself is reached
//! through FFI (`ffi` feature); without the feature, and in tests, the
//! [`MockDriver`] stands in for the hardware.
//!
//! Every SDK call returns a status code which is translated by
//! [`status::check`] before anything else happens.

#[cfg(feature = "ffi")]
pub mod ffi;
pub mod mock;
pub mod status;

#[cfg(feature = "ffi")]
pub use ffi::MvSdkDriver;
pub use mock::{MockBehavior, MockDriver, MockStats};
pub use status::{check, release_on_error, CameraError, ErrorKind, SdkStatus};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Enumerated camera unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// 1-based position in the enumeration
    pub id: usize,
    pub serial_number: String,
    pub series: String,
    pub name: String,
    pub friendly_name: String,
    pub link_name: String,
    pub sensor_type: String,
    pub port_type: String,
    pub driver_version: String,
}

/// What the activated device can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionCapabilities {
    pub max_width: u32,
    pub max_height: u32,
    pub monochrome: bool,
}

impl SessionCapabilities {
    /// Bytes per pixel of the ISP output (MONO8 or BGR8)
    pub fn channels(&self) -> usize {
        if self.monochrome {
            1
        } else {
            3
        }
    }

    /// Size of the processed buffer needed for a full-resolution frame
    pub fn output_buffer_size(&self) -> usize {
        self.max_width as usize * self.max_height as usize * self.channels()
    }
}

/// Acquisition trigger behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Free-running
    Continuous,
    /// One frame per `soft_trigger`
    Software,
}

impl TriggerMode {
    pub fn sdk_value(self) -> i32 {
        match self {
            TriggerMode::Continuous => 0,
            TriggerMode::Software => 1,
        }
    }
}

/// Auto-exposure state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AeState {
    Manual,
    Auto,
}

/// Image rotation applied by the ISP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    #[default]
    None,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn sdk_value(self) -> i32 {
        match self {
            Rotation::None => 0,
            Rotation::Deg90 => 1,
            Rotation::Deg180 => 2,
            Rotation::Deg270 => 3,
        }
    }
}

/// Output window size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Full sensor configuration applied before `play`
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfiguration {
    pub trigger_mode: TriggerMode,
    pub ae_state: AeState,
    /// Exposure time in seconds
    pub exposure_s: f64,
    pub gain: i32,
    pub rotation: Rotation,
    /// Reduced output window, `None` for the full sensor
    pub roi: Option<Resolution>,
}

/// Per-frame header returned with a raw buffer
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameHead {
    pub media_type: u32,
    /// Raw payload size in bytes
    pub bytes: u32,
    pub width: u32,
    pub height: u32,
    pub is_trigger: bool,
    /// Device timestamp (0.1 ms units)
    pub timestamp: u32,
    pub exposure_us: u32,
    pub analog_gain: f32,
}

impl FrameHead {
    /// Bytes of processed output this frame occupies
    pub fn processed_len(&self, channels: usize) -> usize {
        self.width as usize * self.height as usize * channels
    }
}

/// File formats the SDK can write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFileFormat {
    Jpeg,
    Bmp,
    Raw,
    Png,
}

impl ImageFileFormat {
    pub fn sdk_value(self) -> u8 {
        match self {
            ImageFileFormat::Jpeg => 1,
            ImageFileFormat::Bmp => 2,
            ImageFileFormat::Raw => 4,
            ImageFileFormat::Png => 8,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageFileFormat::Jpeg => "jpg",
            ImageFileFormat::Bmp => "bmp",
            ImageFileFormat::Raw => "raw",
            ImageFileFormat::Png => "png",
        }
    }
}

/// Opaque handle to a driver-owned raw frame buffer.
///
/// Only the driver that produced it may interpret the value. It is neither
/// `Clone` nor `Copy`: handing it back to [`CameraDriver::return_raw`]
/// consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct RawHandle(usize);

impl RawHandle {
    pub fn from_raw(value: usize) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> usize {
        self.0
    }
}

/// Primitives the controller needs from the camera SDK
pub trait CameraDriver: Send + Sync + 'static {
    /// Load the SDK. Must precede every other call.
    fn initialize(&self) -> Result<(), CameraError>;

    fn enumerate_devices(&self) -> Result<Vec<Device>, CameraError>;

    /// Open the device at `index` (0-based into the last enumeration) and
    /// select the ISP output format for its sensor.
    fn activate(&self, index: usize) -> Result<SessionCapabilities, CameraError>;

    fn configure(&self, config: &DeviceConfiguration) -> Result<(), CameraError>;

    /// Enter working mode after `configure`
    fn play(&self) -> Result<(), CameraError>;

    fn soft_trigger(&self) -> Result<(), CameraError>;

    /// Borrow the next raw frame, waiting at most `timeout`
    fn borrow_raw(&self, timeout: Duration) -> Result<(RawHandle, FrameHead), CameraError>;

    /// Run the ISP on `raw` into `output`
    fn process(
        &self,
        raw: &RawHandle,
        output: &mut [u8],
        head: &FrameHead,
    ) -> Result<(), CameraError>;

    fn return_raw(&self, raw: RawHandle) -> Result<(), CameraError>;

    fn save_to_file(
        &self,
        output: &[u8],
        head: &FrameHead,
        path: &Path,
        format: ImageFileFormat,
    ) -> Result<(), CameraError>;

    fn set_gain(&self, gain: i32) -> Result<(), CameraError>;

    fn set_exposure(&self, exposure_s: f64) -> Result<(), CameraError>;

    /// Close the device. Safe to call more than once.
    fn deactivate(&self);
}
