//! FFI bindings for the MindVision camera SDK

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_uint};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::status::{check, release_on_error, CameraError, ErrorKind};
use crate::{
    AeState, CameraDriver, Device, DeviceConfiguration, FrameHead, ImageFileFormat, RawHandle,
    SessionCapabilities,
};

/// Maximum devices the SDK enumerates in one call
const MAX_DEVICES: usize = 32;

const LANGUAGE_ENGLISH: c_int = 0;
const PARAM_MODE_BY_MODEL: c_int = -1;
const PARAM_TEAM_LAST: c_int = -1;

const MEDIA_TYPE_MONO8: c_uint = 0x0108_0001;
const MEDIA_TYPE_BGR8: c_uint = 0x0218_0015;

const NO_HANDLE: i32 = -1;

/// `tSdkCameraDevInfo`
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CDeviceInfo {
    pub product_series: [c_char; 32],
    pub product_name: [c_char; 32],
    pub friendly_name: [c_char; 32],
    pub link_name: [c_char; 32],
    pub driver_version: [c_char; 32],
    pub sensor_type: [c_char; 32],
    pub port_type: [c_char; 32],
    pub serial_number: [c_char; 32],
    pub instance: c_uint,
}

/// `tSdkFrameHead`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CFrameHead {
    pub media_type: c_uint,
    pub bytes: c_uint,
    pub width: c_int,
    pub height: c_int,
    pub width_zoom_sw: c_int,
    pub height_zoom_sw: c_int,
    pub is_trigger: c_int,
    pub timestamp: c_uint,
    pub exposure_time: c_uint,
    pub analog_gain: f32,
    pub gamma: c_int,
    pub contrast: c_int,
    pub saturation: c_int,
    pub r_gain: f32,
    pub g_gain: f32,
    pub b_gain: f32,
}

impl From<CFrameHead> for FrameHead {
    fn from(c: CFrameHead) -> Self {
        Self {
            media_type: c.media_type,
            bytes: c.bytes,
            width: c.width.max(0) as u32,
            height: c.height.max(0) as u32,
            is_trigger: c.is_trigger != 0,
            timestamp: c.timestamp,
            exposure_us: c.exposure_time,
            analog_gain: c.analog_gain,
        }
    }
}

impl From<&FrameHead> for CFrameHead {
    fn from(h: &FrameHead) -> Self {
        Self {
            media_type: h.media_type,
            bytes: h.bytes,
            width: h.width as c_int,
            height: h.height as c_int,
            is_trigger: h.is_trigger as c_int,
            timestamp: h.timestamp,
            exposure_time: h.exposure_us,
            analog_gain: h.analog_gain,
            ..Default::default()
        }
    }
}

/// Capability fields read through the C shim
#[repr(C)]
#[derive(Debug, Default)]
struct CCapabilitySummary {
    max_width: c_int,
    max_height: c_int,
    monochrome: c_int,
}

type CameraHandle = c_int;

extern "C" {
    fn CameraSdkInit(language: c_int) -> c_int;
    fn CameraEnumerateDevice(list: *mut CDeviceInfo, count: *mut c_int) -> c_int;
    fn CameraInit(
        info: *mut CDeviceInfo,
        param_mode: c_int,
        team: c_int,
        handle: *mut CameraHandle,
    ) -> c_int;
    fn CameraUnInit(handle: CameraHandle) -> c_int;
    fn CameraSetIspOutFormat(handle: CameraHandle, format: c_uint) -> c_int;
    fn CameraSetTriggerMode(handle: CameraHandle, mode: c_int) -> c_int;
    fn CameraSetAeState(handle: CameraHandle, auto: c_int) -> c_int;
    fn CameraSetExposureTime(handle: CameraHandle, exposure_us: f64) -> c_int;
    fn CameraSetAnalogGain(handle: CameraHandle, gain: c_int) -> c_int;
    fn CameraSetRotate(handle: CameraHandle, rotation: c_int) -> c_int;
    fn CameraPlay(handle: CameraHandle) -> c_int;
    fn CameraSoftTrigger(handle: CameraHandle) -> c_int;
    fn CameraGetImageBuffer(
        handle: CameraHandle,
        head: *mut CFrameHead,
        buffer: *mut *mut u8,
        timeout_ms: c_uint,
    ) -> c_int;
    fn CameraImageProcess(
        handle: CameraHandle,
        raw: *mut u8,
        output: *mut u8,
        head: *mut CFrameHead,
    ) -> c_int;
    fn CameraReleaseImageBuffer(handle: CameraHandle, raw: *mut u8) -> c_int;
    fn CameraSaveImage(
        handle: CameraHandle,
        path: *const c_char,
        buffer: *mut u8,
        head: *mut CFrameHead,
        file_type: c_uint,
        quality: u8,
    ) -> c_int;

    fn mv_shim_capability(handle: CameraHandle, out: *mut CCapabilitySummary) -> c_int;
    fn mv_shim_set_resolution(handle: CameraHandle, width: c_int, height: c_int) -> c_int;
}

fn c_string(field: &[c_char]) -> String {
    // SAFETY: the SDK NUL-terminates every fixed-size name field
    unsafe { CStr::from_ptr(field.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

impl CDeviceInfo {
    fn to_device(&self, id: usize) -> Device {
        Device {
            id,
            serial_number: c_string(&self.serial_number),
            series: c_string(&self.product_series),
            name: c_string(&self.product_name),
            friendly_name: c_string(&self.friendly_name),
            link_name: c_string(&self.link_name),
            sensor_type: c_string(&self.sensor_type),
            port_type: c_string(&self.port_type),
            driver_version: c_string(&self.driver_version),
        }
    }
}

/// Camera driver backed by `libMVSDK`
pub struct MvSdkDriver {
    handle: AtomicI32,
    devices: Mutex<Vec<CDeviceInfo>>,
    capabilities: Mutex<Option<SessionCapabilities>>,
}

impl MvSdkDriver {
    pub fn new() -> Self {
        Self {
            handle: AtomicI32::new(NO_HANDLE),
            devices: Mutex::new(Vec::new()),
            capabilities: Mutex::new(None),
        }
    }

    fn handle(&self, context: &'static str) -> Result<CameraHandle, CameraError> {
        match self.handle.load(Ordering::Acquire) {
            NO_HANDLE => Err(CameraError::new(
                ErrorKind::NotInitialized,
                context,
                "no camera activated",
            )),
            h => Ok(h),
        }
    }

    /// Read the sensor limits and pick the ISP output format for a fresh handle
    fn prepare(handle: CameraHandle) -> Result<SessionCapabilities, CameraError> {
        let mut summary = CCapabilitySummary::default();
        check(unsafe { mv_shim_capability(handle, &mut summary) }, "CameraGetCapability")?;
        let caps = SessionCapabilities {
            max_width: summary.max_width.max(0) as u32,
            max_height: summary.max_height.max(0) as u32,
            monochrome: summary.monochrome != 0,
        };

        let format = if caps.monochrome {
            MEDIA_TYPE_MONO8
        } else {
            MEDIA_TYPE_BGR8
        };
        check(unsafe { CameraSetIspOutFormat(handle, format) }, "CameraSetIspOutFormat")?;
        Ok(caps)
    }
}

impl Default for MvSdkDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraDriver for MvSdkDriver {
    fn initialize(&self) -> Result<(), CameraError> {
        check(unsafe { CameraSdkInit(LANGUAGE_ENGLISH) }, "CameraSdkInit")?;
        info!("Camera SDK initialized");
        Ok(())
    }

    fn enumerate_devices(&self) -> Result<Vec<Device>, CameraError> {
        // SAFETY: CDeviceInfo is plain old data; all-zero is a valid value
        let mut list: Vec<CDeviceInfo> = vec![unsafe { std::mem::zeroed() }; MAX_DEVICES];
        let mut count = MAX_DEVICES as c_int;
        check(
            unsafe { CameraEnumerateDevice(list.as_mut_ptr(), &mut count) },
            "CameraEnumerateDevice",
        )?;
        list.truncate(count.clamp(0, MAX_DEVICES as c_int) as usize);

        let devices = list
            .iter()
            .enumerate()
            .map(|(i, info)| info.to_device(i + 1))
            .collect();
        *self.devices.lock().unwrap_or_else(|p| p.into_inner()) = list;
        Ok(devices)
    }

    fn activate(&self, index: usize) -> Result<SessionCapabilities, CameraError> {
        let mut info = self
            .devices
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(index)
            .copied()
            .ok_or_else(|| {
                CameraError::new(
                    ErrorKind::NoDevice,
                    "CameraInit",
                    format!("no device at index {}", index),
                )
            })?;

        let mut handle: CameraHandle = NO_HANDLE;
        check(
            unsafe { CameraInit(&mut info, PARAM_MODE_BY_MODEL, PARAM_TEAM_LAST, &mut handle) },
            "CameraInit",
        )?;
        self.handle.store(handle, Ordering::Release);

        // Close the handle again if setup fails.
        let caps = release_on_error(|| Self::prepare(handle), || self.deactivate())?;
        *self.capabilities.lock().unwrap_or_else(|p| p.into_inner()) = Some(caps);

        info!(
            "Camera activated: {}x{} {}",
            caps.max_width,
            caps.max_height,
            if caps.monochrome { "mono" } else { "color" }
        );
        Ok(caps)
    }

    fn configure(&self, config: &DeviceConfiguration) -> Result<(), CameraError> {
        let h = self.handle("CameraSetTriggerMode")?;
        check(
            unsafe { CameraSetTriggerMode(h, config.trigger_mode.sdk_value()) },
            "CameraSetTriggerMode",
        )?;
        let auto = matches!(config.ae_state, AeState::Auto) as c_int;
        check(unsafe { CameraSetAeState(h, auto) }, "CameraSetAeState")?;
        check(
            unsafe { CameraSetExposureTime(h, config.exposure_s * 1_000_000.0) },
            "CameraSetExposureTime",
        )?;
        check(unsafe { CameraSetAnalogGain(h, config.gain) }, "CameraSetAnalogGain")?;

        let caps = *self.capabilities.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(caps) = caps {
            let (width, height) = match config.roi {
                Some(roi) => (roi.width, roi.height),
                None => (caps.max_width, caps.max_height),
            };
            check(
                unsafe { mv_shim_set_resolution(h, width as c_int, height as c_int) },
                "CameraSetImageResolution",
            )?;
        }

        check(unsafe { CameraSetRotate(h, config.rotation.sdk_value()) }, "CameraSetRotate")?;
        debug!("Camera configured: {:?}", config);
        Ok(())
    }

    fn play(&self) -> Result<(), CameraError> {
        let h = self.handle("CameraPlay")?;
        check(unsafe { CameraPlay(h) }, "CameraPlay")
    }

    fn soft_trigger(&self) -> Result<(), CameraError> {
        let h = self.handle("CameraSoftTrigger")?;
        check(unsafe { CameraSoftTrigger(h) }, "CameraSoftTrigger")
    }

    fn borrow_raw(&self, timeout: Duration) -> Result<(RawHandle, FrameHead), CameraError> {
        let h = self.handle("CameraGetImageBuffer")?;
        let mut head = CFrameHead::default();
        let mut raw: *mut u8 = std::ptr::null_mut();
        let timeout_ms = timeout.as_millis().min(c_uint::MAX as u128) as c_uint;
        check(
            unsafe { CameraGetImageBuffer(h, &mut head, &mut raw, timeout_ms) },
            "CameraGetImageBuffer",
        )?;
        Ok((RawHandle::from_raw(raw as usize), head.into()))
    }

    fn process(
        &self,
        raw: &RawHandle,
        output: &mut [u8],
        head: &FrameHead,
    ) -> Result<(), CameraError> {
        let h = self.handle("CameraImageProcess")?;
        let mut c_head = CFrameHead::from(head);
        check(
            unsafe {
                CameraImageProcess(h, raw.as_raw() as *mut u8, output.as_mut_ptr(), &mut c_head)
            },
            "CameraImageProcess",
        )
    }

    fn return_raw(&self, raw: RawHandle) -> Result<(), CameraError> {
        let h = self.handle("CameraReleaseImageBuffer")?;
        check(
            unsafe { CameraReleaseImageBuffer(h, raw.as_raw() as *mut u8) },
            "CameraReleaseImageBuffer",
        )
    }

    fn save_to_file(
        &self,
        output: &[u8],
        head: &FrameHead,
        path: &Path,
        format: ImageFileFormat,
    ) -> Result<(), CameraError> {
        let h = self.handle("CameraSaveImage")?;
        let c_path = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|e| {
                CameraError::new(ErrorKind::InvalidParameter, "CameraSaveImage", e.to_string())
            })?;
        let mut c_head = CFrameHead::from(head);
        // The SDK takes a mutable pointer but only reads the image buffer.
        check(
            unsafe {
                CameraSaveImage(
                    h,
                    c_path.as_ptr(),
                    output.as_ptr() as *mut u8,
                    &mut c_head,
                    format.sdk_value() as c_uint,
                    100,
                )
            },
            "CameraSaveImage",
        )
    }

    fn set_gain(&self, gain: i32) -> Result<(), CameraError> {
        let h = self.handle("CameraSetAnalogGain")?;
        check(unsafe { CameraSetAnalogGain(h, gain) }, "CameraSetAnalogGain")
    }

    fn set_exposure(&self, exposure_s: f64) -> Result<(), CameraError> {
        let h = self.handle("CameraSetExposureTime")?;
        check(
            unsafe { CameraSetExposureTime(h, exposure_s * 1_000_000.0) },
            "CameraSetExposureTime",
        )
    }

    fn deactivate(&self) {
        let h = self.handle.swap(NO_HANDLE, Ordering::AcqRel);
        if h == NO_HANDLE {
            return;
        }
        if let Err(e) = check(unsafe { CameraUnInit(h) }, "CameraUnInit") {
            warn!("Camera release failed: {}", e);
        } else {
            info!("Camera released");
        }
    }
}

impl Drop for MvSdkDriver {
    fn drop(&mut self) {
        self.deactivate();
    }
}
