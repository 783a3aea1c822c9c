//! Camera session settings

use std::path::PathBuf;
use std::time::Duration;

use camera_driver::{
    AeState, DeviceConfiguration, Resolution, Rotation, SessionCapabilities, TriggerMode,
};
use serde::{Deserialize, Serialize};

use crate::mode::CaptureParams;

/// Camera session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// Index into the enumerated device list
    pub device_index: usize,

    /// Directory captured files are written to
    pub output_dir: PathBuf,

    /// ISP rotation for both modes (the sensor is mounted upside down)
    pub rotation: Rotation,

    /// Raw buffer wait per frame (milliseconds)
    pub grab_timeout_ms: u64,

    /// Wait for the mode transition lock (milliseconds)
    pub transition_timeout_ms: u64,

    /// JPEG quality for streamed frames (1-100)
    pub jpeg_quality: u8,

    /// Window cut from the centre of a region capture
    pub roi: Resolution,

    pub preview: PreviewSettings,

    /// Defaults for captures that do not specify exposure or gain
    pub capture: CaptureSettings,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            device_index: 0,
            output_dir: PathBuf::from("./"),
            rotation: Rotation::Deg180,
            grab_timeout_ms: 6000,
            transition_timeout_ms: 10_000,
            jpeg_quality: 60,
            roi: Resolution {
                width: 1000,
                height: 666,
            },
            preview: PreviewSettings::default(),
            capture: CaptureSettings::default(),
        }
    }
}

impl CameraSettings {
    pub fn grab_timeout(&self) -> Duration {
        Duration::from_millis(self.grab_timeout_ms)
    }

    pub fn transition_timeout(&self) -> Duration {
        Duration::from_millis(self.transition_timeout_ms)
    }

    /// Device configuration for live preview
    pub fn preview_configuration(&self, caps: &SessionCapabilities) -> DeviceConfiguration {
        let roi = self.preview.half_resolution.then(|| Resolution {
            width: (caps.max_width / 2).max(1),
            height: (caps.max_height / 2).max(1),
        });
        DeviceConfiguration {
            trigger_mode: TriggerMode::Continuous,
            ae_state: AeState::Manual,
            exposure_s: self.preview.exposure_ms / 1000.0,
            gain: self.preview.gain,
            rotation: self.rotation,
            roi,
        }
    }

    /// Device configuration for software-triggered stills
    pub fn capture_configuration(&self, params: &CaptureParams) -> DeviceConfiguration {
        DeviceConfiguration {
            trigger_mode: TriggerMode::Software,
            ae_state: AeState::Manual,
            exposure_s: params.exposure_s,
            gain: params.gain,
            rotation: self.rotation,
            roi: None,
        }
    }

    /// Capture parameters, filling gaps from the configured defaults
    pub fn capture_params(&self, exposure_s: Option<f64>, gain: Option<i32>) -> CaptureParams {
        CaptureParams {
            exposure_s: exposure_s.unwrap_or(self.capture.exposure_s),
            gain: gain.unwrap_or(self.capture.gain),
        }
    }
}

/// Free-running preview parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewSettings {
    /// Fixed short exposure (milliseconds)
    pub exposure_ms: f64,
    pub gain: i32,
    /// Stream at half the sensor size
    pub half_resolution: bool,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            exposure_ms: 2.0,
            gain: 100,
            half_resolution: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Exposure (seconds)
    pub exposure_s: f64,
    pub gain: i32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            exposure_s: 0.05,
            gain: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> SessionCapabilities {
        SessionCapabilities {
            max_width: 3088,
            max_height: 2064,
            monochrome: false,
        }
    }

    #[test]
    fn test_default_settings() {
        let settings = CameraSettings::default();
        assert_eq!(settings.grab_timeout(), Duration::from_secs(6));
        assert_eq!(settings.jpeg_quality, 60);
        assert_eq!(settings.rotation, Rotation::Deg180);
        assert_eq!(settings.roi.width, 1000);
    }

    #[test]
    fn test_preview_configuration() {
        let config = CameraSettings::default().preview_configuration(&caps());
        assert_eq!(config.trigger_mode, TriggerMode::Continuous);
        assert_eq!(config.ae_state, AeState::Manual);
        assert!((config.exposure_s - 0.002).abs() < 1e-12);
        assert_eq!(config.roi, Some(Resolution { width: 1544, height: 1032 }));
    }

    #[test]
    fn test_preview_full_resolution() {
        let mut settings = CameraSettings::default();
        settings.preview.half_resolution = false;
        assert_eq!(settings.preview_configuration(&caps()).roi, None);
    }

    #[test]
    fn test_capture_configuration() {
        let settings = CameraSettings::default();
        let params = settings.capture_params(Some(0.5), None);
        let config = settings.capture_configuration(&params);
        assert_eq!(config.trigger_mode, TriggerMode::Software);
        assert_eq!(config.exposure_s, 0.5);
        assert_eq!(config.gain, 100);
        assert_eq!(config.rotation, Rotation::Deg180);
        assert_eq!(config.roi, None);
    }
}
