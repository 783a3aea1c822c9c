//! Controller Error Types

use camera_driver::{CameraError, ErrorKind};
use thiserror::Error;

use crate::mode::OperatingMode;

/// Errors surfaced by the camera session
#[derive(Debug, Error)]
pub enum ControlError {
    /// A driver call failed
    #[error(transparent)]
    Driver(#[from] CameraError),

    /// The operation's mode is no longer the session's mode
    #[error("Mode changed: operation started in {expected}, camera is {current}")]
    ModeChanged {
        expected: OperatingMode,
        current: OperatingMode,
    },

    /// Another transition held the lock for too long
    #[error("Mode transition lock not acquired within {0}ms")]
    TransitionBusy(u64),

    /// The session was shut down
    #[error("Camera session is closed")]
    SessionClosed,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Processed frame could not be encoded
    #[error("Frame encoding failed: {0}")]
    Encode(String),

    /// A sink reported an unrecoverable failure
    #[error("Sink failed: {0}")]
    Sink(String),
}

impl ControlError {
    /// Category of the failure in the driver taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::Driver(e) => e.kind(),
            ControlError::ModeChanged { .. } | ControlError::TransitionBusy(_) => {
                ErrorKind::DeviceBusy
            }
            ControlError::SessionClosed => ErrorKind::NotInitialized,
            ControlError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            ControlError::Encode(_) => ErrorKind::DataIntegrity,
            ControlError::Sink(_) => ErrorKind::IoError,
        }
    }

    /// Skip the frame and retry
    pub fn is_continuable(&self) -> bool {
        matches!(self, ControlError::Driver(e) if e.is_continuable())
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
