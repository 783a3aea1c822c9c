//! SDK Status Codes and Error Translation
//!
//! Every SDK call returns an `int` status. This module collapses the vendor's
//! status table into a closed [`ErrorKind`] taxonomy and wraps failures with
//! the name of the call that produced them.

use std::fmt;
use thiserror::Error;

/// Status codes returned by the camera SDK
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkStatus {
    Success = 0,
    Failed = -1,
    InternalError = -2,
    Unknown = -3,
    NotSupported = -4,
    NotInitialized = -5,
    ParameterInvalid = -6,
    ParameterOutOfBound = -7,
    Unenabled = -8,
    UserCancel = -9,
    PathNotFound = -10,
    SizeMismatch = -11,
    TimeOut = -12,
    IoError = -13,
    CommError = -14,
    BusError = -15,
    NoDeviceFound = -16,
    NoLogicDeviceFound = -17,
    DeviceIsOpened = -18,
    DeviceIsClosed = -19,
    DeviceVideoClosed = -20,
    NoMemory = -21,
    FileCreateFailed = -22,
    FileInvalid = -23,
    WriteProtected = -24,
    GrabFailed = -25,
    LostData = -26,
    EofError = -27,
    Busy = -28,
    Wait = -29,
    InProcess = -30,
    IicError = -31,
    SpiError = -32,
    UsbControlError = -33,
    UsbBulkError = -34,
    SocketInitError = -35,
    GigeFilterInitError = -36,
    NetSendError = -37,
    DeviceLost = -38,
    DataRecvLess = -39,
    FunctionLoadFailed = -40,
    CriticalFileLost = -41,
    SensorIdMismatch = -42,
    OutOfRange = -43,
    RegistryError = -44,
    AccessDeny = -45,
    CameraNeedReset = -46,
    IspModuleNotInitialized = -47,
    IspDataCrcError = -48,
    MvTestFailed = -49,
    InternalErr1 = -50,
    U3vNoControlEp = -51,
    U3vControlError = -52,
}

impl SdkStatus {
    /// Decode a raw status, `None` for codes outside the vendor table
    pub fn from_code(code: i32) -> Option<Self> {
        use SdkStatus::*;
        let status = match code {
            0 => Success,
            -1 => Failed,
            -2 => InternalError,
            -3 => Unknown,
            -4 => NotSupported,
            -5 => NotInitialized,
            -6 => ParameterInvalid,
            -7 => ParameterOutOfBound,
            -8 => Unenabled,
            -9 => UserCancel,
            -10 => PathNotFound,
            -11 => SizeMismatch,
            -12 => TimeOut,
            -13 => IoError,
            -14 => CommError,
            -15 => BusError,
            -16 => NoDeviceFound,
            -17 => NoLogicDeviceFound,
            -18 => DeviceIsOpened,
            -19 => DeviceIsClosed,
            -20 => DeviceVideoClosed,
            -21 => NoMemory,
            -22 => FileCreateFailed,
            -23 => FileInvalid,
            -24 => WriteProtected,
            -25 => GrabFailed,
            -26 => LostData,
            -27 => EofError,
            -28 => Busy,
            -29 => Wait,
            -30 => InProcess,
            -31 => IicError,
            -32 => SpiError,
            -33 => UsbControlError,
            -34 => UsbBulkError,
            -35 => SocketInitError,
            -36 => GigeFilterInitError,
            -37 => NetSendError,
            -38 => DeviceLost,
            -39 => DataRecvLess,
            -40 => FunctionLoadFailed,
            -41 => CriticalFileLost,
            -42 => SensorIdMismatch,
            -43 => OutOfRange,
            -44 => RegistryError,
            -45 => AccessDeny,
            -46 => CameraNeedReset,
            -47 => IspModuleNotInitialized,
            -48 => IspDataCrcError,
            -49 => MvTestFailed,
            -50 => InternalErr1,
            -51 => U3vNoControlEp,
            -52 => U3vControlError,
            _ => return None,
        };
        Some(status)
    }

    /// Raw code as reported by the SDK
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Error kind for a failing status. `None` for `Success`.
    pub fn kind(self) -> Option<ErrorKind> {
        use SdkStatus::*;
        let kind = match self {
            Success => return None,
            NotSupported | Unenabled | SensorIdMismatch => ErrorKind::Unsupported,
            NotInitialized | DeviceIsClosed | DeviceVideoClosed | IspModuleNotInitialized => {
                ErrorKind::NotInitialized
            }
            ParameterInvalid | ParameterOutOfBound | OutOfRange => ErrorKind::InvalidParameter,
            TimeOut | Wait => ErrorKind::Timeout,
            IoError | CommError | BusError | GrabFailed | IicError | SpiError
            | UsbControlError | UsbBulkError | SocketInitError | GigeFilterInitError
            | NetSendError | DeviceLost | CameraNeedReset | U3vNoControlEp
            | U3vControlError => ErrorKind::IoError,
            DeviceIsOpened | Busy | InProcess | AccessDeny => ErrorKind::DeviceBusy,
            NoDeviceFound | NoLogicDeviceFound => ErrorKind::NoDevice,
            NoMemory => ErrorKind::OutOfMemory,
            PathNotFound | FileCreateFailed | FileInvalid | WriteProtected
            | FunctionLoadFailed | CriticalFileLost | RegistryError => ErrorKind::FileError,
            SizeMismatch | LostData | EofError | DataRecvLess | IspDataCrcError
            | MvTestFailed => ErrorKind::DataIntegrity,
            Failed | InternalError | Unknown | UserCancel | InternalErr1 => ErrorKind::Unknown,
        };
        Some(kind)
    }

    /// Human readable description for logs
    pub fn description(self) -> &'static str {
        use SdkStatus::*;
        match self {
            Success => "success",
            Failed => "operation failed",
            InternalError => "internal error",
            Unknown => "unknown error",
            NotSupported => "function not supported",
            NotInitialized => "initialization not complete",
            ParameterInvalid => "invalid parameter",
            ParameterOutOfBound => "parameter out of bounds",
            Unenabled => "not enabled",
            UserCancel => "cancelled by user",
            PathNotFound => "path not found in registry",
            SizeMismatch => "image data length does not match the defined size",
            TimeOut => "timeout",
            IoError => "hardware IO error",
            CommError => "communication error",
            BusError => "bus error",
            NoDeviceFound => "no device found",
            NoLogicDeviceFound => "no logical device found",
            DeviceIsOpened => "device already opened",
            DeviceIsClosed => "device already closed",
            DeviceVideoClosed => "device video stream not opened",
            NoMemory => "not enough system memory",
            FileCreateFailed => "failed to create file",
            FileInvalid => "invalid file format",
            WriteProtected => "write protected",
            GrabFailed => "frame grab failed",
            LostData => "data lost, frame incomplete",
            EofError => "end of frame marker not received",
            Busy => "busy, previous operation still in progress",
            Wait => "condition not met, retry later",
            InProcess => "operation already in progress",
            IicError => "IIC transfer error",
            SpiError => "SPI transfer error",
            UsbControlError => "USB control transfer error",
            UsbBulkError => "USB bulk transfer error",
            SocketInitError => "network transport initialization failed",
            GigeFilterInitError => "GigE filter driver initialization failed",
            NetSendError => "network send error",
            DeviceLost => "lost connection to network camera",
            DataRecvLess => "received fewer bytes than requested",
            FunctionLoadFailed => "failed to load program from file",
            CriticalFileLost => "required runtime file missing",
            SensorIdMismatch => "firmware does not match the sensor",
            OutOfRange => "parameter out of valid range",
            RegistryError => "installer registration error",
            AccessDeny => "camera is in use by another program",
            CameraNeedReset => "camera needs a power cycle",
            IspModuleNotInitialized => "ISP module not initialized",
            IspDataCrcError => "data CRC check failed",
            MvTestFailed => "data test failed",
            InternalErr1 => "internal error 1",
            U3vNoControlEp => "U3V control endpoint not found",
            U3vControlError => "U3V control communication error",
        }
    }
}

/// Closed set of failure categories surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unsupported,
    NotInitialized,
    InvalidParameter,
    Timeout,
    IoError,
    DeviceBusy,
    NoDevice,
    OutOfMemory,
    FileError,
    DataIntegrity,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::NotInitialized => "not initialized",
            ErrorKind::InvalidParameter => "invalid parameter",
            ErrorKind::Timeout => "timeout",
            ErrorKind::IoError => "I/O error",
            ErrorKind::DeviceBusy => "device busy",
            ErrorKind::NoDevice => "no device",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::FileError => "file error",
            ErrorKind::DataIntegrity => "data integrity error",
            ErrorKind::Unknown => "unknown error",
        };
        f.write_str(name)
    }
}

/// Driver call failure, tagged with the call that produced it
#[derive(Debug, Clone, Error)]
#[error("{context}: {kind} (status {code}: {detail})")]
pub struct CameraError {
    kind: ErrorKind,
    code: i32,
    context: &'static str,
    detail: String,
}

impl CameraError {
    /// Build an error that did not come from an SDK status
    pub fn new(kind: ErrorKind, context: &'static str, detail: impl Into<String>) -> Self {
        Self {
            kind,
            code: 0,
            context,
            detail: detail.into(),
        }
    }

    /// Translate a raw status for `context`. Codes outside the table become `Unknown`.
    pub fn from_status(code: i32, context: &'static str) -> Option<Self> {
        let (kind, detail) = match SdkStatus::from_code(code) {
            Some(status) => (status.kind()?, status.description().to_string()),
            None => (ErrorKind::Unknown, format!("unrecognized status {}", code)),
        };
        Some(Self {
            kind,
            code,
            context,
            detail,
        })
    }

    /// Error for a known failing status
    pub fn status(status: SdkStatus, context: &'static str) -> Self {
        Self {
            kind: status.kind().unwrap_or(ErrorKind::Unknown),
            code: status.code(),
            context,
            detail: status.description().to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Raw status code, 0 when the error did not originate in the SDK
    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn context(&self) -> &'static str {
        self.context
    }

    /// Streams skip the frame and retry on these
    pub fn is_continuable(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }
}

/// Translate an SDK status, short-circuiting on failure
pub fn check(code: i32, context: &'static str) -> Result<(), CameraError> {
    match CameraError::from_status(code, context) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Run `setup`; on failure run `release` before handing the error back
pub fn release_on_error<T, S, R>(setup: S, release: R) -> Result<T, CameraError>
where
    S: FnOnce() -> Result<T, CameraError>,
    R: FnOnce(),
{
    let result = setup();
    if result.is_err() {
        release();
    }
    result
}
