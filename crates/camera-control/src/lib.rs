//! Camera Control
//!
//! Safe sharing of one machine-vision camera between live preview streams
//! and single-shot captures:
//! - Mode state machine (Idle, Preview, Capture) with a drain barrier
//! - Raw/processed buffer lifecycle
//! - Frame acquisition loop
//! - File, region and streaming sinks

pub mod acquisition;
pub mod buffer;
pub mod error;
pub mod mode;
pub mod session;
pub mod settings;
pub mod sink;

pub use acquisition::ProcessedFrame;
pub use buffer::{OutputBuffer, RawFrame};
pub use error::{ControlError, Result};
pub use mode::{
    CaptureParams, ModeController, ModeRequest, OperatingMode, OperationGuard, Transition,
};
pub use session::{CameraSession, SessionSnapshot};
pub use settings::{CameraSettings, CaptureSettings, PreviewSettings};
pub use sink::{
    capture_once, encode_jpeg, encode_png_region, run_stream, FileSink, FrameSink, RegionSink,
    SinkError, StopSignal, StreamEnd,
};
