//! Object detection bridge for NVR monitors.
//!
//! This crate connects a camera's decoded video stream to an external object
//! detector and turns qualifying detections into recording triggers.
//!
//! # Architecture
//!
//! Each monitor with detection enabled runs one pipeline instance:
//!
//! 1. **Geometry**: the camera frame is letterboxed, padded and cropped to the
//!    detector's fixed input size. The inverse mapping brings boxes back.
//! 2. **Frame source**: a supervised transcoder process emits raw RGB24
//!    frames at that size on its standard output.
//! 3. **Detection client**: frames are PNG-encoded and streamed to the detector
//!    one at a time over a persistent connection.
//! 4. **Trigger**: detections above their label threshold are mapped back to
//!    frame coordinates and sent to the recorder as a [`TriggerEvent`].
//!
//! # Module Structure
//!
//! - `geometry`: frame size, crop and the letterbox/inverse-mapping math
//! - `mask`: polygon mask rasterization
//! - `ffmpeg`: transcoder arguments, named pipes and child process handling
//! - `source`: frame source supervisor
//! - `client`: streaming detection client
//! - `rpc`: detection stream wire format
//! - `trigger`: detection filtering and trigger events
//! - `detector`: detector table fetched from the detector service
//! - `monitor`: per-monitor detection settings
//! - `config`: bridge-wide configuration
//! - `pipeline`: wiring of all of the above for one monitor
//! - `supervise`: cancellation and completion tracking

pub mod client;
pub mod config;
pub mod detector;
pub mod ffmpeg;
pub mod geometry;
pub mod mask;
pub mod monitor;
pub mod pipeline;
pub mod rpc;
pub mod source;
pub mod supervise;
pub mod trigger;

pub use client::DetectionClient;
pub use config::BridgeConfig;
pub use detector::{DetectorSpec, DetectorTable};
pub use geometry::{Crop, FrameGeometry, FrameGeometryInput, FrameSize};
pub use monitor::{MonitorConfig, PipelineConfig, Thresholds};
pub use pipeline::{MonitorInput, Pipeline};
pub use supervise::{CancelToken, TaskGroup};
pub use trigger::{Detection, Region, TriggerEvent, TriggerReceiver, TriggerSender};

// -------------------- Errors --------------------

/// Failure classes a pipeline distinguishes.
///
/// `InvalidConfiguration` stops a pipeline from starting. The other two are
/// retried by the owning restart loop until cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidConfiguration,
    ProcessFailure,
    ConnectionFailure,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::InvalidConfiguration => "invalid configuration",
            ErrorKind::ProcessFailure => "process failure",
            ErrorKind::ConnectionFailure => "connection failure",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfiguration, message)
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProcessFailure, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionFailure, message)
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
impl std::error::Error for PipelineError {}

/// Finds the first [`PipelineError`] in an error chain and returns its kind.
pub fn error_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
        .map(|e| e.kind)
}
