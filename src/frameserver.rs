//! The frame-server abstraction every camera driver implements.

use crate::frame::{Frame, FrameFormat, FrameNode, StereoFormat};
use crate::sink::{FrameSink, SlamSinks};
use crate::{Result, XrError};
use log::LevelFilter;
use std::sync::{Arc, Mutex};

/// One capture mode a frame server can stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsMode {
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
    pub stereo_format: StereoFormat,
}

/// Why a stream is being started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureType {
    /// Camera calibration: frames go to one sink supplied by the caller.
    Calibration = 0,
    /// Tracking: frames go to the sinks registered by the SLAM tracker.
    Tracking = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CaptureParameters {
    pub gain: f32,
    pub exposure: f32,
}

/// Human readable identification of a frame server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FsInfo {
    pub name: String,
    pub product: String,
    pub manufacturer: String,
    pub serial: String,
    pub source_id: u64,
}

pub trait FrameServer: Send {
    fn info(&self) -> &FsInfo;

    fn enumerate_modes(&self) -> Result<Vec<FsMode>>;

    fn configure_capture(&mut self, params: &CaptureParameters) -> Result<()>;

    /// Starts streaming. Starting an already running server is logged and
    /// ignored.
    fn stream_start(
        &mut self,
        sink: Option<Arc<dyn FrameSink>>,
        capture_type: CaptureType,
        mode_index: usize,
    ) -> Result<()>;

    /// Registers the tracker sinks, then starts a tracking stream.
    fn slam_stream_start(&mut self, sinks: SlamSinks) -> Result<()>;

    /// Stops streaming and joins the producer. A no-op when stopped.
    fn stream_stop(&mut self) -> Result<()>;

    fn is_running(&self) -> bool;

    /// Gates messages logged on the server's behalf.
    fn log_level(&self) -> LevelFilter {
        LevelFilter::Warn
    }
}

/// Checks the sink/capture-type combination passed to `stream_start`.
///
/// Tracking must not get an explicit sink (it uses the SLAM sinks);
/// calibration must.
pub fn check_start_args(sink: &Option<Arc<dyn FrameSink>>, capture_type: CaptureType) -> Result<()> {
    match (sink.is_some(), capture_type) {
        (false, CaptureType::Tracking) | (true, CaptureType::Calibration) => Ok(()),
        (has_sink, ty) => Err(XrError::InvalidArgument(format!(
            "unsupported stream start: sink given {} with capture type {:?}",
            has_sink, ty
        ))),
    }
}

/// Configured/running state shared by the drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsState {
    #[default]
    Stopped,
    Running,
}

impl FsState {
    pub fn is_running(self) -> bool {
        self == FsState::Running
    }
}

/// Pushes a stereo pair only when both frames carry the same timestamp.
pub struct StereoPairCheck {
    pub ll: LevelFilter,
}

impl StereoPairCheck {
    pub fn push(&self, sinks: &SlamSinks, left: &Frame, right: &Frame) -> bool {
        if left.timestamp_ns() != right.timestamp_ns() {
            ll_warn!(
                self.ll,
                "Stereo frame timestamps differ ({} vs {}), dropping pair",
                left.timestamp_ns(),
                right.timestamp_ns()
            );
            return false;
        }
        if let Some(l) = sinks.left() {
            l.push_frame(left);
        }
        if let Some(r) = sinks.right() {
            r.push_frame(right);
        }
        true
    }
}

/// Lets a frame server live in a [`crate::frame::FrameContext`].
impl<T: FrameServer> FrameNode for Mutex<T> {
    fn break_apart(&self) {
        let mut fs = match self.lock() {
            Ok(fs) => fs,
            Err(p) => p.into_inner(),
        };
        if let Err(e) = fs.stream_stop() {
            ll_error!(fs.log_level(), "Failed to stop '{}': {}", fs.info().name, e);
        }
    }
}
