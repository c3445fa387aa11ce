//! Intel RealSense cameras used as plain stereo + IMU sources for a host
//! side SLAM tracker.
//!
//! librealsense is reached through [`RsPipeline`]; it calls back with
//! framesets and motion frames on its own threads.

use crate::config::{DriverConfig, RealSenseConfig};
use crate::device::{Device, DeviceBase, DeviceCapabilities};
use crate::frame::{Frame, FrameContext, FrameFormat, FrameInfo, FrameStorage, StereoFormat};
use crate::frameserver::{
    check_start_args, CaptureParameters, CaptureType, FrameServer, FsInfo, FsMode, FsState,
    StereoPairCheck,
};
use crate::imu::{MotionSensor, PartialImuSample};
use crate::sink::{DebugSink, FrameSink, SlamSinks, SplitSink};
use crate::thread::lock;
use crate::types::{
    DeviceName, DeviceType, InputName, Pose, RelationFlags, SpaceRelation, TrackingOrigin, TrackingType,
};
use crate::{Result, XrError};
use log::LevelFilter;
use nalgebra::Vector3;
use std::sync::{Arc, Mutex};

pub const DEVICE_STRING: &str = "Intel RealSense Host-SLAM";
const SOURCE_ID: u64 = 0x2EA15E115E;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsStreamKind {
    Infrared,
    Gyro,
    Accel,
}

/// One stream to enable on the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RsStreamRequest {
    pub kind: RsStreamKind,
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
    pub fps: u32,
}

impl RsStreamRequest {
    fn motion(kind: RsStreamKind, fps: u32) -> Self {
        Self {
            kind,
            index: 0,
            width: 0,
            height: 0,
            format: FrameFormat::L8,
            fps,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampDomain {
    HardwareClock,
    SystemTime,
    /// Device clock converted to host time by librealsense.
    GlobalTime,
}

pub trait RsFrame: Send + Sync {
    fn data(&self) -> &[u8];
    fn timestamp_ms(&self) -> f64;
    fn frame_number(&self) -> u64;
    fn domain(&self) -> TimestampDomain;
}

pub enum RsEvent {
    /// Video frames of one capture, in the order the streams were requested.
    Frameset(Vec<Box<dyn RsFrame>>),
    Motion(MotionSensor, Box<dyn RsFrame>),
}

pub type RsCallback = Box<dyn Fn(RsEvent) + Send + Sync>;

pub trait RsPipeline: Send {
    fn name(&self) -> String;
    fn serial(&self) -> String;
    fn start(&mut self, streams: &[RsStreamRequest], callback: RsCallback) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    /// Turns off the laser emitter of every sensor that has one and
    /// returns how many there were.
    fn disable_laser_emitters(&mut self) -> Result<usize>;
}

/// Three little-endian f32s, as librealsense lays out motion data.
fn motion_vector(data: &[u8]) -> Option<Vector3<f64>> {
    if data.len() < 12 {
        return None;
    }
    let f = |i: usize| f32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]) as f64;
    Some(Vector3::new(f(0), f(4), f(8)))
}

fn ms_to_ns(ms: f64) -> i64 {
    (ms * 1_000_000.0) as i64
}

struct SdkFrame(Box<dyn RsFrame>);

impl FrameStorage for SdkFrame {
    fn bytes(&self) -> &[u8] {
        self.0.data()
    }
}

/// Runs on the librealsense callback threads.
struct Handler {
    sinks: Mutex<SlamSinks>,
    partial: PartialImuSample,
    pair: StereoPairCheck,
    config: RealSenseConfig,
    ll: LevelFilter,
}

impl Handler {
    fn handle(&self, event: RsEvent) {
        match event {
            RsEvent::Frameset(frames) => self.frameset(frames),
            RsEvent::Motion(sensor, frame) => self.motion(sensor, frame),
        }
    }

    fn to_frame(&self, f: Box<dyn RsFrame>) -> Option<Frame> {
        let mut info = FrameInfo::packed(self.config.video_width, self.config.video_height, FrameFormat::L8);
        if f.data().len() < info.size {
            ll_warn!(self.ll, "Short frame: {} < {} bytes", f.data().len(), info.size);
            return None;
        }
        let ts = ms_to_ns(f.timestamp_ms());
        info.timestamp_ns = ts;
        info.source_timestamp_ns = ts;
        info.source_sequence = f.frame_number();
        info.source_id = SOURCE_ID;
        Some(Frame::new(info, Arc::new(SdkFrame(f))))
    }

    fn frameset(&self, frames: Vec<Box<dyn RsFrame>>) {
        let expected = if self.config.stereo { 2 } else { 1 };
        if frames.len() != expected {
            ll_warn!(self.ll, "Frameset has {} frames, expected {}", frames.len(), expected);
            return;
        }

        let mut frames = frames.into_iter().filter_map(|f| self.to_frame(f));
        let sinks = lock(&self.sinks).clone();
        match (frames.next(), frames.next()) {
            (Some(left), Some(right)) => {
                self.pair.push(&sinks, &left, &right);
            }
            (Some(left), None) if !self.config.stereo => {
                if let Some(sink) = sinks.left() {
                    sink.push_frame(&left);
                }
            }
            _ => {}
        }
    }

    fn motion(&self, sensor: MotionSensor, f: Box<dyn RsFrame>) {
        let domain = f.domain();
        if domain != TimestampDomain::GlobalTime && sensor != self.partial.slower() {
            ll_error!(
                self.ll,
                "{:?} sample in {:?} domain, only global time can be aligned with the cameras",
                sensor,
                domain
            );
            return;
        }

        let value = match motion_vector(f.data()) {
            Some(v) => v,
            None => {
                ll_warn!(self.ll, "Short {:?} frame ({} bytes)", sensor, f.data().len());
                return;
            }
        };

        let ts = ms_to_ns(f.timestamp_ms());
        ll_trace!(self.ll, "{:?} {} {:.3} {:.3} {:.3}", sensor, ts, value.x, value.y, value.z);
        let sample = match self.partial.push(ts, value, sensor) {
            Some(s) => s,
            None => return,
        };

        let imu = lock(&self.sinks).imu.clone();
        if let Some(imu) = imu {
            imu.push_imu(&sample);
        }
    }
}

pub struct RealSenseFrameServer {
    info: FsInfo,
    pipeline: Box<dyn RsPipeline>,
    config: RealSenseConfig,
    handler: Arc<Handler>,
    slam_sinks: Option<SlamSinks>,
    ui_left: Arc<DebugSink>,
    ui_right: Arc<DebugSink>,
    state: FsState,
    ll: LevelFilter,
}

impl RealSenseFrameServer {
    pub fn create(pipeline: Box<dyn RsPipeline>, config: &DriverConfig) -> Result<Self> {
        let ll = config.log.realsense;
        let rs = config.file.realsense.clone();
        if rs.video_width == 0 || rs.video_height == 0 || rs.video_fps == 0 {
            return Err(XrError::InvalidArgument(format!(
                "bad video mode {}x{}@{}",
                rs.video_width, rs.video_height, rs.video_fps
            )));
        }

        let name = pipeline.name();
        let stereo = if rs.stereo { "Stereo" } else { "Mono" };
        let info = FsInfo {
            name: format!("{} {}", DEVICE_STRING, stereo),
            product: format!("{} {}", DEVICE_STRING, name),
            manufacturer: "Intel".into(),
            serial: pipeline.serial(),
            source_id: SOURCE_ID,
        };

        let handler = Arc::new(Handler {
            sinks: Mutex::new(SlamSinks::default()),
            partial: PartialImuSample::new(rs.gyro_fps, rs.accel_fps),
            pair: StereoPairCheck { ll },
            config: rs.clone(),
            ll,
        });

        ll_debug!(
            ll,
            "{} {}x{}@{}, gyro {} Hz, accel {} Hz",
            stereo,
            rs.video_width,
            rs.video_height,
            rs.video_fps,
            rs.gyro_fps,
            rs.accel_fps
        );

        Ok(Self {
            info,
            pipeline,
            config: rs,
            handler,
            slam_sinks: None,
            ui_left: Arc::new(DebugSink::new()),
            ui_right: Arc::new(DebugSink::new()),
            state: FsState::Stopped,
            ll,
        })
    }

    /// Latest left and right frames, for debug UIs.
    pub fn debug_sinks(&self) -> (Arc<DebugSink>, Arc<DebugSink>) {
        (self.ui_left.clone(), self.ui_right.clone())
    }

    fn requests(&self) -> Vec<RsStreamRequest> {
        let video = |index| RsStreamRequest {
            kind: RsStreamKind::Infrared,
            index,
            width: self.config.video_width,
            height: self.config.video_height,
            format: FrameFormat::L8,
            fps: self.config.video_fps,
        };
        let mut out = vec![video(self.config.stream1_index)];
        if self.config.stereo {
            out.push(video(self.config.stream2_index));
        }
        out.push(RsStreamRequest::motion(RsStreamKind::Gyro, self.config.gyro_fps));
        out.push(RsStreamRequest::motion(RsStreamKind::Accel, self.config.accel_fps));
        out
    }

    /// Sinks the callbacks push into: the debug sinks in front of the
    /// tracker's sinks.
    fn tracking_sinks(&self) -> Result<SlamSinks> {
        let out = self
            .slam_sinks
            .as_ref()
            .ok_or_else(|| XrError::InvalidArgument("tracking stream needs SLAM sinks".into()))?;

        let tee = |ui: &Arc<DebugSink>, downstream: Option<&Arc<dyn FrameSink>>| -> Arc<dyn FrameSink> {
            let mut sinks: Vec<Arc<dyn FrameSink>> = vec![ui.clone() as Arc<dyn FrameSink>];
            sinks.extend(downstream.cloned());
            Arc::new(SplitSink::new(sinks))
        };
        let mut cams = vec![tee(&self.ui_left, out.left())];
        if self.config.stereo {
            cams.push(tee(&self.ui_right, out.right()));
        }
        Ok(SlamSinks {
            cams,
            imu: out.imu.clone(),
            gt: None,
        })
    }
}

impl FrameServer for RealSenseFrameServer {
    fn info(&self) -> &FsInfo {
        &self.info
    }

    fn enumerate_modes(&self) -> Result<Vec<FsMode>> {
        Ok(vec![FsMode {
            width: self.config.video_width,
            height: self.config.video_height,
            format: FrameFormat::L8,
            stereo_format: StereoFormat::None,
        }])
    }

    fn configure_capture(&mut self, _params: &CaptureParameters) -> Result<()> {
        Err(XrError::Unsupported("RealSense capture parameters".into()))
    }

    fn stream_start(
        &mut self,
        sink: Option<Arc<dyn FrameSink>>,
        capture_type: CaptureType,
        mode_index: usize,
    ) -> Result<()> {
        if self.state.is_running() {
            ll_warn!(self.ll, "Already streaming");
            return Ok(());
        }
        check_start_args(&sink, capture_type)?;
        if mode_index != 0 {
            return Err(XrError::InvalidArgument(format!("no mode {}", mode_index)));
        }

        let sinks = match sink {
            Some(s) => SlamSinks {
                cams: vec![s],
                imu: None,
                gt: None,
            },
            None => self.tracking_sinks()?,
        };
        *lock(&self.handler.sinks) = sinks;

        let handler = self.handler.clone();
        let requests = self.requests();
        self.pipeline.start(&requests, Box::new(move |ev| handler.handle(ev)))?;

        match self.pipeline.disable_laser_emitters() {
            Ok(n) => ll_debug!(self.ll, "Disabled {} laser emitter(s)", n),
            Err(e) => {
                ll_error!(self.ll, "Failed to disable laser emitters: {}", e);
                let _ = self.pipeline.stop();
                *lock(&self.handler.sinks) = SlamSinks::default();
                return Err(e);
            }
        }

        self.state = FsState::Running;
        ll_debug!(self.ll, "Stream started ({:?})", capture_type);
        Ok(())
    }

    fn slam_stream_start(&mut self, sinks: SlamSinks) -> Result<()> {
        self.slam_sinks = Some(sinks);
        self.stream_start(None, CaptureType::Tracking, 0)
    }

    fn stream_stop(&mut self) -> Result<()> {
        if !self.state.is_running() {
            return Ok(());
        }
        self.state = FsState::Stopped;
        let res = self.pipeline.stop();
        *lock(&self.handler.sinks) = SlamSinks::default();
        ll_debug!(self.ll, "Stream stopped");
        res
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }

    fn log_level(&self) -> LevelFilter {
        self.ll
    }
}

impl Drop for RealSenseFrameServer {
    fn drop(&mut self) {
        if let Err(e) = self.stream_stop() {
            ll_error!(self.ll, "Failed to stop pipeline: {}", e);
        }
    }
}

/// The host SLAM tracker the camera feeds.
pub trait SlamTracker: Send {
    fn sinks(&self) -> SlamSinks;

    /// Pose of the camera at the given time; lost tracking has no
    /// tracked bits set.
    fn tracked_pose(&mut self, at_timestamp_ns: i64) -> SpaceRelation;
}

/// Generic tracker device reporting the SLAM pose of the camera.
pub struct RealSenseDevice {
    base: DeviceBase,
    fs: Arc<Mutex<RealSenseFrameServer>>,
    ctx: FrameContext,
    slam: Box<dyn SlamTracker>,
    offset: Pose,
    pose: Pose,
    destroyed: bool,
    ll: LevelFilter,
}

impl RealSenseDevice {
    pub fn create(
        pipeline: Box<dyn RsPipeline>,
        slam: Box<dyn SlamTracker>,
        config: &DriverConfig,
    ) -> Result<Self> {
        let ll = config.log.realsense;
        let origin = Arc::new(TrackingOrigin::new(DEVICE_STRING, TrackingType::ExternalSlam));

        let mut base = DeviceBase::new(
            DeviceName::RealSense,
            DeviceType::GenericTracker,
            DEVICE_STRING,
            &[InputName::GenericTrackerPose],
            &[],
            origin,
        );
        base.serial = pipeline.serial();
        base.capabilities = DeviceCapabilities::ORIENTATION_TRACKING | DeviceCapabilities::POSITION_TRACKING;

        let fs = Arc::new(Mutex::new(RealSenseFrameServer::create(pipeline, config)?));
        let ctx = FrameContext::new();
        ctx.add(fs.clone());
        lock(&fs).slam_stream_start(slam.sinks())?;

        ll_debug!(ll, "Created device");

        Ok(Self {
            base,
            fs,
            ctx,
            slam,
            offset: Pose::identity(),
            pose: Pose::identity(),
            destroyed: false,
            ll,
        })
    }

    /// Pose of the tracked point relative to the camera.
    pub fn set_offset(&mut self, offset: Pose) {
        self.offset = offset;
    }

    pub fn frame_server(&self) -> Arc<Mutex<RealSenseFrameServer>> {
        self.fs.clone()
    }
}

impl Device for RealSenseDevice {
    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase {
        &mut self.base
    }

    fn update_inputs(&mut self) -> Result<()> {
        Ok(())
    }

    fn get_tracked_pose(&mut self, name: InputName, at_timestamp_ns: i64) -> Result<SpaceRelation> {
        if name != InputName::GenericTrackerPose {
            ll_error!(self.ll, "Unknown input name {:?}", name);
            return Err(XrError::UnknownInput);
        }

        let rel = self.slam.tracked_pose(at_timestamp_ns);
        let valid = RelationFlags::ORIENTATION_VALID | RelationFlags::POSITION_VALID;
        let tracked = RelationFlags::ORIENTATION_TRACKED | RelationFlags::POSITION_TRACKED;

        let mut flags = valid;
        if rel.flags.contains(tracked) {
            self.pose = rel.pose;
            flags |= tracked;
        } else {
            ll_trace!(self.ll, "SLAM lost, reporting last pose");
        }

        let mut out = SpaceRelation::zero();
        out.pose = self.pose.transform(&self.offset);
        out.flags = flags;
        Ok(out)
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.ctx.destroy();
        ll_debug!(self.ll, "Destroyed device");
    }
}

impl Drop for RealSenseDevice {
    fn drop(&mut self) {
        self.destroy();
    }
}
