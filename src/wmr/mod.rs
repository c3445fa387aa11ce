//! Frame server for the tracking cameras and IMU of WMR headsets.
//!
//! Camera and IMU timestamps are in the headset's clock. IMU samples have
//! the least USB latency, so they drive the hardware-to-monotonic offset
//! estimate that is then applied to the camera frames.

pub mod camera;

pub use camera::{
    CameraBus, CameraPurpose, FrameLayout, UsbBus, WmrCamera, WmrCameraConfig, WmrCameraSinks,
};

use crate::config::DriverConfig;
use crate::frame::Frame;
use crate::frameserver::{
    check_start_args, CaptureParameters, CaptureType, FrameServer, FsInfo, FsMode, FsState,
};
use crate::imu::{ClockOffset, FilterFifo3};
use crate::sink::{DebugSink, FrameSink, ImuSink, SlamSinks};
use crate::thread::lock;
use crate::time::monotonic_ns;
use crate::types::{ImuSample, Vec3};
use crate::{Result, XrError};
use log::LevelFilter;
use std::sync::{Arc, Mutex};

pub const SOURCE_STRING: &str = "WMR Source";
const SOURCE_ID: u64 = u64::from_le_bytes(*b"WMR_SRC\0");
const IMU_FREQ_HZ: f32 = 250.0;
const UI_HISTORY: usize = 1000;

#[derive(Default)]
struct ClockState {
    hw2mono: ClockOffset,
    /// `hw2mono` as of the last cam0 frame, used for the whole bundle.
    cam_hw2mono: i64,
    last_imu_ns: i64,
    first_imu_received: bool,
}

/// State shared with the camera and IMU callbacks.
struct Shared {
    out: Mutex<SlamSinks>,
    clock: Mutex<ClockState>,
    ui_cams: Vec<Arc<DebugSink>>,
    gyro_ff: Mutex<FilterFifo3>,
    accel_ff: Mutex<FilterFifo3>,
    ll: LevelFilter,
}

impl Shared {
    fn receive_cam(&self, index: usize, frame: &Frame) {
        let (offset, forward) = {
            let mut clock = lock(&self.clock);
            if index == 0 {
                clock.cam_hw2mono = clock.hw2mono.get();
            }
            (clock.cam_hw2mono, clock.first_imu_received)
        };

        let frame = frame.with_timestamp(frame.timestamp_ns() + offset);
        ll_trace!(
            self.ll,
            "cam{} img t={} source_t={}",
            index,
            frame.timestamp_ns(),
            frame.info().source_timestamp_ns
        );

        if let Some(ui) = self.ui_cams.get(index) {
            ui.push_frame(&frame);
        }
        if !forward {
            return;
        }
        let sink = lock(&self.out).cams.get(index).cloned();
        if let Some(sink) = sink {
            sink.push_frame(&frame);
        }
    }
}

impl ImuSink for Shared {
    fn push_imu(&self, sample: &ImuSample) {
        let now_hw = sample.timestamp_ns;
        let ts = {
            let mut clock = lock(&self.clock);
            let ts = clock.hw2mono.a2b(IMU_FREQ_HZ, now_hw, monotonic_ns());

            // A device that was not shut down cleanly sends a few old samples.
            if clock.last_imu_ns > ts {
                ll_warn!(
                    self.ll,
                    "Received sample from the past, new: {}, last: {}, diff: {}",
                    ts,
                    clock.last_imu_ns,
                    clock.last_imu_ns - ts
                );
                return;
            }
            clock.first_imu_received = true;
            clock.last_imu_ns = ts;
            ts
        };

        let mut s = *sample;
        s.timestamp_ns = ts;
        let (a, w) = (s.accel_m_s2, s.gyro_rad_secs);
        ll_trace!(
            self.ll,
            "imu t={} a=({:.3} {:.3} {:.3}) w=({:.3} {:.3} {:.3})",
            ts,
            a.x,
            a.y,
            a.z,
            w.x,
            w.y,
            w.z
        );

        lock(&self.gyro_ff).push(w.cast::<f32>(), ts);
        lock(&self.accel_ff).push(a.cast::<f32>(), ts);

        let imu = lock(&self.out).imu.clone();
        if let Some(imu) = imu {
            imu.push_imu(&s);
        }
    }
}

/// The sink the camera reader pushes camera `index` into.
struct CamSink {
    shared: Arc<Shared>,
    index: usize,
}

impl FrameSink for CamSink {
    fn push_frame(&self, frame: &Frame) {
        self.shared.receive_cam(self.index, frame);
    }
}

pub struct WmrSource {
    info: FsInfo,
    camera: WmrCamera,
    shared: Arc<Shared>,
    cam_sinks: Vec<Arc<dyn FrameSink>>,
    controllers: Option<Arc<dyn FrameSink>>,
    state: FsState,
    ll: LevelFilter,
}

impl WmrSource {
    pub fn create(camera: WmrCamera, config: &DriverConfig) -> WmrSource {
        let ll = config.log.wmr;
        let count = camera.layout().cams.len();

        let shared = Arc::new(Shared {
            out: Mutex::new(SlamSinks::default()),
            clock: Mutex::new(ClockState::default()),
            ui_cams: (0..count).map(|_| Arc::new(DebugSink::new())).collect(),
            gyro_ff: Mutex::new(FilterFifo3::new(UI_HISTORY)),
            accel_ff: Mutex::new(FilterFifo3::new(UI_HISTORY)),
            ll,
        });
        let cam_sinks = (0..count)
            .map(|index| {
                Arc::new(CamSink {
                    shared: shared.clone(),
                    index,
                }) as Arc<dyn FrameSink>
            })
            .collect();

        ll_debug!(ll, "{} created with {} tracking cameras", SOURCE_STRING, count);

        WmrSource {
            info: FsInfo {
                name: SOURCE_STRING.into(),
                product: format!("{} Product", SOURCE_STRING),
                manufacturer: format!("{} Manufacturer", SOURCE_STRING),
                serial: format!("{} Serial", SOURCE_STRING),
                source_id: SOURCE_ID,
            },
            camera,
            shared,
            cam_sinks,
            controllers: None,
            state: FsState::Stopped,
            ll,
        }
    }

    /// Receiver of the dark frames; takes effect on the next start.
    pub fn set_controller_sink(&mut self, sink: Option<Arc<dyn FrameSink>>) {
        self.controllers = sink;
    }

    /// Feeds one IMU reading in the headset clock.
    pub fn push_imu_packet(&self, timestamp_ns: i64, accel: Vec3, gyro: Vec3) {
        let sample = ImuSample {
            timestamp_ns,
            accel_m_s2: accel.cast::<f64>(),
            gyro_rad_secs: gyro.cast::<f64>(),
        };
        self.shared.push_imu(&sample);
    }

    /// Latest frame of each camera, for debug UIs.
    pub fn debug_sinks(&self) -> Vec<Arc<DebugSink>> {
        self.shared.ui_cams.clone()
    }

    /// Newest gyro and accel readings, for debug UIs.
    pub fn latest_imu(&self) -> Option<((Vec3, i64), (Vec3, i64))> {
        let gyro = lock(&self.shared.gyro_ff).get(0)?;
        let accel = lock(&self.shared.accel_ff).get(0)?;
        Some((gyro, accel))
    }

    pub fn camera(&self) -> &WmrCamera {
        &self.camera
    }
}

impl FrameServer for WmrSource {
    fn info(&self) -> &FsInfo {
        &self.info
    }

    fn enumerate_modes(&self) -> Result<Vec<FsMode>> {
        Err(XrError::Unsupported("WMR modes are fixed by the headset".into()))
    }

    fn configure_capture(&mut self, _params: &CaptureParameters) -> Result<()> {
        Err(XrError::Unsupported("WMR capture parameters".into()))
    }

    fn stream_start(
        &mut self,
        sink: Option<Arc<dyn FrameSink>>,
        capture_type: CaptureType,
        _mode_index: usize,
    ) -> Result<()> {
        if self.state.is_running() {
            ll_warn!(self.ll, "Already streaming");
            return Ok(());
        }
        check_start_args(&sink, capture_type)?;

        match sink {
            Some(s) => {
                ll_info!(self.ll, "Starting stream in calibration mode, only cam0 frames");
                *lock(&self.shared.out) = SlamSinks {
                    cams: vec![s],
                    imu: None,
                    gt: None,
                };
            }
            None => ll_info!(self.ll, "Starting stream in tracking mode"),
        }

        self.camera.start(WmrCameraSinks {
            tracking: self.cam_sinks.clone(),
            controllers: self.controllers.clone(),
        })?;
        self.state = FsState::Running;
        Ok(())
    }

    fn slam_stream_start(&mut self, sinks: SlamSinks) -> Result<()> {
        *lock(&self.shared.out) = sinks;
        self.stream_start(None, CaptureType::Tracking, 0)
    }

    fn stream_stop(&mut self) -> Result<()> {
        if !self.state.is_running() {
            return Ok(());
        }
        self.state = FsState::Stopped;
        self.camera.stop()
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }

    fn log_level(&self) -> LevelFilter {
        self.ll
    }
}

#[cfg(test)]
mod tests {
    use super::camera::tests::{cams, image, transfer, FakeBus};
    use super::*;
    use crate::sink::tests::{CollectImu, CollectSink};
    use std::time::Duration;

    fn source() -> (WmrSource, Arc<FakeBus>) {
        let bus = Arc::new(FakeBus::default());
        let camera = WmrCamera::open(bus.clone(), &cams(2), LevelFilter::Off).unwrap();
        (WmrSource::create(camera, &DriverConfig::default()), bus)
    }

    struct Out {
        left: Arc<CollectSink>,
        right: Arc<CollectSink>,
        imu: Arc<CollectImu>,
    }

    fn tracking(ws: &mut WmrSource) -> Out {
        let out = Out {
            left: Arc::new(CollectSink::default()),
            right: Arc::new(CollectSink::default()),
            imu: Arc::new(CollectImu::default()),
        };
        ws.slam_stream_start(SlamSinks::stereo(out.left.clone(), out.right.clone(), out.imu.clone()))
            .unwrap();
        out
    }

    fn frame_at(ts: i64) -> Frame {
        crate::sink::tests::frame_at(ts)
    }

    #[test]
    fn test_no_frames_before_first_imu() {
        let (mut ws, _bus) = source();
        let out = tracking(&mut ws);
        ws.cam_sinks[0].push_frame(&frame_at(100));
        assert!(out.left.timestamps().is_empty());

        ws.push_imu_packet(1_000, Vec3::new(0.0, 9.8, 0.0), Vec3::zeros());
        let imu_ts = out.imu.samples.lock().unwrap()[0].timestamp_ns;
        let hw2mono = imu_ts - 1_000;

        ws.cam_sinks[0].push_frame(&frame_at(500));
        ws.cam_sinks[1].push_frame(&frame_at(500));
        assert_eq!(out.left.timestamps(), vec![500 + hw2mono]);
        assert_eq!(out.right.timestamps(), vec![500 + hw2mono]);
        ws.stream_stop().unwrap();
    }

    #[test]
    fn test_bundle_reuses_cam0_offset() {
        let (mut ws, _bus) = source();
        let out = tracking(&mut ws);
        ws.push_imu_packet(1_000, Vec3::zeros(), Vec3::zeros());
        ws.cam_sinks[0].push_frame(&frame_at(500));

        // The estimate moves, but cam1 of the same bundle keeps cam0's offset.
        std::thread::sleep(Duration::from_millis(2));
        ws.push_imu_packet(2_000, Vec3::zeros(), Vec3::zeros());
        ws.cam_sinks[1].push_frame(&frame_at(500));

        assert_eq!(out.left.timestamps(), out.right.timestamps());
    }

    #[test]
    fn test_imu_from_the_past_dropped() {
        let (mut ws, _bus) = source();
        let out = tracking(&mut ws);
        ws.push_imu_packet(10_000_000_000, Vec3::zeros(), Vec3::new(0.1, 0.0, 0.0));
        ws.push_imu_packet(1_000, Vec3::zeros(), Vec3::zeros());
        assert_eq!(out.imu.samples.lock().unwrap().len(), 1);
        let ((gyro, _), _) = ws.latest_imu().unwrap();
        assert!((gyro.x - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_calibration_streams_cam0_only() {
        let (mut ws, bus) = source();
        let sink = Arc::new(CollectSink::default());
        assert!(ws.stream_start(None, CaptureType::Calibration, 0).is_err());
        ws.stream_start(Some(sink.clone()), CaptureType::Calibration, 0).unwrap();
        ws.push_imu_packet(1, Vec3::zeros(), Vec3::zeros());

        let layout = ws.camera().layout().clone();
        bus.reads
            .lock()
            .unwrap()
            .push_back(transfer(&layout, &image(&layout, 100, 1), 5));
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while sink.timestamps().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        ws.stream_stop().unwrap();

        let frames = sink.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].width(), 640);
    }

    #[test]
    fn test_fixed_modes_unsupported() {
        let (ws, _bus) = source();
        assert!(matches!(ws.enumerate_modes(), Err(XrError::Unsupported(_))));
        assert_eq!(ws.info().source_id, u64::from_le_bytes(*b"WMR_SRC\0"));
    }
}
