//! Frame server for Luxonis DepthAI (OAK) cameras.
//!
//! The DepthAI host library is reached through [`DaiDevice`] and
//! [`DaiQueue`]; each SDK frame stays alive for as long as any [`Frame`]
//! points at its pixels.

use crate::config::DriverConfig;
use crate::frame::{Frame, FrameFormat, FrameInfo, FrameStorage, StereoFormat};
use crate::frameserver::{
    check_start_args, CaptureParameters, CaptureType, FrameServer, FsInfo, FsMode, FsState,
};
use crate::sink::{FrameSink, SlamSinks};
use crate::thread::{lock, RunFlag, ThreadHelper};
use crate::{Result, XrError};
use log::LevelFilter;
use std::sync::{Arc, Mutex};

const QUEUE_TIMEOUT_MS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardSocket {
    Rgb,
    Left,
    Right,
}

/// Which sensor to stream and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaiPipelineConfig {
    pub socket: BoardSocket,
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
    pub fps: u32,
    pub rotate_180: bool,
    /// Interleaved RGB, only meaningful for the color camera.
    pub interleaved: bool,
}

impl DaiPipelineConfig {
    /// 800p color preview, mounted upside down on the headset.
    pub fn color() -> Self {
        Self {
            socket: BoardSocket::Rgb,
            width: 1280,
            height: 800,
            format: FrameFormat::R8G8B8,
            fps: 60,
            rotate_180: true,
            interleaved: true,
        }
    }

    pub fn mono(socket: BoardSocket) -> Self {
        Self {
            socket,
            width: 1280,
            height: 800,
            format: FrameFormat::L8,
            fps: 60,
            rotate_180: false,
            interleaved: false,
        }
    }
}

/// One image from the device.
pub trait DaiFrame: Send + Sync {
    fn data(&self) -> &[u8];
    /// Device timestamp, monotonic nanoseconds.
    fn timestamp_ns(&self) -> i64;
    fn sequence(&self) -> u64;
}

/// Output queue of a running pipeline.
pub trait DaiQueue: Send {
    fn get(&mut self, timeout_ms: u32) -> Result<Option<Box<dyn DaiFrame>>>;
}

pub trait DaiDevice: Send {
    fn name(&self) -> String;
    fn serial(&self) -> String;
    fn connected_cameras(&self) -> Vec<BoardSocket>;
    fn start_pipeline(&mut self, config: &DaiPipelineConfig) -> Result<Box<dyn DaiQueue>>;
}

struct SdkFrame(Box<dyn DaiFrame>);

impl FrameStorage for SdkFrame {
    fn bytes(&self) -> &[u8] {
        self.0.data()
    }
}

pub struct DepthAiFrameServer {
    info: FsInfo,
    pipeline: DaiPipelineConfig,
    // Kept open for the lifetime of the queue.
    _device: Box<dyn DaiDevice>,
    queue: Arc<Mutex<Box<dyn DaiQueue>>>,
    slam_sinks: Option<SlamSinks>,
    oth: ThreadHelper,
    state: FsState,
    ll: LevelFilter,
}

impl DepthAiFrameServer {
    pub fn create(
        mut device: Box<dyn DaiDevice>,
        pipeline: DaiPipelineConfig,
        config: &DriverConfig,
    ) -> Result<Self> {
        let ll = config.log.depthai;

        let cameras = device.connected_cameras();
        ll_debug!(ll, "Connected cameras: {:?}", cameras);
        if !cameras.contains(&pipeline.socket) {
            return Err(XrError::Unsupported(format!(
                "no {:?} camera on this device",
                pipeline.socket
            )));
        }

        let queue = device.start_pipeline(&pipeline)?;
        let name = device.name();
        let info = FsInfo {
            name: name.clone(),
            product: name,
            manufacturer: "Luxonis".into(),
            serial: device.serial(),
            source_id: 0x1d05,
        };
        ll_debug!(ll, "Created {:?} {}x{}@{}", pipeline.format, pipeline.width, pipeline.height, pipeline.fps);

        Ok(Self {
            info,
            pipeline,
            _device: device,
            queue: Arc::new(Mutex::new(queue)),
            slam_sinks: None,
            oth: ThreadHelper::new(),
            state: FsState::Stopped,
            ll,
        })
    }
}

struct Player {
    queue: Arc<Mutex<Box<dyn DaiQueue>>>,
    sink: Arc<dyn FrameSink>,
    pipeline: DaiPipelineConfig,
    source_id: u64,
    ll: LevelFilter,
}

impl Player {
    fn run(self, flag: RunFlag) {
        ll_debug!(self.ll, "Mainloop called");
        let mut queue = lock(&self.queue);
        while flag.is_running() {
            match queue.get(QUEUE_TIMEOUT_MS) {
                Ok(Some(f)) => self.push(f),
                Ok(None) => {}
                Err(e) => {
                    ll_error!(self.ll, "Queue failed: {}", e);
                    break;
                }
            }
        }
        ll_debug!(self.ll, "Mainloop exiting");
    }

    fn push(&self, f: Box<dyn DaiFrame>) {
        let mut info = FrameInfo::packed(self.pipeline.width, self.pipeline.height, self.pipeline.format);
        if f.data().len() < info.size {
            ll_warn!(self.ll, "Short frame: {} < {} bytes", f.data().len(), info.size);
            return;
        }
        info.timestamp_ns = f.timestamp_ns();
        info.source_timestamp_ns = f.timestamp_ns();
        info.source_sequence = f.sequence();
        info.source_id = self.source_id;

        let frame = Frame::new(info, Arc::new(SdkFrame(f)));
        self.sink.push_frame(&frame);
    }
}

impl FrameServer for DepthAiFrameServer {
    fn info(&self) -> &FsInfo {
        &self.info
    }

    fn enumerate_modes(&self) -> Result<Vec<FsMode>> {
        Ok(vec![FsMode {
            width: self.pipeline.width,
            height: self.pipeline.height,
            format: self.pipeline.format,
            stereo_format: StereoFormat::None,
        }])
    }

    fn configure_capture(&mut self, _params: &CaptureParameters) -> Result<()> {
        Err(XrError::Unsupported("DepthAI capture parameters".into()))
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
        let sink = match sink {
            Some(s) => s,
            None => self
                .slam_sinks
                .as_ref()
                .and_then(|s| s.left().cloned())
                .ok_or_else(|| XrError::InvalidArgument("tracking stream needs SLAM sinks".into()))?,
        };

        let player = Player {
            queue: self.queue.clone(),
            sink,
            pipeline: self.pipeline,
            source_id: self.info.source_id,
            ll: self.ll,
        };
        self.oth.start("depthai-play", move |flag| player.run(flag))?;
        self.state = FsState::Running;
        ll_debug!(self.ll, "Stream started");
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
        self.oth.stop();
        self.state = FsState::Stopped;
        ll_debug!(self.ll, "Stream stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }

    fn log_level(&self) -> LevelFilter {
        self.ll
    }
}

impl Drop for DepthAiFrameServer {
    fn drop(&mut self) {
        let _ = self.stream_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::tests::CollectSink;
    use crossbeam_channel::{Receiver, Sender};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeFrame {
        data: Vec<u8>,
        ts: i64,
        released: Arc<AtomicUsize>,
    }

    impl DaiFrame for FakeFrame {
        fn data(&self) -> &[u8] {
            &self.data
        }
        fn timestamp_ns(&self) -> i64 {
            self.ts
        }
        fn sequence(&self) -> u64 {
            self.ts as u64
        }
    }

    impl Drop for FakeFrame {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeQueue(Receiver<Box<dyn DaiFrame>>);

    impl DaiQueue for FakeQueue {
        fn get(&mut self, timeout_ms: u32) -> Result<Option<Box<dyn DaiFrame>>> {
            Ok(self.0.recv_timeout(Duration::from_millis(timeout_ms as u64)).ok())
        }
    }

    struct FakeDevice(Option<Receiver<Box<dyn DaiFrame>>>);

    impl DaiDevice for FakeDevice {
        fn name(&self) -> String {
            "OAK-D".into()
        }
        fn serial(&self) -> String {
            "1234".into()
        }
        fn connected_cameras(&self) -> Vec<BoardSocket> {
            vec![BoardSocket::Rgb, BoardSocket::Left, BoardSocket::Right]
        }
        fn start_pipeline(&mut self, _config: &DaiPipelineConfig) -> Result<Box<dyn DaiQueue>> {
            let rx = self.0.take().ok_or(XrError::StreamStopped)?;
            Ok(Box::new(FakeQueue(rx)))
        }
    }

    fn server(pipeline: DaiPipelineConfig) -> (DepthAiFrameServer, Sender<Box<dyn DaiFrame>>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let fs = DepthAiFrameServer::create(
            Box::new(FakeDevice(Some(rx))),
            pipeline,
            &DriverConfig::default(),
        )
        .unwrap();
        (fs, tx)
    }

    #[test]
    fn test_single_mode() {
        let (mut fs, _tx) = server(DaiPipelineConfig::mono(BoardSocket::Left));
        let modes = fs.enumerate_modes().unwrap();
        assert_eq!(modes.len(), 1);
        assert_eq!((modes[0].width, modes[0].height, modes[0].format), (1280, 800, FrameFormat::L8));
        assert!(matches!(
            fs.configure_capture(&CaptureParameters::default()),
            Err(XrError::Unsupported(_))
        ));
        let sink: Arc<dyn FrameSink> = Arc::new(CollectSink::default());
        assert!(fs.stream_start(Some(sink), CaptureType::Calibration, 1).is_err());
    }

    #[test]
    fn test_frames_keep_sdk_frame_alive() {
        let (mut fs, tx) = server(DaiPipelineConfig::color());
        let sink = Arc::new(CollectSink::default());
        fs.stream_start(Some(sink.clone()), CaptureType::Calibration, 0).unwrap();
        assert!(fs.is_running());

        let released = Arc::new(AtomicUsize::new(0));
        for ts in [100, 200] {
            tx.send(Box::new(FakeFrame {
                data: vec![7; 1280 * 800 * 3],
                ts,
                released: released.clone(),
            }))
            .unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while sink.timestamps().len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        fs.stream_stop().unwrap();
        assert!(!fs.is_running());
        assert_eq!(sink.timestamps(), vec![100, 200]);

        // The collecting sink still holds both frames.
        assert_eq!(released.load(Ordering::SeqCst), 0);
        let frames = sink.take();
        assert_eq!(frames[0].info().stride, 1280 * 3);
        drop(frames);
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_camera_is_unsupported() {
        struct NoRgb;
        impl DaiDevice for NoRgb {
            fn name(&self) -> String {
                "OAK-D Lite".into()
            }
            fn serial(&self) -> String {
                String::new()
            }
            fn connected_cameras(&self) -> Vec<BoardSocket> {
                vec![BoardSocket::Left]
            }
            fn start_pipeline(&mut self, _config: &DaiPipelineConfig) -> Result<Box<dyn DaiQueue>> {
                Err(XrError::StreamStopped)
            }
        }
        let ret = DepthAiFrameServer::create(Box::new(NoRgb), DaiPipelineConfig::color(), &DriverConfig::default());
        assert!(matches!(ret, Err(XrError::Unsupported(_))));
    }
}
