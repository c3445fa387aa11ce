//! Frame server for UVC and other V4L2 capture devices.
//!
//! Frames are lent straight out of the capture buffers; see [`buffers`]
//! for how they find their way back to the kernel.

pub mod buffers;
pub mod device;
pub mod quirks;

use crate::config::DriverConfig;
use crate::frame::{Frame, FrameFormat, FrameInfo, StereoFormat};
use crate::frameserver::{
    check_start_args, CaptureParameters, CaptureType, FrameServer, FsInfo, FsMode, FsState,
};
use crate::sink::{FrameSink, SlamSinks, StereoSbsSplitSink};
use crate::thread::{lock, RunFlag, ThreadHelper};
use crate::time::monotonic_ns;
use crate::{Result, XrError};
use buffers::{BufferArena, DeviceQueue, Memory};
use device::{CaptureIo, Dequeued, V4lDevice};
use log::LevelFilter;
use quirks::{ControlState, QuirkKind, Want};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use v4l::capability::Flags;
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::memory::Memory as BufferMemory;
use v4l::v4l_sys::{V4L2_CID_EXPOSURE_ABSOLUTE, V4L2_CID_GAIN};
use v4l::video::Capture;
use v4l::FourCC;

pub const NUM_BUFFERS: u32 = 5;
const POLL_TIMEOUT_MS: i32 = 100;
pub const DEFAULT_DEVICE: &str = "/dev/video0";

/// A capture mode together with how to find it in the raw stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Descriptor {
    /// What consumers see.
    pub mode: FsMode,
    pub pixel_format: FourCC,
    pub stream_width: u32,
    pub stream_height: u32,
    pub stride: usize,
    pub size: usize,
    /// Bytes to skip at the start of every buffer.
    pub offset: usize,
}

impl Descriptor {
    /// `None` for pixel formats we do not stream.
    pub fn new(pixel_format: FourCC, width: u32, height: u32) -> Option<Descriptor> {
        let format = match &pixel_format.repr {
            b"YUYV" => FrameFormat::Yuyv422,
            b"UYVY" => FrameFormat::Uyvy422,
            b"MJPG" => FrameFormat::Mjpeg,
            _ => return None,
        };
        // Compressed frames report their size per buffer.
        let (stride, size) = format.size_for_dimensions(width, height).unwrap_or((0, 0));
        Some(Descriptor {
            mode: FsMode {
                width,
                height,
                format,
                stereo_format: StereoFormat::None,
            },
            pixel_format,
            stream_width: width,
            stream_height: height,
            stride,
            size,
            offset: 0,
        })
    }
}

fn ioctl_error(request: &'static str) -> impl Fn(io::Error) -> XrError {
    move |source| XrError::Ioctl { request, source }
}

/// Parses a sysfs `idVendor`/`idProduct` file.
pub fn parse_usb_id(text: &str) -> Option<u16> {
    u16::from_str_radix(text.trim(), 16).ok()
}

/// USB ids of the device behind a `/dev/videoN` node, when it is USB.
pub fn usb_ids(path: &Path) -> Option<(u16, u16)> {
    let real = std::fs::canonicalize(path).ok()?;
    let node = real.file_name()?.to_str()?;
    let usb_dir = PathBuf::from("/sys/class/video4linux")
        .join(node)
        .join("device")
        .join("..");
    let read = |f: &str| std::fs::read_to_string(usb_dir.join(f)).ok().and_then(|t| parse_usb_id(&t));
    Some((read("idVendor")?, read("idProduct")?))
}

fn update_controls(
    io: &dyn CaptureIo,
    controls: &Mutex<Vec<ControlState>>,
    capture_type: CaptureType,
    ll: LevelFilter,
) {
    for c in lock(controls).iter_mut() {
        match c.apply(io, capture_type) {
            Ok(true) => ll_debug!(ll, "Set control {} to {}", c.name, c.value),
            Ok(false) => {}
            Err(e) => ll_warn!(ll, "Failed to update control {}: {}", c.name, e),
        }
    }
}

fn memory_name(memory: BufferMemory) -> &'static str {
    match memory {
        BufferMemory::UserPtr => "USERPTR",
        _ => "MMAP",
    }
}

pub struct V4l2FrameServer {
    info: FsInfo,
    io: Arc<dyn CaptureIo>,
    quirk: Option<QuirkKind>,
    descriptors: Vec<Descriptor>,
    controls: Arc<Mutex<Vec<ControlState>>>,
    slam_sinks: Option<SlamSinks>,
    arena: Option<Arc<BufferArena>>,
    oth: ThreadHelper,
    state: FsState,
    ll: LevelFilter,
}

impl V4l2FrameServer {
    /// Opens the node named in the config file, or `/dev/video0`.
    pub fn open_default(config: &DriverConfig) -> Result<Self> {
        let path = config.file.v4l2.device.as_deref().unwrap_or(DEFAULT_DEVICE);
        Self::open(Path::new(path), config)
    }

    pub fn open(path: &Path, config: &DriverConfig) -> Result<Self> {
        let ll = config.log.v4l2;
        let dev = V4lDevice::open(path)?;

        let caps = dev.device().query_caps().map_err(ioctl_error("VIDIOC_QUERYCAP"))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE | Flags::STREAMING) {
            return Err(XrError::Unsupported(format!(
                "{} is not a streaming capture device",
                path.display()
            )));
        }

        match dev.device().params() {
            Ok(p) => ll_debug!(
                ll,
                "'{}' frame interval {}/{}",
                caps.card,
                p.interval.numerator,
                p.interval.denominator
            ),
            Err(e) => ll_debug!(ll, "VIDIOC_G_PARM: {}", e),
        }

        let ids = usb_ids(path);
        let quirk = quirks::find(ids, &caps.card);
        if let Some(q) = quirk {
            ll_info!(ll, "Applying {:?} quirks to '{}'", q, caps.card);
        }

        let mut descriptors = enumerate(dev.device(), ll)?;
        if let Some(q) = quirk {
            descriptors.iter_mut().for_each(|d| q.fixup_descriptor(d));
        }
        let controls = quirk
            .map(|q| q.controls(config.v4l2_exposure_absolute))
            .unwrap_or_default();

        ll_info!(
            ll,
            "Opened '{}' ({}) at {}, {} modes",
            caps.card,
            caps.driver,
            path.display(),
            descriptors.len()
        );

        let info = FsInfo {
            name: caps.card.clone(),
            product: caps.card,
            manufacturer: caps.driver,
            serial: caps.bus,
            source_id: ids.map(|(v, p)| ((v as u64) << 16) | p as u64).unwrap_or(0),
        };
        Ok(Self::from_parts(info, Arc::new(dev), quirk, descriptors, controls, ll))
    }

    fn from_parts(
        info: FsInfo,
        io: Arc<dyn CaptureIo>,
        quirk: Option<QuirkKind>,
        descriptors: Vec<Descriptor>,
        controls: Vec<ControlState>,
        ll: LevelFilter,
    ) -> Self {
        Self {
            info,
            io,
            quirk,
            descriptors,
            controls: Arc::new(Mutex::new(controls)),
            slam_sinks: None,
            arena: None,
            oth: ThreadHelper::new(),
            state: FsState::Stopped,
            ll,
        }
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn quirk(&self) -> Option<QuirkKind> {
        self.quirk
    }

    /// User pointers first, driver memory if the driver refuses them.
    fn alloc_buffers(&self, image_size: usize) -> Result<(Arc<BufferArena>, BufferMemory)> {
        let (memory_type, count) = match self.io.request_buffers(BufferMemory::UserPtr, NUM_BUFFERS) {
            Ok(n) => (BufferMemory::UserPtr, n),
            Err(e) => {
                ll_debug!(self.ll, "USERPTR unavailable ({}), using MMAP", e);
                let n = self
                    .io
                    .request_buffers(BufferMemory::Mmap, NUM_BUFFERS)
                    .map_err(ioctl_error("VIDIOC_REQBUFS"))?;
                (BufferMemory::Mmap, n)
            }
        };

        let mut memory = Vec::with_capacity(count as usize);
        let mut slots = Vec::with_capacity(count as usize);
        for i in 0..count {
            let mem = match self.buffer_memory(memory_type, i, image_size) {
                Ok(mem) => mem,
                Err(e) => {
                    drop(memory);
                    self.free_buffers(memory_type);
                    return Err(e);
                }
            };
            slots.push((mem.userptr(), mem.as_slice().len() as u32));
            memory.push(mem);
        }

        ll_debug!(self.ll, "Allocated {} {} buffers", count, memory_name(memory_type));
        let queue = DeviceQueue {
            io: self.io.clone(),
            memory: memory_type,
            slots,
        };
        Ok((BufferArena::new(memory, Box::new(queue), self.ll), memory_type))
    }

    fn buffer_memory(&self, memory_type: BufferMemory, index: u32, image_size: usize) -> Result<Memory> {
        let (length, offset) = self
            .io
            .query_buffer(memory_type, index)
            .map_err(ioctl_error("VIDIOC_QUERYBUF"))?;
        let mem = match memory_type {
            BufferMemory::UserPtr => Memory::alloc_userptr(image_size.max(length))?,
            _ => self.io.map_buffer(offset, length)?,
        };
        Ok(mem)
    }

    /// REQBUFS with a count of zero; every mapping must be gone by now.
    fn free_buffers(&self, memory_type: BufferMemory) {
        if let Err(e) = self.io.request_buffers(memory_type, 0) {
            ll_error!(self.ll, "Failed to free {} buffers: {}", memory_name(memory_type), e);
        }
    }

    /// Undoes a start that got as far as allocating buffers.
    fn abort_start(&self, arena: Arc<BufferArena>, memory_type: BufferMemory) {
        arena.stop();
        if let Err(e) = self.io.stream_off() {
            ll_error!(self.ll, "VIDIOC_STREAMOFF failed: {}", e);
        }
        drop(arena);
        self.free_buffers(memory_type);
    }

    fn stream_target(
        &self,
        sink: Option<Arc<dyn FrameSink>>,
        capture_type: CaptureType,
        desc: &Descriptor,
    ) -> Result<Arc<dyn FrameSink>> {
        if let Some(sink) = sink {
            return Ok(sink);
        }
        let sinks = self.slam_sinks.as_ref().ok_or_else(|| {
            XrError::InvalidArgument(format!("{:?} stream needs SLAM sinks", capture_type))
        })?;
        match (sinks.left(), sinks.right()) {
            (Some(l), Some(r)) if desc.mode.stereo_format == StereoFormat::SideBySide => {
                Ok(Arc::new(StereoSbsSplitSink::new(l.clone(), r.clone(), self.ll)))
            }
            (Some(l), _) => Ok(l.clone()),
            _ => Err(XrError::InvalidArgument("no left camera sink".into())),
        }
    }
}

fn enumerate(dev: &v4l::Device, ll: LevelFilter) -> Result<Vec<Descriptor>> {
    let mut out = Vec::new();
    for fmt in dev.enum_formats().map_err(ioctl_error("VIDIOC_ENUM_FMT"))? {
        if Descriptor::new(fmt.fourcc, 0, 0).is_none() {
            ll_debug!(ll, "Skipping format '{}'", fmt.description);
            continue;
        }
        let sizes = match dev.enum_framesizes(fmt.fourcc) {
            Ok(sizes) => sizes,
            Err(e) => {
                ll_debug!(ll, "No frame sizes for '{}': {}", fmt.description, e);
                continue;
            }
        };

        for size in sizes {
            let FrameSizeEnum::Discrete(size) = size.size else {
                break;
            };
            let (w, h) = (size.width, size.height);

            let interval = match dev.enum_frameintervals(fmt.fourcc, w, h) {
                Ok(intervals) => intervals.into_iter().next(),
                Err(_) => None,
            };
            let Some(interval) = interval else {
                ll_debug!(ll, "No frame intervals for {}x{}", w, h);
                continue;
            };

            if let Some(d) = Descriptor::new(fmt.fourcc, w, h) {
                match interval.interval {
                    FrameIntervalEnum::Discrete(f) => {
                        ll_trace!(ll, "Mode {}x{} {:?} {}/{}", w, h, d.mode.format, f.numerator, f.denominator)
                    }
                    FrameIntervalEnum::Stepwise(_) => ll_trace!(ll, "Mode {}x{} {:?} stepwise", w, h, d.mode.format),
                }
                out.push(d);
            }
        }
    }
    Ok(out)
}

struct Producer {
    io: Arc<dyn CaptureIo>,
    memory_type: BufferMemory,
    arena: Arc<BufferArena>,
    sink: Arc<dyn FrameSink>,
    desc: Descriptor,
    controls: Arc<Mutex<Vec<ControlState>>>,
    capture_type: CaptureType,
    source_id: u64,
    ll: LevelFilter,
}

impl Producer {
    fn run(self, flag: RunFlag) {
        while flag.is_running() {
            match self.io.wait(POLL_TIMEOUT_MS) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    ll_error!(self.ll, "poll failed: {}", e);
                    break;
                }
            }

            let buf = match self.io.dequeue(self.memory_type) {
                Ok(Some(buf)) => buf,
                Ok(None) => continue,
                Err(e) => {
                    ll_error!(self.ll, "VIDIOC_DQBUF failed: {}", e);
                    break;
                }
            };

            update_controls(self.io.as_ref(), &self.controls, self.capture_type, self.ll);
            self.push(&buf);
        }
        ll_debug!(self.ll, "Producer exiting");
    }

    fn push(&self, buf: &Dequeued) {
        let Some(storage) = self.arena.dequeued(buf.index, self.desc.offset, buf.bytes_used) else {
            return;
        };
        let timestamp_ns = buf.timestamp_ns.unwrap_or_else(monotonic_ns);

        let mut info = FrameInfo::packed(self.desc.mode.width, self.desc.mode.height, self.desc.mode.format);
        info.stride = self.desc.stride;
        info.size = buf.bytes_used.saturating_sub(self.desc.offset);
        info.stereo_format = self.desc.mode.stereo_format;
        info.timestamp_ns = timestamp_ns;
        info.source_timestamp_ns = timestamp_ns;
        info.source_sequence = buf.sequence as u64;
        info.source_id = self.source_id;

        let frame = Frame::new(info, Arc::new(storage));
        ll_trace!(self.ll, "Frame {} idx {} at {}", buf.sequence, buf.index, timestamp_ns);
        self.sink.push_frame(&frame);
    }
}

impl FrameServer for V4l2FrameServer {
    fn info(&self) -> &FsInfo {
        &self.info
    }

    fn enumerate_modes(&self) -> Result<Vec<FsMode>> {
        Ok(self.descriptors.iter().map(|d| d.mode).collect())
    }

    /// Holds gain and absolute exposure at the given values for both
    /// capture types; applied with the next frame.
    fn configure_capture(&mut self, params: &CaptureParameters) -> Result<()> {
        let mut controls = lock(&self.controls);
        for (id, name, value) in [
            (V4L2_CID_GAIN, "gain", params.gain),
            (V4L2_CID_EXPOSURE_ABSOLUTE, "exposure_absolute", params.exposure),
        ] {
            let want = Want::set(value.round() as i32);
            match controls.iter_mut().find(|c| c.id == id) {
                Some(c) => {
                    c.want = [want; 2];
                    c.force = 2;
                }
                None => controls.push(ControlState::new(id, name, want, want)),
            }
        }
        Ok(())
    }

    fn stream_start(
        &mut self,
        sink: Option<Arc<dyn FrameSink>>,
        capture_type: CaptureType,
        mode_index: usize,
    ) -> Result<()> {
        if self.state.is_running() {
            ll_warn!(self.ll, "'{}' already streaming", self.info.name);
            return Ok(());
        }
        check_start_args(&sink, capture_type)?;
        let desc = *self
            .descriptors
            .get(mode_index)
            .ok_or_else(|| XrError::InvalidArgument(format!("no mode {}", mode_index)))?;
        let target = self.stream_target(sink, capture_type, &desc)?;

        let image_size = self.io.set_format(&desc).map_err(ioctl_error("VIDIOC_S_FMT"))?;
        let (arena, memory_type) = self.alloc_buffers(image_size.max(desc.size + desc.offset))?;
        let started = arena
            .queue_all()
            .map_err(ioctl_error("VIDIOC_QBUF"))
            .and_then(|()| self.io.stream_on().map_err(ioctl_error("VIDIOC_STREAMON")));
        if let Err(e) = started {
            self.abort_start(arena, memory_type);
            return Err(e);
        }
        update_controls(self.io.as_ref(), &self.controls, capture_type, self.ll);

        let producer = Producer {
            io: self.io.clone(),
            memory_type,
            arena: arena.clone(),
            sink: target,
            desc,
            controls: self.controls.clone(),
            capture_type,
            source_id: self.info.source_id,
            ll: self.ll,
        };
        if let Err(e) = self.oth.start("v4l2-capture", move |flag| producer.run(flag)) {
            self.abort_start(arena, memory_type);
            return Err(e);
        }

        self.arena = Some(arena);
        self.state = FsState::Running;
        ll_info!(
            self.ll,
            "Streaming {}x{} {:?} from '{}'",
            desc.mode.width,
            desc.mode.height,
            desc.mode.format,
            self.info.name
        );
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

        // Outstanding frames keep the arena alive; they no longer requeue.
        if let Some(arena) = self.arena.take() {
            arena.stop();
        }
        self.io.stream_off().map_err(ioctl_error("VIDIOC_STREAMOFF"))
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }

    fn log_level(&self) -> LevelFilter {
        self.ll
    }
}

impl Drop for V4l2FrameServer {
    fn drop(&mut self) {
        if let Err(e) = self.stream_stop() {
            ll_error!(self.ll, "Failed to stop '{}': {}", self.info.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::tests::CollectSink;
    use device::fake::FakeCapture;
    use std::time::{Duration, Instant};

    fn yuyv(w: u32, h: u32) -> Descriptor {
        Descriptor::new(FourCC::new(b"YUYV"), w, h).unwrap()
    }

    fn fake_server(fake: Arc<FakeCapture>, descriptors: Vec<Descriptor>) -> V4l2FrameServer {
        V4l2FrameServer::from_parts(
            FsInfo {
                name: "test".into(),
                ..Default::default()
            },
            fake,
            None,
            descriptors,
            Vec::new(),
            LevelFilter::Off,
        )
    }

    fn server(descriptors: Vec<Descriptor>) -> V4l2FrameServer {
        fake_server(Arc::new(FakeCapture::new(3, 320 * 2 * 240)), descriptors)
    }

    fn failed_request(res: Result<()>) -> &'static str {
        match res {
            Err(XrError::Ioctl { request, .. }) => request,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_descriptor_formats() {
        let d = yuyv(640, 480);
        assert_eq!(d.mode.format, FrameFormat::Yuyv422);
        assert_eq!((d.stride, d.size), (1280, 1280 * 480));
        let m = Descriptor::new(FourCC::new(b"MJPG"), 640, 480).unwrap();
        assert_eq!((m.stride, m.size), (0, 0));
        assert!(Descriptor::new(FourCC::new(b"NV12"), 640, 480).is_none());
    }

    #[test]
    fn test_parse_usb_id() {
        assert_eq!(parse_usb_id("05a9\n"), Some(0x05a9));
        assert_eq!(parse_usb_id("zz"), None);
    }

    #[test]
    fn test_enumerate_reports_descriptor_modes() {
        let d = Descriptor::new(FourCC::new(b"UYVY"), 320, 240).unwrap();
        let fs = server(vec![d]);
        assert_eq!(fs.enumerate_modes().unwrap(), vec![d.mode]);
    }

    #[test]
    fn test_start_argument_errors() {
        let fake = Arc::new(FakeCapture::new(3, 320 * 2 * 240));
        let mut fs = fake_server(fake.clone(), vec![yuyv(320, 240)]);
        // Tracking without SLAM sinks.
        assert!(matches!(
            fs.stream_start(None, CaptureType::Tracking, 0),
            Err(XrError::InvalidArgument(_))
        ));
        let sink: Arc<dyn FrameSink> = Arc::new(CollectSink::default());
        assert!(matches!(
            fs.stream_start(Some(sink.clone()), CaptureType::Calibration, 3),
            Err(XrError::InvalidArgument(_))
        ));
        assert!(matches!(
            fs.stream_start(Some(sink), CaptureType::Tracking, 0),
            Err(XrError::InvalidArgument(_))
        ));
        assert!(!fs.is_running());
        assert!(fake.calls().is_empty());
        // Stopping a stopped server is fine.
        assert!(fs.stream_stop().is_ok());
    }

    #[test]
    fn test_configure_capture_sets_wants() {
        let mut fs = server(Vec::new());
        fs.configure_capture(&CaptureParameters {
            gain: 4.0,
            exposure: 120.0,
        })
        .unwrap();
        let controls = lock(&fs.controls);
        let gain = controls.iter().find(|c| c.id == V4L2_CID_GAIN).unwrap();
        assert_eq!(gain.want, [Want::set(4); 2]);
        let exp = controls
            .iter()
            .find(|c| c.id == V4L2_CID_EXPOSURE_ABSOLUTE)
            .unwrap();
        assert_eq!(exp.want[1], Want::set(120));
    }

    #[test]
    fn test_failed_queue_frees_buffers() {
        let fake = Arc::new(FakeCapture::new(3, 320 * 2 * 240));
        fake.fail("QBUF");
        let mut fs = fake_server(fake.clone(), vec![yuyv(320, 240)]);
        let sink: Arc<dyn FrameSink> = Arc::new(CollectSink::default());

        let res = fs.stream_start(Some(sink), CaptureType::Calibration, 0);
        assert_eq!(failed_request(res), "VIDIOC_QBUF");
        assert!(!fs.is_running());
        assert_eq!(
            fake.calls(),
            vec![
                "S_FMT 320x240",
                "REQBUFS USERPTR 5",
                "QUERYBUF 0",
                "QUERYBUF 1",
                "QUERYBUF 2",
                "QBUF 0",
                "STREAMOFF",
                "REQBUFS USERPTR 0",
            ]
        );
    }

    #[test]
    fn test_failed_stream_on_still_frees_buffers() {
        let fake = Arc::new(FakeCapture::new(2, 320 * 2 * 240));
        fake.fail("STREAMON");
        fake.fail("STREAMOFF");
        let mut fs = fake_server(fake.clone(), vec![yuyv(320, 240)]);
        let sink: Arc<dyn FrameSink> = Arc::new(CollectSink::default());

        let res = fs.stream_start(Some(sink), CaptureType::Calibration, 0);
        assert_eq!(failed_request(res), "VIDIOC_STREAMON");
        // STREAMOFF failing does not skip the release.
        let calls = fake.calls();
        assert_eq!(&calls[calls.len() - 3..], &["STREAMON", "STREAMOFF", "REQBUFS USERPTR 0"]);
    }

    #[test]
    fn test_failed_query_frees_mmap_buffers() {
        let fake = Arc::new(FakeCapture::new(2, 320 * 2 * 240));
        fake.fail("REQBUFS");
        fake.fail("QUERYBUF");
        let mut fs = fake_server(fake.clone(), vec![yuyv(320, 240)]);
        let sink: Arc<dyn FrameSink> = Arc::new(CollectSink::default());

        let res = fs.stream_start(Some(sink), CaptureType::Calibration, 0);
        assert_eq!(failed_request(res), "VIDIOC_QUERYBUF");
        assert_eq!(
            fake.calls(),
            vec![
                "S_FMT 320x240",
                "REQBUFS USERPTR 5",
                "REQBUFS MMAP 5",
                "QUERYBUF 0",
                "REQBUFS MMAP 0",
            ]
        );
    }

    #[test]
    fn test_streams_dequeued_buffers() {
        let fake = Arc::new(FakeCapture::new(3, 320 * 2 * 240));
        let mut fs = fake_server(fake.clone(), vec![yuyv(320, 240)]);
        let sink = Arc::new(CollectSink::default());
        let target: Arc<dyn FrameSink> = sink.clone();
        fs.stream_start(Some(target), CaptureType::Calibration, 0).unwrap();
        assert!(fs.is_running());

        fake.0.lock().unwrap().frames.push_back(Dequeued {
            index: 1,
            bytes_used: 320 * 2 * 240,
            sequence: 7,
            timestamp_ns: Some(42),
        });
        let start = Instant::now();
        while sink.frames.lock().unwrap().is_empty() {
            assert!(start.elapsed() < Duration::from_secs(5), "no frame");
            std::thread::sleep(Duration::from_millis(2));
        }

        let frames = sink.take();
        assert_eq!(frames[0].timestamp_ns(), 42);
        assert_eq!(frames[0].info().source_sequence, 7);
        assert_eq!(frames[0].data().len(), 320 * 2 * 240);

        fs.stream_stop().unwrap();
        assert!(!fs.is_running());
        assert_eq!(fake.calls().last().map(String::as_str), Some("STREAMOFF"));
        // The stopped arena keeps the buffer instead of queueing it again.
        drop(frames);
        assert_eq!(fake.calls().iter().filter(|c| c.as_str() == "QBUF 1").count(), 1);
    }
}
