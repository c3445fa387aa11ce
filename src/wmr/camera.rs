//! Tracking cameras of Windows Mixed Reality headsets.
//!
//! All head tracking sensors are read out as one bulk transfer on
//! interface 3. The transfer is cut into 0x6000 byte packets, each with a
//! 32 byte header; the payload is one wide L8 image holding every camera
//! side by side, plus a first row of metadata, then 26 trailing bytes.

use crate::frame::{Frame, FrameFormat, FrameInfo};
use crate::sink::{DebugSink, FrameSink};
use crate::thread::{RunFlag, ThreadHelper};
use crate::{Result, XrError};
use log::LevelFilter;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const CAM_INTERFACE: u8 = 3;
pub const CAM_ENDPOINT_OUT: u8 = 0x05;
pub const CAM_ENDPOINT_IN: u8 = 0x85;

/// "Dlo+", little endian.
pub const WMR_MAGIC: u32 = u32::from_le_bytes(*b"Dlo+");

pub const PACKET_SIZE: usize = 0x6000;
pub const PACKET_HEADER_SIZE: usize = 32;
const PACKET_PAYLOAD: usize = PACKET_SIZE - PACKET_HEADER_SIZE;
const TRAILER_SIZE: usize = 26;

const CMD_GAIN: u16 = 0x80;
const CMD_ON: u32 = 0x81;
const CMD_OFF: u32 = 0x82;
pub const DEFAULT_GAIN: u8 = 0x60;

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Metadata row offsets.
const META_EXPOSURE: usize = 6;
const META_SEQUENCE: usize = 89;

/// Hardware frame timestamp in the first packet header, 100 ns ticks.
const HEADER_TIMESTAMP: std::ops::Range<usize> = 8..16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraPurpose {
    HeadTracking,
    DisplayObserver,
}

/// One sensor as described by the headset's config block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WmrCameraConfig {
    /// Also the camera id used by the gain command.
    pub location: u8,
    pub purpose: CameraPurpose,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraSlot {
    pub location: u8,
    pub x: u32,
    pub width: u32,
}

/// Where every tracking camera sits in a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    /// Width of all tracking cameras side by side.
    pub width: u32,
    /// Image height, without the metadata row.
    pub height: u32,
    pub cams: Vec<CameraSlot>,
    pub xfer_size: usize,
}

impl FrameLayout {
    /// `F = Σ w·(h+1) + 26`, sent as `n = F / (0x6000 − 32)` full packets
    /// followed by one short packet with the rest.
    pub fn compute(configs: &[WmrCameraConfig]) -> Result<FrameLayout> {
        let mut cams = Vec::new();
        let mut width = 0;
        let mut height = None;
        let mut f = TRAILER_SIZE;

        for c in configs.iter().filter(|c| c.purpose == CameraPurpose::HeadTracking) {
            match height {
                None => height = Some(c.height),
                Some(h) if h != c.height => {
                    return Err(XrError::Unsupported(format!(
                        "tracking cameras have mismatched heights {} != {}",
                        h, c.height
                    )));
                }
                Some(_) => {}
            }
            cams.push(CameraSlot {
                location: c.location,
                x: width,
                width: c.width,
            });
            width += c.width;
            f += c.width as usize * (c.height as usize + 1);
        }

        let height = height.ok_or_else(|| XrError::Unsupported("no head tracking cameras".into()))?;
        if width < 1280 || height < 480 {
            return Err(XrError::Unsupported(format!("unexpected camera frame {}x{}", width, height)));
        }

        let n = f / PACKET_PAYLOAD;
        let leftover = f - n * PACKET_PAYLOAD;
        Ok(FrameLayout {
            width,
            height,
            cams,
            xfer_size: n * PACKET_SIZE + PACKET_HEADER_SIZE + leftover,
        })
    }

    /// Bytes of image data, metadata row included.
    pub fn image_size(&self) -> usize {
        self.width as usize * (self.height as usize + 1)
    }
}

pub fn active_cmd(on: bool) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[0..4].copy_from_slice(&WMR_MAGIC.to_le_bytes());
    out[4..8].copy_from_slice(&12u32.to_le_bytes());
    out[8..12].copy_from_slice(&(if on { CMD_ON } else { CMD_OFF }).to_le_bytes());
    out
}

pub fn gain_cmd(camera_id: u8, gain: u8) -> [u8; 18] {
    let mut out = [0u8; 18];
    out[0..4].copy_from_slice(&WMR_MAGIC.to_le_bytes());
    out[4..8].copy_from_slice(&18u32.to_le_bytes());
    out[8..10].copy_from_slice(&CMD_GAIN.to_le_bytes());
    out[10..12].copy_from_slice(&(camera_id as u16).to_le_bytes());
    out[12..14].copy_from_slice(&6000u16.to_le_bytes());
    out[14..16].copy_from_slice(&(gain as u16).to_le_bytes());
    out[16..18].copy_from_slice(&(camera_id as u16).to_le_bytes());
    out
}

/// Strips the packet headers, returning the image with its metadata row.
pub fn unpack_transfer(xfer: &[u8], layout: &FrameLayout) -> Option<Vec<u8>> {
    let size = layout.image_size();
    let mut out = Vec::with_capacity(size);
    let mut src = 0;
    while out.len() < size {
        let n = (size - out.len()).min(PACKET_PAYLOAD);
        src += PACKET_HEADER_SIZE;
        out.extend_from_slice(xfer.get(src..src + n)?);
        src += n;
    }
    Some(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    /// Zero on the dark frames used for controller tracking.
    pub exposure: u16,
    pub sequence: u8,
    pub timestamp_ns: i64,
}

impl FrameMeta {
    pub fn parse(xfer: &[u8], image: &[u8]) -> Option<FrameMeta> {
        let ts = xfer.get(HEADER_TIMESTAMP)?;
        let ticks = u64::from_le_bytes(ts.try_into().ok()?);
        Some(FrameMeta {
            exposure: u16::from_be_bytes([*image.get(META_EXPOSURE)?, *image.get(META_EXPOSURE + 1)?]),
            sequence: *image.get(META_SEQUENCE)?,
            timestamp_ns: (ticks as i64).saturating_mul(100),
        })
    }
}

/// Bulk pipe to the camera interface.
pub trait CameraBus: Send + Sync {
    fn write(&self, data: &[u8]) -> Result<usize>;

    /// Reads one transfer. A timeout is `XrError::Usb(rusb::Error::Timeout)`.
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize>;
}

pub struct UsbBus {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
}

impl UsbBus {
    pub fn open(vid: u16, pid: u16) -> Result<UsbBus> {
        let handle = rusb::open_device_with_vid_pid(vid, pid).ok_or(XrError::DeviceNotFound)?;
        match handle.set_auto_detach_kernel_driver(true) {
            Ok(()) | Err(rusb::Error::NotSupported) => {}
            Err(e) => log::warn!("Auto detach: {} (continuing)", e),
        }
        handle.claim_interface(CAM_INTERFACE)?;
        Ok(UsbBus { handle })
    }
}

impl CameraBus for UsbBus {
    fn write(&self, data: &[u8]) -> Result<usize> {
        Ok(self.handle.write_bulk(CAM_ENDPOINT_OUT, data, WRITE_TIMEOUT)?)
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        Ok(self.handle.read_bulk(CAM_ENDPOINT_IN, buf, timeout)?)
    }
}

impl Drop for UsbBus {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(CAM_INTERFACE);
    }
}

/// Where decoded frames go.
#[derive(Clone, Default)]
pub struct WmrCameraSinks {
    /// One per tracking camera, in layout order.
    pub tracking: Vec<Arc<dyn FrameSink>>,
    /// Full dark frames.
    pub controllers: Option<Arc<dyn FrameSink>>,
}

pub struct WmrCamera {
    bus: Arc<dyn CameraBus>,
    layout: FrameLayout,
    gain: Arc<AtomicU8>,
    debug: [Arc<DebugSink>; 2],
    oth: ThreadHelper,
    running: bool,
    ll: LevelFilter,
}

impl WmrCamera {
    pub fn open(bus: Arc<dyn CameraBus>, configs: &[WmrCameraConfig], ll: LevelFilter) -> Result<WmrCamera> {
        let layout = FrameLayout::compute(configs)?;
        ll_info!(
            ll,
            "Camera framebuffer {} x {}, {} byte transfers",
            layout.width,
            layout.height,
            layout.xfer_size
        );
        Ok(WmrCamera {
            bus,
            layout,
            gain: Arc::new(AtomicU8::new(DEFAULT_GAIN)),
            debug: [Arc::new(DebugSink::new()), Arc::new(DebugSink::new())],
            oth: ThreadHelper::new(),
            running: false,
            ll,
        })
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    /// Picked up by the reader after the next frame.
    pub fn set_gain(&self, gain: u8) {
        self.gain.store(gain, Ordering::Relaxed);
    }

    /// Full frames for debug UIs: `[slam, controllers]`.
    pub fn debug_sinks(&self) -> [Arc<DebugSink>; 2] {
        self.debug.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn send_gain(&self, gain: u8) -> Result<()> {
        for cam in &self.layout.cams {
            self.bus.write(&gain_cmd(cam.location, gain))?;
        }
        Ok(())
    }

    pub fn start(&mut self, sinks: WmrCameraSinks) -> Result<()> {
        if self.running {
            return Ok(());
        }

        self.bus.write(&active_cmd(false))?;
        self.bus.write(&active_cmd(true))?;
        let gain = self.gain.load(Ordering::Relaxed);
        if let Err(e) = self.send_gain(gain) {
            ll_error!(self.ll, "Failed to set initial gain: {}", e);
            let _ = self.bus.write(&active_cmd(false));
            return Err(e);
        }

        let reader = Reader {
            bus: self.bus.clone(),
            layout: self.layout.clone(),
            sinks,
            debug: self.debug.clone(),
            gain: self.gain.clone(),
            last_gain: gain,
            last_seq: None,
            ll: self.ll,
        };
        self.oth.start("wmr-camera", move |flag| reader.run(flag))?;
        self.running = true;
        ll_info!(self.ll, "Camera started");
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        self.oth.stop();
        self.bus.write(&active_cmd(false))?;
        ll_info!(self.ll, "Camera stopped");
        Ok(())
    }
}

impl Drop for WmrCamera {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            ll_error!(self.ll, "Failed to stop camera: {}", e);
        }
    }
}

struct Reader {
    bus: Arc<dyn CameraBus>,
    layout: FrameLayout,
    sinks: WmrCameraSinks,
    debug: [Arc<DebugSink>; 2],
    gain: Arc<AtomicU8>,
    last_gain: u8,
    last_seq: Option<u8>,
    ll: LevelFilter,
}

impl Reader {
    fn run(mut self, flag: RunFlag) {
        let mut buf = vec![0u8; self.layout.xfer_size];
        while flag.is_running() {
            match self.bus.read(&mut buf, READ_TIMEOUT) {
                Ok(n) if n < buf.len() => {
                    ll_debug!(self.ll, "Camera transfer only delivered {} of {} bytes", n, buf.len());
                }
                Ok(_) => self.handle(&buf),
                Err(XrError::Usb(rusb::Error::Timeout)) => {}
                Err(e) => {
                    ll_error!(self.ll, "Camera read failed: {}", e);
                    break;
                }
            }
        }
        ll_debug!(self.ll, "Reader exiting");
    }

    fn handle(&mut self, xfer: &[u8]) {
        let image = match unpack_transfer(xfer, &self.layout) {
            Some(i) => i,
            None => return,
        };
        let meta = match FrameMeta::parse(xfer, &image) {
            Some(m) => m,
            None => return,
        };

        if let Some(last) = self.last_seq {
            if meta.sequence != last.wrapping_add(1) {
                ll_debug!(self.ll, "Camera frame seq {} after {}", meta.sequence, last);
            }
        }
        ll_trace!(
            self.ll,
            "Camera frame seq {} exposure {} t={}",
            meta.sequence,
            meta.exposure,
            meta.timestamp_ns
        );
        self.last_seq = Some(meta.sequence);

        let mut info = FrameInfo::packed(self.layout.width, self.layout.height + 1, FrameFormat::L8);
        info.timestamp_ns = meta.timestamp_ns;
        info.source_timestamp_ns = meta.timestamp_ns;
        info.source_sequence = meta.sequence as u64;
        let frame = Frame::from_vec(info, image);

        if meta.exposure == 0 {
            self.debug[1].push_frame(&frame);
            if let Some(sink) = &self.sinks.controllers {
                sink.push_frame(&frame);
            }
        } else {
            self.debug[0].push_frame(&frame);
            for (cam, sink) in self.layout.cams.iter().zip(&self.sinks.tracking) {
                if let Some(f) = frame.sub_region(cam.x, 1, cam.width, self.layout.height) {
                    sink.push_frame(&f);
                }
            }
        }

        let gain = self.gain.load(Ordering::Relaxed);
        if gain != self.last_gain {
            self.last_gain = gain;
            for cam in &self.layout.cams {
                if let Err(e) = self.bus.write(&gain_cmd(cam.location, gain)) {
                    ll_warn!(self.ll, "Failed to set gain: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sink::tests::CollectSink;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub(crate) fn cams(n: u8) -> Vec<WmrCameraConfig> {
        (0..n)
            .map(|i| WmrCameraConfig {
                location: i,
                purpose: CameraPurpose::HeadTracking,
                width: 640,
                height: 480,
            })
            .collect()
    }

    #[derive(Default)]
    pub(crate) struct FakeBus {
        pub writes: Mutex<Vec<Vec<u8>>>,
        pub reads: Mutex<VecDeque<Vec<u8>>>,
    }

    impl CameraBus for FakeBus {
        fn write(&self, data: &[u8]) -> Result<usize> {
            self.writes.lock().unwrap().push(data.to_vec());
            Ok(data.len())
        }

        fn read(&self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            match self.reads.lock().unwrap().pop_front() {
                Some(data) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                None => {
                    std::thread::sleep(Duration::from_millis(2));
                    Err(XrError::Usb(rusb::Error::Timeout))
                }
            }
        }
    }

    /// Packs `image` the way the headset sends it.
    pub(crate) fn transfer(layout: &FrameLayout, image: &[u8], ticks: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(layout.xfer_size);
        for chunk in image.chunks(PACKET_PAYLOAD) {
            let mut header = [0u8; PACKET_HEADER_SIZE];
            header[HEADER_TIMESTAMP].copy_from_slice(&ticks.to_le_bytes());
            out.extend_from_slice(&header);
            out.extend_from_slice(chunk);
        }
        out.resize(layout.xfer_size, 0);
        out
    }

    /// Image whose pixels are the camera index, with the given metadata.
    pub(crate) fn image(layout: &FrameLayout, exposure: u16, seq: u8) -> Vec<u8> {
        let mut img = vec![0u8; layout.image_size()];
        for y in 1..=layout.height as usize {
            for (i, cam) in layout.cams.iter().enumerate() {
                let row = y * layout.width as usize + cam.x as usize;
                img[row..row + cam.width as usize].fill(i as u8 + 1);
            }
        }
        img[META_EXPOSURE..META_EXPOSURE + 2].copy_from_slice(&exposure.to_be_bytes());
        img[META_SEQUENCE] = seq;
        img
    }

    #[test]
    fn test_transfer_sizes() {
        let two = FrameLayout::compute(&cams(2)).unwrap();
        assert_eq!(two.width, 1280);
        assert_eq!(two.xfer_size, 616_538);

        let four = FrameLayout::compute(&cams(4)).unwrap();
        assert_eq!(four.width, 2560);
        assert_eq!(four.xfer_size, 1_233_018);
        assert_eq!(four.cams[3].x, 1920);
    }

    #[test]
    fn test_layout_rejects_bad_configs() {
        assert!(FrameLayout::compute(&cams(1)).is_err());
        let mut mixed = cams(2);
        mixed[1].height = 400;
        assert!(FrameLayout::compute(&mixed).is_err());
        let mut observers = cams(2);
        for c in &mut observers {
            c.purpose = CameraPurpose::DisplayObserver;
        }
        assert!(FrameLayout::compute(&observers).is_err());
    }

    #[test]
    fn test_commands() {
        assert_eq!(
            active_cmd(true),
            [b'D', b'l', b'o', b'+', 12, 0, 0, 0, 0x81, 0, 0, 0]
        );
        let g = gain_cmd(4, 0x60);
        assert_eq!(&g[0..4], b"Dlo+");
        assert_eq!(g[4], 18);
        assert_eq!(u16::from_le_bytes([g[8], g[9]]), 0x80);
        assert_eq!(u16::from_le_bytes([g[12], g[13]]), 6000);
        assert_eq!(u16::from_le_bytes([g[14], g[15]]), 0x60);
        assert_eq!((g[10], g[16]), (4, 4));
    }

    #[test]
    fn test_unpack_and_meta() {
        let layout = FrameLayout::compute(&cams(2)).unwrap();
        let img = image(&layout, 6000, 7);
        let xfer = transfer(&layout, &img, 1234);
        assert_eq!(xfer.len(), layout.xfer_size);

        let out = unpack_transfer(&xfer, &layout).unwrap();
        assert_eq!(out, img);
        let meta = FrameMeta::parse(&xfer, &out).unwrap();
        assert_eq!(meta.exposure, 6000);
        assert_eq!(meta.sequence, 7);
        assert_eq!(meta.timestamp_ns, 123_400);

        assert!(unpack_transfer(&xfer[..1000], &layout).is_none());
    }

    #[test]
    fn test_reader_routes_frames() {
        let bus = Arc::new(FakeBus::default());
        let mut cam = WmrCamera::open(bus.clone(), &cams(2), LevelFilter::Off).unwrap();
        let layout = cam.layout().clone();
        bus.reads
            .lock()
            .unwrap()
            .push_back(transfer(&layout, &image(&layout, 3000, 1), 10));
        bus.reads
            .lock()
            .unwrap()
            .push_back(transfer(&layout, &image(&layout, 0, 2), 20));

        let left = Arc::new(CollectSink::default());
        let right = Arc::new(CollectSink::default());
        let dark = Arc::new(CollectSink::default());
        cam.start(WmrCameraSinks {
            tracking: vec![left.clone(), right.clone()],
            controllers: Some(dark.clone()),
        })
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while dark.timestamps().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        cam.stop().unwrap();

        let l = left.take();
        let r = right.take();
        assert_eq!((l.len(), r.len()), (1, 1));
        assert_eq!((l[0].width(), l[0].height()), (640, 480));
        assert_eq!(l[0].timestamp_ns(), 1000);
        assert_eq!(l[0].row(0).unwrap()[0], 1);
        assert_eq!(r[0].row(479).unwrap()[639], 2);
        assert_eq!(dark.timestamps(), vec![2000]);

        let writes = bus.writes.lock().unwrap();
        assert_eq!(writes[0], active_cmd(false).to_vec());
        assert_eq!(writes[1], active_cmd(true).to_vec());
        assert_eq!(writes[2], gain_cmd(0, DEFAULT_GAIN).to_vec());
        assert_eq!(writes[3], gain_cmd(1, DEFAULT_GAIN).to_vec());
        assert_eq!(writes.last().unwrap(), &active_cmd(false).to_vec());
    }
}
