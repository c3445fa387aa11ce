//! Frame and IMU sinks, plus the small composable sinks used to build
//! capture graphs.
//!
//! Sinks never block the producer. A sink that wants to keep a frame
//! clones it, which holds the producer's buffer until released.

use crate::frame::{Frame, FrameNode};
use crate::thread::ThreadHelper;
use crate::types::{ImuSample, Pose};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::LevelFilter;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub trait FrameSink: Send + Sync {
    fn push_frame(&self, frame: &Frame);
}

pub trait ImuSink: Send + Sync {
    fn push_imu(&self, sample: &ImuSample);
}

/// Receiver of ground-truth poses.
pub trait PoseSink: Send + Sync {
    fn push_pose(&self, timestamp_ns: i64, pose: &Pose);
}

/// Sinks a SLAM tracker exposes to a frame server.
#[derive(Clone, Default)]
pub struct SlamSinks {
    /// Camera sinks, left first then right, then any extra cameras.
    pub cams: Vec<Arc<dyn FrameSink>>,
    pub imu: Option<Arc<dyn ImuSink>>,
    pub gt: Option<Arc<dyn PoseSink>>,
}

impl SlamSinks {
    pub fn stereo(left: Arc<dyn FrameSink>, right: Arc<dyn FrameSink>, imu: Arc<dyn ImuSink>) -> Self {
        Self {
            cams: vec![left, right],
            imu: Some(imu),
            gt: None,
        }
    }

    pub fn left(&self) -> Option<&Arc<dyn FrameSink>> {
        self.cams.first()
    }

    pub fn right(&self) -> Option<&Arc<dyn FrameSink>> {
        self.cams.get(1)
    }
}

/*
 *
 * Fan-out.
 *
 */

/// Pushes every frame to all downstream sinks in order.
pub struct SplitSink {
    sinks: Vec<Arc<dyn FrameSink>>,
}

impl SplitSink {
    pub fn new(sinks: Vec<Arc<dyn FrameSink>>) -> Self {
        Self { sinks }
    }
}

impl FrameSink for SplitSink {
    fn push_frame(&self, frame: &Frame) {
        for sink in &self.sinks {
            sink.push_frame(frame);
        }
    }
}

/// Duplicates IMU samples, e.g. to a SLAM tracker and a 3-DoF fallback.
pub struct ImuSplitSink {
    sinks: Vec<Arc<dyn ImuSink>>,
}

impl ImuSplitSink {
    pub fn new(sinks: Vec<Arc<dyn ImuSink>>) -> Self {
        Self { sinks }
    }
}

impl ImuSink for ImuSplitSink {
    fn push_imu(&self, sample: &ImuSample) {
        for sink in &self.sinks {
            sink.push_imu(sample);
        }
    }
}

/*
 *
 * Time fixing.
 *
 */

/// Rewrites timestamps so they never go backwards: `t <= last` becomes
/// `last + 1`.
pub struct ForceMonotonicSink {
    downstream: Arc<dyn FrameSink>,
    last_ns: Mutex<Option<i64>>,
}

impl ForceMonotonicSink {
    pub fn new(downstream: Arc<dyn FrameSink>) -> Self {
        Self {
            downstream,
            last_ns: Mutex::new(None),
        }
    }
}

fn force_monotonic(last: &Mutex<Option<i64>>, ts: i64) -> i64 {
    let mut last = match last.lock() {
        Ok(l) => l,
        Err(p) => p.into_inner(),
    };
    let ts = match *last {
        Some(prev) if ts <= prev => prev + 1,
        _ => ts,
    };
    *last = Some(ts);
    ts
}

impl FrameSink for ForceMonotonicSink {
    fn push_frame(&self, frame: &Frame) {
        let ts = force_monotonic(&self.last_ns, frame.timestamp_ns());
        if ts == frame.timestamp_ns() {
            self.downstream.push_frame(frame);
        } else {
            self.downstream.push_frame(&frame.with_timestamp(ts));
        }
    }
}

pub struct ImuForceMonotonicSink {
    downstream: Arc<dyn ImuSink>,
    last_ns: Mutex<Option<i64>>,
}

impl ImuForceMonotonicSink {
    pub fn new(downstream: Arc<dyn ImuSink>) -> Self {
        Self {
            downstream,
            last_ns: Mutex::new(None),
        }
    }
}

impl ImuSink for ImuForceMonotonicSink {
    fn push_imu(&self, sample: &ImuSample) {
        let mut s = *sample;
        s.timestamp_ns = force_monotonic(&self.last_ns, sample.timestamp_ns);
        self.downstream.push_imu(&s);
    }
}

/*
 *
 * Genlock.
 *
 */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left = 0,
    Right = 1,
}

struct GenlockState {
    frames: [Option<Frame>; 2],
    last_ns: Option<i64>,
}

/// Pairs left and right frames whose timestamps are within `max_diff_ns`
/// and emits both with the same (mean) timestamp.
///
/// A newer frame replaces an unpaired older frame of the same side; a
/// pair too far apart drops the older frame and keeps waiting.
pub struct GenlockSink {
    state: Mutex<GenlockState>,
    left: Arc<dyn FrameSink>,
    right: Arc<dyn FrameSink>,
    max_diff_ns: i64,
    ll: LevelFilter,
}

/// One input of a [`GenlockSink`].
pub struct GenlockInput {
    genlock: Arc<GenlockSink>,
    side: Side,
}

impl GenlockSink {
    pub fn new(
        left: Arc<dyn FrameSink>,
        right: Arc<dyn FrameSink>,
        max_diff_ns: i64,
        ll: LevelFilter,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GenlockState {
                frames: [None, None],
                last_ns: None,
            }),
            left,
            right,
            max_diff_ns,
            ll,
        })
    }

    pub fn input(self: &Arc<Self>, side: Side) -> Arc<dyn FrameSink> {
        Arc::new(GenlockInput {
            genlock: self.clone(),
            side,
        })
    }

    fn push(&self, side: Side, frame: &Frame) {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        };

        if let Some(last) = state.last_ns {
            if frame.timestamp_ns() <= last {
                ll_warn!(
                    self.ll,
                    "Genlock: dropping {:?} frame from the past ({} <= {})",
                    side,
                    frame.timestamp_ns(),
                    last
                );
                return;
            }
        }

        if state.frames[side as usize].replace(frame.clone()).is_some() {
            ll_trace!(self.ll, "Genlock: replaced unpaired {:?} frame", side);
        }

        let (l, r) = match (&state.frames[0], &state.frames[1]) {
            (Some(l), Some(r)) => (l.clone(), r.clone()),
            _ => return,
        };

        let diff = l.timestamp_ns() - r.timestamp_ns();
        if diff.abs() > self.max_diff_ns {
            ll_warn!(
                self.ll,
                "Genlock: frames {} ns apart (max {}), dropping the older one",
                diff,
                self.max_diff_ns
            );
            let older = if diff < 0 { 0 } else { 1 };
            state.frames[older] = None;
            return;
        }

        let ts = r.timestamp_ns() + diff / 2;
        state.frames = [None, None];
        state.last_ns = Some(ts);

        self.left.push_frame(&l.with_timestamp(ts));
        self.right.push_frame(&r.with_timestamp(ts));
    }
}

impl FrameSink for GenlockInput {
    fn push_frame(&self, frame: &Frame) {
        self.genlock.push(self.side, frame);
    }
}

/*
 *
 * Quirks.
 *
 */

/// Splits a side-by-side stereo frame into two frames sharing its buffer.
pub struct StereoSbsSplitSink {
    left: Arc<dyn FrameSink>,
    right: Arc<dyn FrameSink>,
    ll: LevelFilter,
}

impl StereoSbsSplitSink {
    pub fn new(left: Arc<dyn FrameSink>, right: Arc<dyn FrameSink>, ll: LevelFilter) -> Self {
        Self { left, right, ll }
    }
}

impl FrameSink for StereoSbsSplitSink {
    fn push_frame(&self, frame: &Frame) {
        let half = frame.width() / 2;
        match (frame.sub_frame(0, half), frame.sub_frame(half, half)) {
            (Some(l), Some(r)) => {
                self.left.push_frame(&l);
                self.right.push_frame(&r);
            }
            _ => ll_warn!(self.ll, "Cannot split frame {:?} side by side", frame.info().format),
        }
    }
}

/*
 *
 * Debug and queue.
 *
 */

/// Keeps the latest frame for an inspection UI. Inactive until someone
/// asks for frames, so it costs nothing by default.
#[derive(Default)]
pub struct DebugSink {
    active: AtomicBool,
    latest: Mutex<Option<Frame>>,
}

impl DebugSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
        if !active {
            if let Ok(mut latest) = self.latest.lock() {
                *latest = None;
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn latest(&self) -> Option<Frame> {
        self.latest.lock().ok().and_then(|l| l.clone())
    }
}

impl FrameSink for DebugSink {
    fn push_frame(&self, frame: &Frame) {
        if !self.is_active() {
            return;
        }
        // Never wait on the UI thread.
        if let Ok(mut latest) = self.latest.try_lock() {
            *latest = Some(frame.clone());
        }
    }
}

/// Hands frames to a worker thread so a slow consumer cannot stall the
/// producer. Holds at most one frame; newer frames are dropped while it
/// is busy.
pub struct QueueSink {
    sender: Sender<Frame>,
    thread: Mutex<ThreadHelper>,
    dropped: AtomicU64,
    ll: LevelFilter,
}

impl QueueSink {
    pub fn new(downstream: Arc<dyn FrameSink>, ll: LevelFilter) -> crate::Result<Arc<Self>> {
        let (sender, receiver) = crossbeam_channel::bounded::<Frame>(1);
        let mut thread = ThreadHelper::new();
        thread.start("sink-queue", move |flag| queue_loop(receiver, downstream, flag))?;
        Ok(Arc::new(Self {
            sender,
            thread: Mutex::new(thread),
            dropped: AtomicU64::new(0),
            ll,
        }))
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn queue_loop(receiver: Receiver<Frame>, downstream: Arc<dyn FrameSink>, flag: crate::thread::RunFlag) {
    while flag.is_running() {
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(frame) => downstream.push_frame(&frame),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
}

impl FrameSink for QueueSink {
    fn push_frame(&self, frame: &Frame) {
        if let Err(e) = self.sender.try_send(frame.clone()) {
            match e {
                TrySendError::Full(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    ll_trace!(self.ll, "Queue sink busy, dropping frame");
                }
                TrySendError::Disconnected(_) => ll_trace!(self.ll, "Queue sink stopped"),
            }
        }
    }
}

impl FrameNode for QueueSink {
    fn break_apart(&self) {
        if let Ok(mut thread) = self.thread.lock() {
            thread.stop();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::frame::{FrameFormat, FrameInfo};

    /// Records everything pushed into it.
    #[derive(Default)]
    pub(crate) struct CollectSink {
        pub frames: Mutex<Vec<Frame>>,
    }

    impl CollectSink {
        pub fn timestamps(&self) -> Vec<i64> {
            self.frames.lock().unwrap().iter().map(|f| f.timestamp_ns()).collect()
        }

        pub fn take(&self) -> Vec<Frame> {
            std::mem::take(&mut *self.frames.lock().unwrap())
        }
    }

    impl FrameSink for CollectSink {
        fn push_frame(&self, frame: &Frame) {
            self.frames.lock().unwrap().push(frame.clone());
        }
    }

    #[derive(Default)]
    pub(crate) struct CollectImu {
        pub samples: Mutex<Vec<ImuSample>>,
    }

    impl ImuSink for CollectImu {
        fn push_imu(&self, sample: &ImuSample) {
            self.samples.lock().unwrap().push(*sample);
        }
    }

    pub(crate) fn frame_at(ts: i64) -> Frame {
        let mut info = FrameInfo::packed(4, 2, FrameFormat::L8);
        info.timestamp_ns = ts;
        Frame::from_vec(info, vec![0; 8])
    }

    #[test]
    fn test_split_pushes_to_all() {
        let a = Arc::new(CollectSink::default());
        let b = Arc::new(CollectSink::default());
        let split = SplitSink::new(vec![a.clone(), b.clone()]);
        let f = frame_at(5);
        split.push_frame(&f);
        assert_eq!(a.timestamps(), vec![5]);
        assert_eq!(b.timestamps(), vec![5]);
        // Both consumers hold a reference.
        assert_eq!(f.ref_count(), 3);
    }

    #[test]
    fn test_force_monotonic() {
        let out = Arc::new(CollectSink::default());
        let sink = ForceMonotonicSink::new(out.clone());
        for ts in [10, 10, 5, 20] {
            sink.push_frame(&frame_at(ts));
        }
        assert_eq!(out.timestamps(), vec![10, 11, 12, 20]);
    }

    #[test]
    fn test_imu_force_monotonic_and_split() {
        let a = Arc::new(CollectImu::default());
        let b = Arc::new(CollectImu::default());
        let split: Arc<dyn ImuSink> = Arc::new(ImuSplitSink::new(vec![a.clone(), b.clone()]));
        let sink = ImuForceMonotonicSink::new(split);
        let mut s = ImuSample {
            timestamp_ns: 100,
            accel_m_s2: Default::default(),
            gyro_rad_secs: Default::default(),
        };
        sink.push_imu(&s);
        s.timestamp_ns = 90;
        sink.push_imu(&s);
        let ts: Vec<i64> = a.samples.lock().unwrap().iter().map(|s| s.timestamp_ns).collect();
        assert_eq!(ts, vec![100, 101]);
        assert_eq!(b.samples.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_genlock_pairs_with_equal_timestamps() {
        let l = Arc::new(CollectSink::default());
        let r = Arc::new(CollectSink::default());
        let g = GenlockSink::new(l.clone(), r.clone(), 1_000_000, LevelFilter::Off);
        let left = g.input(Side::Left);
        let right = g.input(Side::Right);

        left.push_frame(&frame_at(1_000));
        // Newer left replaces the unpaired one.
        left.push_frame(&frame_at(2_000));
        right.push_frame(&frame_at(2_400));
        assert_eq!(l.timestamps(), vec![2_200]);
        assert_eq!(r.timestamps(), vec![2_200]);

        // Too far apart: the older frame is dropped, nothing emitted.
        left.push_frame(&frame_at(10_000_000));
        right.push_frame(&frame_at(20_000_000));
        assert_eq!(l.timestamps().len(), 1);

        left.push_frame(&frame_at(20_000_000));
        assert_eq!(l.timestamps(), vec![2_200, 20_000_000]);
        assert_eq!(r.timestamps(), vec![2_200, 20_000_000]);

        // From the past.
        right.push_frame(&frame_at(5));
        left.push_frame(&frame_at(5));
        assert_eq!(l.timestamps().len(), 2);
    }

    #[test]
    fn test_sbs_split() {
        let l = Arc::new(CollectSink::default());
        let r = Arc::new(CollectSink::default());
        let sink = StereoSbsSplitSink::new(l.clone(), r.clone(), LevelFilter::Off);
        sink.push_frame(&frame_at(7));
        let lf = l.frames.lock().unwrap()[0].clone();
        let rf = r.frames.lock().unwrap()[0].clone();
        assert_eq!(lf.width(), 2);
        assert_eq!(rf.width(), 2);
        assert_eq!(rf.timestamp_ns(), 7);
    }

    #[test]
    fn test_sbs_split_skips_compressed_frame() {
        let l = Arc::new(CollectSink::default());
        let r = Arc::new(CollectSink::default());
        let sink = StereoSbsSplitSink::new(l.clone(), r.clone(), LevelFilter::Off);
        let mut info = FrameInfo::packed(8, 2, FrameFormat::Mjpeg);
        info.size = 10;
        sink.push_frame(&Frame::from_vec(info, vec![0; 10]));
        assert!(l.frames.lock().unwrap().is_empty());
        assert!(r.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn test_debug_sink_inactive_by_default() {
        let dbg = DebugSink::new();
        dbg.push_frame(&frame_at(1));
        assert!(dbg.latest().is_none());
        dbg.set_active(true);
        dbg.push_frame(&frame_at(2));
        assert_eq!(dbg.latest().map(|f| f.timestamp_ns()), Some(2));
        dbg.set_active(false);
        assert!(dbg.latest().is_none());
    }

    #[test]
    fn test_queue_sink_delivers() {
        let out = Arc::new(CollectSink::default());
        let q = QueueSink::new(out.clone(), LevelFilter::Off).unwrap();
        q.push_frame(&frame_at(1));
        for _ in 0..100 {
            if !out.timestamps().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        q.break_apart();
        assert_eq!(out.timestamps(), vec![1]);
    }
}
