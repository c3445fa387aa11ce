//! Reference-counted video frames and the frame context that owns the
//! nodes of a capture graph.
//!
//! A [`Frame`] never owns its pixels directly: it points into a
//! [`FrameStorage`] shared through an `Arc`. Cloning a frame bumps the
//! count; when the last clone goes away the storage is dropped, which is
//! where producers return the buffer to the kernel or SDK.

use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameFormat {
    R8G8B8,
    L8,
    Yuyv422,
    Uyvy422,
    Mjpeg,
}

impl FrameFormat {
    /// Bytes per pixel for packed formats, `None` for compressed ones.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            FrameFormat::R8G8B8 => Some(3),
            FrameFormat::L8 => Some(1),
            FrameFormat::Yuyv422 | FrameFormat::Uyvy422 => Some(2),
            FrameFormat::Mjpeg => None,
        }
    }

    /// Stride and size of a tightly packed image.
    pub fn size_for_dimensions(self, width: u32, height: u32) -> Option<(usize, usize)> {
        let bpp = self.bytes_per_pixel()?;
        let stride = width as usize * bpp;
        Some((stride, stride * height as usize))
    }
}

/// How two views are packed into one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StereoFormat {
    #[default]
    None,
    SideBySide,
    OverUnder,
}

/// Owner of the memory a frame points at.
///
/// Implementors release the underlying buffer in their `Drop`.
pub trait FrameStorage: Send + Sync {
    fn bytes(&self) -> &[u8];
}

impl FrameStorage for Vec<u8> {
    fn bytes(&self) -> &[u8] {
        self
    }
}

/// Metadata carried by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub size: usize,
    pub format: FrameFormat,
    pub stereo_format: StereoFormat,
    pub timestamp_ns: i64,
    pub source_timestamp_ns: i64,
    pub source_sequence: u64,
    pub source_id: u64,
}

impl FrameInfo {
    /// Packed layout for the given format; compressed formats get stride 0
    /// and must set `size` themselves.
    pub fn packed(width: u32, height: u32, format: FrameFormat) -> Self {
        let (stride, size) = format.size_for_dimensions(width, height).unwrap_or((0, 0));
        Self {
            width,
            height,
            stride,
            size,
            format,
            stereo_format: StereoFormat::None,
            timestamp_ns: 0,
            source_timestamp_ns: 0,
            source_sequence: 0,
            source_id: 0,
        }
    }
}

#[derive(Clone)]
pub struct Frame {
    info: FrameInfo,
    offset: usize,
    storage: Arc<dyn FrameStorage>,
}

impl Frame {
    pub fn new(info: FrameInfo, storage: Arc<dyn FrameStorage>) -> Self {
        Self {
            info,
            offset: 0,
            storage,
        }
    }

    /// Frame backed by a heap copy, for producers that cannot lend memory.
    pub fn from_vec(info: FrameInfo, data: Vec<u8>) -> Self {
        Self::new(info, Arc::new(data))
    }

    pub fn info(&self) -> &FrameInfo {
        &self.info
    }

    pub fn width(&self) -> u32 {
        self.info.width
    }

    pub fn height(&self) -> u32 {
        self.info.height
    }

    pub fn timestamp_ns(&self) -> i64 {
        self.info.timestamp_ns
    }

    pub fn data(&self) -> &[u8] {
        let bytes = self.storage.bytes();
        let start = self.offset.min(bytes.len());
        let end = (self.offset + self.info.size).min(bytes.len());
        &bytes[start..end]
    }

    /// Number of live handles to the underlying buffer.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.storage)
    }

    /// Same pixels with a different timestamp. Shares the buffer.
    pub fn with_timestamp(&self, timestamp_ns: i64) -> Frame {
        let mut f = self.clone();
        f.info.timestamp_ns = timestamp_ns;
        f
    }

    /// A horizontal slice of this frame, sharing the buffer.
    pub fn sub_frame(&self, x_px: u32, width: u32) -> Option<Frame> {
        self.sub_region(x_px, 0, width, self.info.height)
    }

    /// A rectangle of this frame, sharing the buffer.
    pub fn sub_region(&self, x_px: u32, y_px: u32, width: u32, height: u32) -> Option<Frame> {
        let bpp = self.info.format.bytes_per_pixel()?;
        let past_x = x_px.checked_add(width).map_or(true, |e| e > self.info.width);
        let past_y = y_px.checked_add(height).map_or(true, |e| e > self.info.height);
        if past_x || past_y || height == 0 {
            return None;
        }
        let mut f = self.clone();
        f.offset = self.offset + y_px as usize * self.info.stride + x_px as usize * bpp;
        f.info.width = width;
        f.info.height = height;
        f.info.size = self.info.stride * (height as usize - 1) + width as usize * bpp;
        f.info.stereo_format = StereoFormat::None;
        Some(f)
    }

    /// One row of pixels, honouring the stride.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        let bpp = self.info.format.bytes_per_pixel()?;
        if y >= self.info.height {
            return None;
        }
        let data = self.data();
        let start = y as usize * self.info.stride;
        let end = start + self.info.width as usize * bpp;
        data.get(start..end)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("info", &self.info)
            .field("offset", &self.offset)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// A participant in a capture graph that must be torn down in two phases.
pub trait FrameNode: Send + Sync {
    /// Stop producing: join threads, stop streams. May still be pushed to.
    fn break_apart(&self);

    /// Free owned resources. Must not touch other nodes.
    fn destroy(&self) {}
}

/// Owns the nodes of one capture graph.
///
/// Teardown calls `break_apart` on every node before any `destroy`, so no
/// producer can push into a node that has already been freed.
#[derive(Default)]
pub struct FrameContext {
    nodes: Mutex<Vec<Arc<dyn FrameNode>>>,
}

impl FrameContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, node: Arc<dyn FrameNode>) {
        if let Ok(mut nodes) = self.nodes.lock() {
            nodes.push(node);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().map(|n| n.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn destroy(&self) {
        let nodes = match self.nodes.lock() {
            Ok(mut nodes) => std::mem::take(&mut *nodes),
            Err(_) => return,
        };

        for node in &nodes {
            node.break_apart();
        }
        for node in &nodes {
            node.destroy();
        }
    }
}

impl Drop for FrameContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStorage {
        data: Vec<u8>,
        released: Arc<AtomicUsize>,
    }

    impl FrameStorage for CountingStorage {
        fn bytes(&self) -> &[u8] {
            &self.data
        }
    }

    impl Drop for CountingStorage {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_release_runs_once_after_last_ref() {
        let released = Arc::new(AtomicUsize::new(0));
        let storage = Arc::new(CountingStorage {
            data: vec![0; 16],
            released: released.clone(),
        });
        let frame = Frame::new(FrameInfo::packed(4, 4, FrameFormat::L8), storage);
        let a = frame.clone();
        let b = frame.with_timestamp(42);
        assert_eq!(frame.ref_count(), 3);
        drop(frame);
        drop(a);
        assert_eq!(released.load(Ordering::SeqCst), 0);
        assert_eq!(b.timestamp_ns(), 42);
        drop(b);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sub_frame_rows() {
        // 4x2 L8, left half and right half.
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let frame = Frame::from_vec(FrameInfo::packed(4, 2, FrameFormat::L8), data);
        let right = frame.sub_frame(2, 2).unwrap();
        assert_eq!(right.row(0), Some(&[3u8, 4][..]));
        assert_eq!(right.row(1), Some(&[7u8, 8][..]));
        assert!(frame.sub_frame(3, 2).is_none());
    }

    #[test]
    fn test_sub_region_rejects_wrapping_bounds() {
        let frame = Frame::from_vec(FrameInfo::packed(4, 2, FrameFormat::L8), vec![0; 8]);
        assert!(frame.sub_region(1, 0, u32::MAX, 1).is_none());
        assert!(frame.sub_region(0, 1, 1, u32::MAX).is_none());
        assert!(frame.sub_region(u32::MAX, u32::MAX, 1, 1).is_none());
        assert!(frame.sub_region(3, 1, 1, 1).is_some());
    }

    #[test]
    fn test_packed_sizes() {
        let info = FrameInfo::packed(640, 480, FrameFormat::Yuyv422);
        assert_eq!(info.stride, 1280);
        assert_eq!(info.size, 1280 * 480);
        assert_eq!(FrameFormat::Mjpeg.size_for_dimensions(10, 10), None);
    }

    struct OrderNode {
        id: usize,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl FrameNode for OrderNode {
        fn break_apart(&self) {
            self.log.lock().unwrap().push(format!("break{}", self.id));
        }
        fn destroy(&self) {
            self.log.lock().unwrap().push(format!("destroy{}", self.id));
        }
    }

    #[test]
    fn test_context_breaks_all_before_destroy() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let ctx = FrameContext::new();
        for id in 0..2 {
            ctx.add(Arc::new(OrderNode {
                id,
                log: log.clone(),
            }));
        }
        ctx.destroy();
        assert!(ctx.is_empty());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["break0", "break1", "destroy0", "destroy1"]
        );
        // Second teardown is a no-op.
        ctx.destroy();
        assert_eq!(log.lock().unwrap().len(), 4);
    }
}
