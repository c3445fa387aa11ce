//! Capture buffers shared between the kernel and downstream frames.
//!
//! The arena owns the memory of every buffer. A dequeued buffer is lent out
//! as an [`ArenaBuffer`] that keeps the arena alive; dropping the last
//! frame that points at it hands the index back and, while streaming,
//! queues it to the kernel again.

use super::device::CaptureIo;
use crate::frame::FrameStorage;
use log::LevelFilter;
use std::alloc::Layout;
use std::io;
use std::os::fd::RawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use v4l::memory::Memory as BufferMemory;

pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

pub fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Backing memory of one capture buffer.
pub enum Memory {
    /// Page-aligned heap allocation handed to the driver as a user pointer.
    Userptr { ptr: NonNull<u8>, layout: Layout },
    /// Driver memory mapped read-only into our address space.
    Mmap { ptr: NonNull<u8>, len: usize },
    #[cfg(test)]
    Heap(Vec<u8>),
}

// SAFETY: the memory is only read through shared slices while the buffer is
// dequeued, and freed once in `Drop`.
unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

impl Memory {
    pub fn alloc_userptr(len: usize) -> io::Result<Memory> {
        let page = page_size();
        let layout = Layout::from_size_align(align_up(len.max(1), page), page)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        Ok(Memory::Userptr { ptr, layout })
    }

    pub fn map(fd: RawFd, offset: u32, len: usize) -> io::Result<Memory> {
        // SAFETY: mapping a region the driver reported through QUERYBUF.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::from(io::ErrorKind::InvalidData))?;
        Ok(Memory::Mmap { ptr, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            // SAFETY: both pointers are valid for their length until Drop.
            Memory::Userptr { ptr, layout } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), layout.size())
            },
            Memory::Mmap { ptr, len } => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), *len) },
            #[cfg(test)]
            Memory::Heap(v) => v,
        }
    }

    pub fn userptr(&self) -> libc::c_ulong {
        self.as_slice().as_ptr() as libc::c_ulong
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        match self {
            // SAFETY: allocated in `alloc_userptr` with this layout.
            Memory::Userptr { ptr, layout } => unsafe { std::alloc::dealloc(ptr.as_ptr(), *layout) },
            // SAFETY: mapped in `map` with this length.
            Memory::Mmap { ptr, len } => unsafe {
                libc::munmap(ptr.as_ptr() as *mut libc::c_void, *len);
            },
            #[cfg(test)]
            Memory::Heap(_) => {}
        }
    }
}

/// Returns a buffer index to the capture queue.
pub trait Requeue: Send + Sync {
    fn requeue(&self, index: u32) -> io::Result<()>;
}

/// QBUF through the capture device.
pub struct DeviceQueue {
    pub io: Arc<dyn CaptureIo>,
    pub memory: BufferMemory,
    /// `(userptr, length)` per index.
    pub slots: Vec<(libc::c_ulong, u32)>,
}

impl Requeue for DeviceQueue {
    fn requeue(&self, index: u32) -> io::Result<()> {
        let userptr = match self.memory {
            BufferMemory::UserPtr => self.slots.get(index as usize).copied(),
            _ => None,
        };
        self.io.queue_buffer(self.memory, index, userptr)
    }
}

pub struct BufferArena {
    memory: Vec<Memory>,
    queue: Box<dyn Requeue>,
    streaming: AtomicBool,
    queued: AtomicUsize,
    ll: LevelFilter,
}

impl BufferArena {
    pub fn new(memory: Vec<Memory>, queue: Box<dyn Requeue>, ll: LevelFilter) -> Arc<Self> {
        Arc::new(Self {
            memory,
            queue,
            streaming: AtomicBool::new(false),
            queued: AtomicUsize::new(0),
            ll,
        })
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    pub fn memory(&self, index: usize) -> Option<&Memory> {
        self.memory.get(index)
    }

    /// Queues every buffer and marks the arena as streaming.
    pub fn queue_all(&self) -> io::Result<()> {
        for i in 0..self.memory.len() {
            self.queue.requeue(i as u32)?;
            self.queued.fetch_add(1, Ordering::AcqRel);
        }
        self.streaming.store(true, Ordering::Release);
        Ok(())
    }

    /// After this, released buffers stay with us.
    pub fn stop(&self) {
        self.streaming.store(false, Ordering::Release);
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    /// Buffers currently owned by the kernel.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Takes ownership of a buffer the kernel just returned.
    ///
    /// Returns `None`, and hands the buffer straight back, when it was the
    /// last one queued: every other buffer is held downstream and keeping
    /// this one too would starve the capture.
    pub fn dequeued(self: &Arc<Self>, index: u32, start: usize, end: usize) -> Option<ArenaBuffer> {
        let left = self.queued.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        let buffer = ArenaBuffer {
            arena: self.clone(),
            index,
            start,
            end,
        };
        if left == 0 && self.memory.len() > 1 {
            ll_warn!(self.ll, "All capture buffers held downstream, dropping frame");
            return None;
        }
        Some(buffer)
    }

    fn release(&self, index: u32) {
        if !self.is_streaming() {
            return;
        }
        match self.queue.requeue(index) {
            Ok(()) => {
                self.queued.fetch_add(1, Ordering::AcqRel);
            }
            Err(e) => {
                ll_error!(self.ll, "Failed to requeue buffer {}: {}", index, e);
            }
        }
    }
}

/// One dequeued buffer, lent to frames.
pub struct ArenaBuffer {
    arena: Arc<BufferArena>,
    index: u32,
    start: usize,
    end: usize,
}

impl ArenaBuffer {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl FrameStorage for ArenaBuffer {
    fn bytes(&self) -> &[u8] {
        match self.arena.memory(self.index as usize) {
            Some(mem) => {
                let data = mem.as_slice();
                let end = self.end.min(data.len());
                &data[self.start.min(end)..end]
            }
            None => &[],
        }
    }
}

impl Drop for ArenaBuffer {
    fn drop(&mut self) {
        self.arena.release(self.index);
    }
}
