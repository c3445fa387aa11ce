//! The capture-queue side of a V4L2 device.
//!
//! Format and mode queries go through [`v4l::Device`] directly. The buffer
//! queue cannot use `v4l`'s streams, because frames hold on to their buffer
//! until downstream drops them, so QBUF/DQBUF and friends are issued
//! through `v4l::v4l2::ioctl` behind [`CaptureIo`].

use super::buffers::Memory;
use super::quirks::ControlIo;
use super::Descriptor;
use crate::time::timeval_to_ns;
use std::io;
use std::os::fd::RawFd;
use std::path::Path;
use v4l::buffer::Type;
use v4l::control::{Control, Value};
use v4l::memory::Memory as BufferMemory;
use v4l::v4l2;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers, V4L2_BUF_FLAG_TIMESTAMP_MONOTONIC};
use v4l::video::Capture;
use v4l::Format;

/// A buffer the driver just filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dequeued {
    pub index: u32,
    pub bytes_used: usize,
    pub sequence: u32,
    /// Driver timestamp, when it is on the monotonic clock.
    pub timestamp_ns: Option<i64>,
}

/// Stream ioctls of a capture device.
pub trait CaptureIo: ControlIo + Send + Sync {
    /// Applies the format, returns the driver's image size.
    fn set_format(&self, desc: &Descriptor) -> io::Result<usize>;
    /// Returns how many buffers the driver granted. A count of zero frees
    /// them again.
    fn request_buffers(&self, memory: BufferMemory, count: u32) -> io::Result<u32>;
    /// `(length, mmap offset)` of one buffer.
    fn query_buffer(&self, memory: BufferMemory, index: u32) -> io::Result<(usize, u32)>;
    fn map_buffer(&self, offset: u32, len: usize) -> io::Result<Memory>;
    /// `userptr` carries `(address, length)` for user pointer buffers.
    fn queue_buffer(&self, memory: BufferMemory, index: u32, userptr: Option<(libc::c_ulong, u32)>) -> io::Result<()>;
    fn stream_on(&self) -> io::Result<()>;
    fn stream_off(&self) -> io::Result<()>;
    /// Whether a buffer became ready within `timeout_ms`.
    fn wait(&self, timeout_ms: i32) -> io::Result<bool>;
    /// `None` when nothing was ready after all.
    fn dequeue(&self, memory: BufferMemory) -> io::Result<Option<Dequeued>>;
}

pub struct V4lDevice {
    dev: v4l::Device,
}

impl V4lDevice {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            dev: v4l::Device::with_path(path)?,
        })
    }

    pub fn device(&self) -> &v4l::Device {
        &self.dev
    }

    fn fd(&self) -> RawFd {
        self.dev.handle().fd()
    }

    fn ioctl<T>(&self, request: v4l2::vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
        // SAFETY: every call site pairs a request with its argument type.
        unsafe { v4l2::ioctl(self.fd(), request, arg as *mut T as *mut std::os::raw::c_void) }
    }

    fn buffer(memory: BufferMemory, index: u32) -> v4l2_buffer {
        v4l2_buffer {
            index,
            type_: Type::VideoCapture as u32,
            memory: memory as u32,
            // SAFETY: v4l2_buffer is plain data.
            ..unsafe { std::mem::zeroed() }
        }
    }
}

impl ControlIo for V4lDevice {
    fn get_control(&self, id: u32) -> io::Result<i32> {
        match self.dev.control(id)?.value {
            Value::Integer(v) => Ok(v as i32),
            Value::Boolean(b) => Ok(b as i32),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("control {:#x} is not an integer", id),
            )),
        }
    }

    fn set_control(&self, id: u32, value: i32) -> io::Result<()> {
        self.dev.set_control(Control {
            id,
            value: Value::Integer(value as i64),
        })
    }
}

impl CaptureIo for V4lDevice {
    fn set_format(&self, desc: &Descriptor) -> io::Result<usize> {
        let fmt = Format::new(desc.stream_width, desc.stream_height, desc.pixel_format);
        let got = self.dev.set_format(&fmt)?;
        Ok(got.size as usize)
    }

    fn request_buffers(&self, memory: BufferMemory, count: u32) -> io::Result<u32> {
        let mut req = v4l2_requestbuffers {
            count,
            type_: Type::VideoCapture as u32,
            memory: memory as u32,
            // SAFETY: v4l2_requestbuffers is plain data.
            ..unsafe { std::mem::zeroed() }
        };
        self.ioctl(v4l2::vidioc::VIDIOC_REQBUFS, &mut req)?;
        Ok(req.count)
    }

    fn query_buffer(&self, memory: BufferMemory, index: u32) -> io::Result<(usize, u32)> {
        let mut buf = Self::buffer(memory, index);
        self.ioctl(v4l2::vidioc::VIDIOC_QUERYBUF, &mut buf)?;
        // SAFETY: the driver fills in `offset` for every buffer it reports.
        Ok((buf.length as usize, unsafe { buf.m.offset }))
    }

    fn map_buffer(&self, offset: u32, len: usize) -> io::Result<Memory> {
        Memory::map(self.fd(), offset, len)
    }

    fn queue_buffer(&self, memory: BufferMemory, index: u32, userptr: Option<(libc::c_ulong, u32)>) -> io::Result<()> {
        let mut buf = Self::buffer(memory, index);
        if let Some((ptr, len)) = userptr {
            buf.m.userptr = ptr;
            buf.length = len;
        }
        self.ioctl(v4l2::vidioc::VIDIOC_QBUF, &mut buf)
    }

    fn stream_on(&self) -> io::Result<()> {
        let mut typ = Type::VideoCapture as u32;
        self.ioctl(v4l2::vidioc::VIDIOC_STREAMON, &mut typ)
    }

    fn stream_off(&self) -> io::Result<()> {
        let mut typ = Type::VideoCapture as u32;
        self.ioctl(v4l2::vidioc::VIDIOC_STREAMOFF, &mut typ)
    }

    fn wait(&self, timeout_ms: i32) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd.
        match unsafe { libc::poll(&mut pfd, 1, timeout_ms) } {
            0 => Ok(false),
            n if n > 0 => Ok(true),
            _ => {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::Interrupted {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }

    fn dequeue(&self, memory: BufferMemory) -> io::Result<Option<Dequeued>> {
        let mut buf = Self::buffer(memory, 0);
        match self.ioctl(v4l2::vidioc::VIDIOC_DQBUF, &mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e),
        }
        let timestamp_ns = (buf.flags & V4L2_BUF_FLAG_TIMESTAMP_MONOTONIC != 0)
            .then(|| timeval_to_ns(buf.timestamp.tv_sec as i64, buf.timestamp.tv_usec as i64));
        Ok(Some(Dequeued {
            index: buf.index,
            bytes_used: buf.bytesused as usize,
            sequence: buf.sequence,
            timestamp_ns,
        }))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! A capture device that lives in memory and records every call.

    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct Script {
        /// Ioctl names to fail, each once.
        pub fail: Vec<&'static str>,
        pub frames: VecDeque<Dequeued>,
        pub calls: Vec<String>,
        pub controls: HashMap<u32, i32>,
        pub granted: u32,
        pub image_size: usize,
    }

    #[derive(Default)]
    pub struct FakeCapture(pub Mutex<Script>);

    impl FakeCapture {
        pub fn new(granted: u32, image_size: usize) -> Self {
            Self(Mutex::new(Script {
                granted,
                image_size,
                ..Default::default()
            }))
        }

        pub fn fail(&self, name: &'static str) {
            self.0.lock().unwrap().fail.push(name);
        }

        pub fn calls(&self) -> Vec<String> {
            self.0.lock().unwrap().calls.clone()
        }

        fn call(&self, name: &'static str, call: String) -> io::Result<()> {
            let mut s = self.0.lock().unwrap();
            s.calls.push(call);
            if let Some(i) = s.fail.iter().position(|f| *f == name) {
                s.fail.remove(i);
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
            Ok(())
        }
    }

    impl ControlIo for FakeCapture {
        fn get_control(&self, id: u32) -> io::Result<i32> {
            Ok(*self.0.lock().unwrap().controls.get(&id).unwrap_or(&0))
        }

        fn set_control(&self, id: u32, value: i32) -> io::Result<()> {
            self.call("S_CTRL", format!("S_CTRL {:#x}={}", id, value))?;
            self.0.lock().unwrap().controls.insert(id, value);
            Ok(())
        }
    }

    impl CaptureIo for FakeCapture {
        fn set_format(&self, desc: &Descriptor) -> io::Result<usize> {
            self.call("S_FMT", format!("S_FMT {}x{}", desc.stream_width, desc.stream_height))?;
            Ok(self.0.lock().unwrap().image_size)
        }

        fn request_buffers(&self, memory: BufferMemory, count: u32) -> io::Result<u32> {
            let kind = match memory {
                BufferMemory::UserPtr => "USERPTR",
                _ => "MMAP",
            };
            self.call("REQBUFS", format!("REQBUFS {} {}", kind, count))?;
            Ok(if count == 0 { 0 } else { self.0.lock().unwrap().granted })
        }

        fn query_buffer(&self, _memory: BufferMemory, index: u32) -> io::Result<(usize, u32)> {
            self.call("QUERYBUF", format!("QUERYBUF {}", index))?;
            Ok((self.0.lock().unwrap().image_size, index * 4096))
        }

        fn map_buffer(&self, _offset: u32, len: usize) -> io::Result<Memory> {
            Ok(Memory::Heap(vec![0; len]))
        }

        fn queue_buffer(&self, _memory: BufferMemory, index: u32, _userptr: Option<(libc::c_ulong, u32)>) -> io::Result<()> {
            self.call("QBUF", format!("QBUF {}", index))
        }

        fn stream_on(&self) -> io::Result<()> {
            self.call("STREAMON", "STREAMON".into())
        }

        fn stream_off(&self) -> io::Result<()> {
            self.call("STREAMOFF", "STREAMOFF".into())
        }

        fn wait(&self, timeout_ms: i32) -> io::Result<bool> {
            if self.0.lock().unwrap().frames.is_empty() {
                std::thread::sleep(std::time::Duration::from_millis(timeout_ms.clamp(1, 5) as u64));
                return Ok(false);
            }
            Ok(true)
        }

        fn dequeue(&self, _memory: BufferMemory) -> io::Result<Option<Dequeued>> {
            Ok(self.0.lock().unwrap().frames.pop_front())
        }
    }
}
