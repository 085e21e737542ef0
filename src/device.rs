use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::{io, mem, time::Duration};

use crate::buffer::{self, Dequeued, Placement};
use crate::capability::Capabilities;
use crate::error::{Error, Result};
use crate::format::{Description, Format};
use crate::memory::Memory;
use crate::timestamp::Timestamp;
use crate::v4l2;
use crate::v4l_sys::*;

/// Operations of a video capture device
///
/// Every other component talks to the device through this trait. [`Handle`] implements it on
/// top of the V4L2 ioctls; errors are the raw OS errors (`EAGAIN` shows up as
/// [`io::ErrorKind::WouldBlock`], `EINVAL` as [`io::ErrorKind::InvalidInput`]).
pub trait Device {
    /// VIDIOC_QUERYCAP
    fn query_caps(&self) -> io::Result<Capabilities>;

    /// VIDIOC_ENUM_FMT for a single index
    fn enum_format(&self, index: u32) -> io::Result<Description>;

    /// VIDIOC_G_FMT
    fn format(&self) -> io::Result<Format>;

    /// VIDIOC_S_FMT, returns the format the driver settled on
    fn set_format(&mut self, fmt: &Format) -> io::Result<Format>;

    /// VIDIOC_REQBUFS, returns the number of buffers the driver granted
    fn request_buffers(&self, count: u32) -> io::Result<u32>;

    /// VIDIOC_QUERYBUF
    fn query_buffer(&self, index: u32) -> io::Result<Placement>;

    /// Maps a queried buffer into the address space (shared, read-write)
    fn map(&self, placement: &Placement) -> io::Result<NonNull<u8>>;

    /// Unmaps a region returned by [`Device::map`]
    ///
    /// # Safety
    ///
    /// `ptr` and `length` must describe exactly one live mapping of this device. The region must
    /// not be accessed afterwards.
    unsafe fn unmap(&self, ptr: NonNull<u8>, length: usize) -> io::Result<()>;

    /// VIDIOC_QBUF
    fn queue_buffer(&self, index: u32) -> io::Result<()>;

    /// VIDIOC_DQBUF
    fn dequeue_buffer(&self) -> io::Result<Dequeued>;

    /// VIDIOC_STREAMON
    fn stream_on(&self) -> io::Result<()>;

    /// VIDIOC_STREAMOFF
    fn stream_off(&self) -> io::Result<()>;

    /// Blocks until a buffer can be dequeued or the timeout expires
    fn wait(&self, timeout: Option<Duration>) -> io::Result<bool>;
}

/// Owned connection to a video4linux device node
///
/// The file descriptor is closed exactly once: either explicitly through [`Handle::close`],
/// which reports errors, or when the handle is dropped.
pub struct Handle {
    /// raw OS file descriptor, -1 once closed
    fd: std::os::raw::c_int,
    /// Device node path
    path: PathBuf,
}

impl Handle {
    /// Opens a device node for streaming
    ///
    /// The node is opened read-write and non-blocking, so dequeueing reports an empty queue
    /// instead of sleeping.
    ///
    /// # Arguments
    ///
    /// * `path` - Path (e.g. "/dev/video0")
    ///
    /// # Example
    ///
    /// ```
    /// use v4lcap::Handle;
    /// let dev = Handle::open("/dev/video0");
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let fd = v4l2::open(path, libc::O_RDWR | libc::O_NONBLOCK).map_err(|source| {
            Error::OpenFailed {
                path: path.to_path_buf(),
                source,
            }
        })?;

        debug!("opened {} (fd {})", path.display(), fd);
        Ok(Handle {
            fd,
            path: path.to_path_buf(),
        })
    }

    /// Closes the device node
    ///
    /// Consumes the handle, so a closed device cannot be used again. Arenas and streams borrow
    /// the handle, which makes it impossible to close while buffers are mapped.
    pub fn close(mut self) -> Result<()> {
        let fd = mem::replace(&mut self.fd, -1);
        v4l2::close(fd).map_err(Error::CloseFailed)?;
        debug!("closed {}", self.path.display());
        Ok(())
    }

    /// Returns the raw fd of the device
    pub fn fd(&self) -> std::os::raw::c_int {
        self.fd
    }

    /// Returns the path the device was opened with
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn buffer(&self, index: u32) -> v4l2_buffer {
        v4l2_buffer {
            index,
            type_: buffer::Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.fd == -1 {
            return;
        }

        if let Err(e) = v4l2::close(self.fd) {
            warn!("failed to close {}: {}", self.path.display(), e);
        }
    }
}

impl Device for Handle {
    fn query_caps(&self) -> io::Result<Capabilities> {
        unsafe {
            let mut v4l2_caps: v4l2_capability = mem::zeroed();
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_QUERYCAP,
                &mut v4l2_caps as *mut _ as *mut std::os::raw::c_void,
            )?;

            Ok(Capabilities::from(v4l2_caps))
        }
    }

    fn enum_format(&self, index: u32) -> io::Result<Description> {
        let mut v4l2_fmt = v4l2_fmtdesc {
            index,
            type_: buffer::Type::VideoCapture as u32,
            ..unsafe { mem::zeroed() }
        };

        unsafe {
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_ENUM_FMT,
                &mut v4l2_fmt as *mut _ as *mut std::os::raw::c_void,
            )?;
        }

        Ok(Description::from(v4l2_fmt))
    }

    fn format(&self) -> io::Result<Format> {
        unsafe {
            let mut v4l2_fmt = v4l2_format {
                type_: buffer::Type::VideoCapture as u32,
                ..mem::zeroed()
            };
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_G_FMT,
                &mut v4l2_fmt as *mut _ as *mut std::os::raw::c_void,
            )?;

            Ok(Format::from(v4l2_fmt.fmt.pix))
        }
    }

    fn set_format(&mut self, fmt: &Format) -> io::Result<Format> {
        unsafe {
            let mut v4l2_fmt = v4l2_format {
                type_: buffer::Type::VideoCapture as u32,
                ..mem::zeroed()
            };
            v4l2_fmt.fmt.pix = (*fmt).into();
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_S_FMT,
                &mut v4l2_fmt as *mut _ as *mut std::os::raw::c_void,
            )?;

            // the driver writes back what it actually applied
            Ok(Format::from(v4l2_fmt.fmt.pix))
        }
    }

    fn request_buffers(&self, count: u32) -> io::Result<u32> {
        let mut v4l2_reqbufs = v4l2_requestbuffers {
            count,
            type_: buffer::Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        };
        unsafe {
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_REQBUFS,
                &mut v4l2_reqbufs as *mut _ as *mut std::os::raw::c_void,
            )?;
        }

        Ok(v4l2_reqbufs.count)
    }

    fn query_buffer(&self, index: u32) -> io::Result<Placement> {
        let mut v4l2_buf = self.buffer(index);
        unsafe {
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_QUERYBUF,
                &mut v4l2_buf as *mut _ as *mut std::os::raw::c_void,
            )?;

            Ok(Placement {
                index,
                length: v4l2_buf.length,
                offset: v4l2_buf.m.offset,
            })
        }
    }

    fn map(&self, placement: &Placement) -> io::Result<NonNull<u8>> {
        let ptr = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                placement.length as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                placement.offset as libc::off_t,
            )?
        };

        NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned NULL"))
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, length: usize) -> io::Result<()> {
        v4l2::munmap(ptr.as_ptr() as *mut std::os::raw::c_void, length)
    }

    fn queue_buffer(&self, index: u32) -> io::Result<()> {
        let mut v4l2_buf = self.buffer(index);
        unsafe {
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_QBUF,
                &mut v4l2_buf as *mut _ as *mut std::os::raw::c_void,
            )
        }
    }

    fn dequeue_buffer(&self) -> io::Result<Dequeued> {
        let mut v4l2_buf = self.buffer(0);
        unsafe {
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_DQBUF,
                &mut v4l2_buf as *mut _ as *mut std::os::raw::c_void,
            )?;
        }

        Ok(Dequeued {
            index: v4l2_buf.index,
            bytesused: v4l2_buf.bytesused,
            flags: buffer::Flags::from(v4l2_buf.flags),
            timestamp: Timestamp::from(v4l2_buf.timestamp),
            sequence: v4l2_buf.sequence,
        })
    }

    fn stream_on(&self) -> io::Result<()> {
        let mut typ = buffer::Type::VideoCapture as u32;
        unsafe {
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_STREAMON,
                &mut typ as *mut _ as *mut std::os::raw::c_void,
            )
        }
    }

    fn stream_off(&self) -> io::Result<()> {
        let mut typ = buffer::Type::VideoCapture as u32;
        unsafe {
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_STREAMOFF,
                &mut typ as *mut _ as *mut std::os::raw::c_void,
            )
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> io::Result<bool> {
        v4l2::poll(self.fd, timeout)
    }
}
