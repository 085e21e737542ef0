//! In-memory device for exercising the capture core without hardware
//!
//! [`MockDevice`] behaves like a well-mannered capture driver: buffers are plain heap
//! allocations handed out through [`Device::map`], queued buffers are filled on demand and the
//! usual errno values are reported for misuse. Faults can be injected at every step.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::ptr::{self, NonNull};
use std::{io, time::Duration};

use crate::buffer::{Dequeued, Flags as BufferFlags, Placement};
use crate::capability::{Capabilities, Flags};
use crate::device::Device;
use crate::format::{description, Description, FieldOrder, Format, FourCC};
use crate::timestamp::Timestamp;

/// Buffers granted when nothing else was configured
const MAX_BUFFERS: u32 = 32;

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

struct Region {
    ptr: NonNull<u8>,
    len: usize,
}

#[derive(Default)]
struct Driver {
    /// buffers handed out by the last REQBUFS
    allocated: u32,
    /// live mappings by buffer index
    mappings: BTreeMap<u32, Region>,
    unmap_calls: usize,
    unmapped_lengths: Vec<usize>,
    /// queued buffers waiting to be filled
    incoming: VecDeque<u32>,
    /// filled buffers waiting to be dequeued
    done: VecDeque<Dequeued>,
    streaming: bool,
    sequence: u32,
}

impl Driver {
    fn owns(&self, index: u32) -> bool {
        self.incoming.contains(&index) || self.done.iter().any(|buf| buf.index == index)
    }

    fn fill_next(&mut self, payload: &[u8]) -> Option<u32> {
        let index = self.incoming.pop_front()?;
        let region = self.mappings.get(&index)?;

        let used = payload.len().min(region.len);
        unsafe {
            ptr::copy_nonoverlapping(payload.as_ptr(), region.ptr.as_ptr(), used);
        }

        let sequence = self.sequence;
        self.sequence += 1;
        self.done.push_back(Dequeued {
            index,
            bytesused: used as u32,
            flags: BufferFlags::MAPPED | BufferFlags::DONE | BufferFlags::TIMESTAMP_MONOTONIC,
            timestamp: Timestamp::new(
                i64::from(sequence / 30),
                i64::from(sequence % 30) * 33_333,
            ),
            sequence,
        });
        Some(index)
    }
}

/// Software stand-in for a capture device
///
/// Configure it with the builder methods, then hand it to the capture core. Inspection methods
/// tell what the core did to it.
pub struct MockDevice {
    caps: Capabilities,
    formats: Vec<FourCC>,
    frame_sizes: Vec<(u32, u32)>,
    format: Format,
    max_buffers: Cell<u32>,
    auto_frames: Option<Vec<u8>>,

    fail_query: bool,
    fail_set_format: bool,
    fail_map_at: Option<u32>,
    fail_queue_at: Cell<Option<u32>>,
    fail_unmap_at: Cell<Option<u32>>,
    fail_dequeue: Cell<bool>,
    fail_stream_on: bool,
    fail_stream_off: Option<i32>,

    driver: RefCell<Driver>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// A 640x480 JPEG streaming capture device
    pub fn new() -> Self {
        let jpeg = FourCC::new(b"JPEG");
        let mut dev = MockDevice {
            caps: Capabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus: "mock:0".to_owned(),
                version: (1, 0, 0),
                capabilities: Flags::VIDEO_CAPTURE | Flags::STREAMING,
            },
            formats: vec![jpeg],
            frame_sizes: Vec::new(),
            format: Format::new(0, 0, jpeg),
            max_buffers: Cell::new(MAX_BUFFERS),
            auto_frames: None,
            fail_query: false,
            fail_set_format: false,
            fail_map_at: None,
            fail_queue_at: Cell::new(None),
            fail_unmap_at: Cell::new(None),
            fail_dequeue: Cell::new(false),
            fail_stream_on: false,
            fail_stream_off: None,
            driver: RefCell::new(Driver::default()),
        };
        dev.format = dev.negotiate(&Format::new(640, 480, jpeg));
        dev
    }

    /// Capability flags reported by the device
    pub fn with_capabilities(mut self, flags: Flags) -> Self {
        self.caps.capabilities = flags;
        self
    }

    /// Pixel formats reported by enumeration, in order
    pub fn with_formats(mut self, fourccs: &[&[u8; 4]]) -> Self {
        self.formats = fourccs.iter().map(|code| FourCC::new(code)).collect();
        self
    }

    /// Restricts the geometries the device accepts; requests snap to the closest one
    pub fn with_frame_sizes(mut self, sizes: &[(u32, u32)]) -> Self {
        self.frame_sizes = sizes.to_vec();
        self
    }

    /// Upper bound for the number of buffers granted
    pub fn with_max_buffers(self, count: u32) -> Self {
        self.max_buffers.set(count);
        self
    }

    /// Fills a queued buffer with `payload` whenever the application dequeues
    pub fn with_auto_frames(mut self, payload: &[u8]) -> Self {
        self.auto_frames = Some(payload.to_vec());
        self
    }

    /// Capability and format queries fail with EIO
    pub fn fail_query(mut self) -> Self {
        self.fail_query = true;
        self
    }

    /// Every format is rejected with EINVAL
    pub fn fail_set_format(mut self) -> Self {
        self.fail_set_format = true;
        self
    }

    /// Mapping the buffer with the given index fails with ENOMEM
    pub fn fail_map_at(mut self, index: u32) -> Self {
        self.fail_map_at = Some(index);
        self
    }

    /// Queueing the buffer with the given index fails with EIO
    pub fn fail_queue_at(self, index: u32) -> Self {
        self.fail_queue_at.set(Some(index));
        self
    }

    /// STREAMON fails with EIO
    pub fn fail_stream_on(mut self) -> Self {
        self.fail_stream_on = true;
        self
    }

    /// STREAMOFF fails with the given errno; streaming stops nonetheless
    pub fn fail_stream_off(mut self, code: i32) -> Self {
        self.fail_stream_off = Some(code);
        self
    }

    /// Upper bound for the number of buffers granted by later requests
    pub fn set_max_buffers(&self, count: u32) {
        self.max_buffers.set(count);
    }

    /// Queueing the buffer with the given index fails with EIO, `None` clears the fault
    pub fn set_fail_queue_at(&self, index: Option<u32>) {
        self.fail_queue_at.set(index);
    }

    /// Unmapping the buffer with the given index fails with EINVAL; the region stays mapped
    pub fn set_fail_unmap_at(&self, index: Option<u32>) {
        self.fail_unmap_at.set(index);
    }

    /// Dequeueing fails with EIO
    pub fn set_fail_dequeue(&self, fail: bool) {
        self.fail_dequeue.set(fail);
    }

    /// Fills the oldest queued buffer, returns its index if one was queued
    pub fn complete_frame(&self, payload: &[u8]) -> Option<u32> {
        let mut driver = self.driver.borrow_mut();
        if !driver.streaming {
            return None;
        }
        driver.fill_next(payload)
    }

    /// Number of regions currently mapped
    pub fn live_mappings(&self) -> usize {
        self.driver.borrow().mappings.len()
    }

    /// Number of unmap calls, failed ones included
    pub fn unmap_calls(&self) -> usize {
        self.driver.borrow().unmap_calls
    }

    /// Lengths passed to unmap, in call order
    pub fn unmapped_lengths(&self) -> Vec<usize> {
        self.driver.borrow().unmapped_lengths.clone()
    }

    /// Indices of the buffers waiting to be filled, in queue order
    pub fn queued(&self) -> Vec<u32> {
        self.driver.borrow().incoming.iter().copied().collect()
    }

    /// Number of buffers granted by the last request
    pub fn allocated(&self) -> u32 {
        self.driver.borrow().allocated
    }

    /// Whether STREAMON was issued and not yet undone
    pub fn is_streaming(&self) -> bool {
        self.driver.borrow().streaming
    }

    fn negotiate(&self, request: &Format) -> Format {
        let (width, height) = self
            .frame_sizes
            .iter()
            .copied()
            .min_by_key(|&(w, h)| {
                (i64::from(w) - i64::from(request.width)).abs()
                    + (i64::from(h) - i64::from(request.height)).abs()
            })
            .unwrap_or((request.width, request.height));

        let fourcc = if self.formats.contains(&request.fourcc) {
            request.fourcc
        } else {
            self.formats.first().copied().unwrap_or(request.fourcc)
        };

        Format {
            width,
            height,
            fourcc,
            field_order: match request.field_order {
                FieldOrder::Any => FieldOrder::Progressive,
                order => order,
            },
            stride: width * 2,
            size: width * height * 2,
        }
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        let driver = self.driver.get_mut();
        for (_, region) in std::mem::take(&mut driver.mappings) {
            unsafe { free(region) };
        }
    }
}

unsafe fn free(region: Region) {
    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
        region.ptr.as_ptr(),
        region.len,
    )));
}

impl Device for MockDevice {
    fn query_caps(&self) -> io::Result<Capabilities> {
        if self.fail_query {
            return Err(errno(libc::EIO));
        }
        Ok(self.caps.clone())
    }

    fn enum_format(&self, index: u32) -> io::Result<Description> {
        if self.fail_query {
            return Err(errno(libc::EIO));
        }

        let fourcc = *self
            .formats
            .get(index as usize)
            .ok_or_else(|| errno(libc::EINVAL))?;
        let flags = match &fourcc.repr {
            b"JPEG" | b"MJPG" => description::Flags::COMPRESSED,
            _ => description::Flags::empty(),
        };

        Ok(Description {
            index,
            typ: crate::buffer::Type::VideoCapture as u32,
            flags,
            description: format!("Mock {}", fourcc),
            fourcc,
        })
    }

    fn format(&self) -> io::Result<Format> {
        if self.fail_query {
            return Err(errno(libc::EIO));
        }
        Ok(self.format)
    }

    fn set_format(&mut self, fmt: &Format) -> io::Result<Format> {
        if self.fail_set_format {
            return Err(errno(libc::EINVAL));
        }
        if self.driver.get_mut().allocated > 0 {
            return Err(errno(libc::EBUSY));
        }

        self.format = self.negotiate(fmt);
        Ok(self.format)
    }

    fn request_buffers(&self, count: u32) -> io::Result<u32> {
        let mut driver = self.driver.borrow_mut();
        if driver.streaming {
            return Err(errno(libc::EBUSY));
        }

        driver.incoming.clear();
        driver.done.clear();
        driver.allocated = count.min(self.max_buffers.get());
        Ok(driver.allocated)
    }

    fn query_buffer(&self, index: u32) -> io::Result<Placement> {
        if index >= self.driver.borrow().allocated {
            return Err(errno(libc::EINVAL));
        }

        Ok(Placement {
            index,
            length: self.format.size,
            offset: index * self.format.size,
        })
    }

    fn map(&self, placement: &Placement) -> io::Result<NonNull<u8>> {
        if self.fail_map_at == Some(placement.index) {
            return Err(errno(libc::ENOMEM));
        }

        let mut driver = self.driver.borrow_mut();
        if placement.index >= driver.allocated || driver.mappings.contains_key(&placement.index) {
            return Err(errno(libc::EINVAL));
        }

        let len = placement.length as usize;
        let raw = Box::into_raw(vec![0u8; len].into_boxed_slice()) as *mut u8;
        let ptr = NonNull::new(raw).ok_or_else(|| errno(libc::ENOMEM))?;
        driver.mappings.insert(placement.index, Region { ptr, len });
        Ok(ptr)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, length: usize) -> io::Result<()> {
        let mut driver = self.driver.borrow_mut();
        driver.unmap_calls += 1;
        driver.unmapped_lengths.push(length);

        let index = driver
            .mappings
            .iter()
            .find(|(_, region)| region.ptr == ptr && region.len == length)
            .map(|(&index, _)| index)
            .ok_or_else(|| errno(libc::EINVAL))?;
        if self.fail_unmap_at.get() == Some(index) {
            return Err(errno(libc::EINVAL));
        }

        if let Some(region) = driver.mappings.remove(&index) {
            free(region);
        }
        Ok(())
    }

    fn queue_buffer(&self, index: u32) -> io::Result<()> {
        if self.fail_queue_at.get() == Some(index) {
            return Err(errno(libc::EIO));
        }

        let mut driver = self.driver.borrow_mut();
        if index >= driver.allocated || driver.owns(index) {
            return Err(errno(libc::EINVAL));
        }

        driver.incoming.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&self) -> io::Result<Dequeued> {
        if self.fail_dequeue.get() {
            return Err(errno(libc::EIO));
        }

        let mut driver = self.driver.borrow_mut();
        if !driver.streaming {
            return Err(errno(libc::EINVAL));
        }
        if driver.done.is_empty() {
            if let Some(payload) = &self.auto_frames {
                driver.fill_next(payload);
            }
        }

        driver.done.pop_front().ok_or_else(|| errno(libc::EAGAIN))
    }

    fn stream_on(&self) -> io::Result<()> {
        if self.fail_stream_on {
            return Err(errno(libc::EIO));
        }

        let mut driver = self.driver.borrow_mut();
        if driver.allocated == 0 {
            return Err(errno(libc::EINVAL));
        }
        driver.streaming = true;
        Ok(())
    }

    fn stream_off(&self) -> io::Result<()> {
        let mut driver = self.driver.borrow_mut();
        driver.streaming = false;
        driver.incoming.clear();
        driver.done.clear();

        match self.fail_stream_off {
            Some(code) => Err(errno(code)),
            None => Ok(()),
        }
    }

    fn wait(&self, _timeout: Option<Duration>) -> io::Result<bool> {
        let driver = self.driver.borrow();
        let auto = self.auto_frames.is_some() && !driver.incoming.is_empty();
        Ok(driver.streaming && (!driver.done.is_empty() || auto))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped(dev: &MockDevice, count: u32) -> Vec<(NonNull<u8>, usize)> {
        assert_eq!(dev.request_buffers(count).expect("reqbufs"), count);
        (0..count)
            .map(|index| {
                let placement = dev.query_buffer(index).expect("querybuf");
                (dev.map(&placement).expect("map"), placement.length as usize)
            })
            .collect()
    }

    #[test]
    fn grants_at_most_the_configured_buffers() {
        let dev = MockDevice::new().with_max_buffers(2);
        assert_eq!(dev.request_buffers(8).expect("reqbufs"), 2);
        assert!(dev.query_buffer(2).is_err());
        assert_eq!(dev.request_buffers(0).expect("reqbufs"), 0);
    }

    #[test]
    fn dequeue_reports_eagain_when_nothing_is_ready() {
        let dev = MockDevice::new();
        mapped(&dev, 2);
        dev.queue_buffer(0).expect("qbuf");

        let err = dev.dequeue_buffer().expect_err("not streaming");
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));

        dev.stream_on().expect("streamon");
        let err = dev.dequeue_buffer().expect_err("nothing filled");
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        assert_eq!(dev.complete_frame(b"abc"), Some(0));
        let buf = dev.dequeue_buffer().expect("filled buffer");
        assert_eq!((buf.index, buf.bytesused, buf.sequence), (0, 3, 0));
    }

    #[test]
    fn double_queue_is_rejected() {
        let dev = MockDevice::new();
        mapped(&dev, 2);
        dev.queue_buffer(1).expect("qbuf");
        assert!(dev.queue_buffer(1).is_err());
        assert!(dev.queue_buffer(2).is_err());
        assert_eq!(dev.queued(), vec![1]);
    }

    #[test]
    fn unmap_checks_pointer_and_length() {
        let dev = MockDevice::new();
        let regions = mapped(&dev, 2);
        let (ptr, len) = regions[0];

        assert!(unsafe { dev.unmap(ptr, len + 1) }.is_err());
        assert_eq!(dev.live_mappings(), 2);

        unsafe { dev.unmap(ptr, len) }.expect("unmap");
        assert!(unsafe { dev.unmap(ptr, len) }.is_err());
        assert_eq!(dev.live_mappings(), 1);
        assert_eq!(dev.unmap_calls(), 3);
    }

    #[test]
    fn format_is_locked_while_buffers_exist() {
        let mut dev = MockDevice::new();
        dev.request_buffers(1).expect("reqbufs");
        let err = dev
            .set_format(&Format::new(320, 240, FourCC::new(b"JPEG")))
            .expect_err("buffers allocated");
        assert_eq!(err.raw_os_error(), Some(libc::EBUSY));

        dev.request_buffers(0).expect("reqbufs");
        let fmt = dev
            .set_format(&Format::new(320, 240, FourCC::new(b"JPEG")))
            .expect("no buffers left");
        assert_eq!((fmt.width, fmt.height), (320, 240));
    }

    #[test]
    fn stream_off_returns_every_buffer() {
        let dev = MockDevice::new();
        mapped(&dev, 3);
        for index in 0..3 {
            dev.queue_buffer(index).expect("qbuf");
        }
        dev.stream_on().expect("streamon");
        dev.complete_frame(b"x");

        dev.stream_off().expect("streamoff");
        assert!(!dev.is_streaming());
        assert!(dev.queued().is_empty());
        assert_eq!(dev.complete_frame(b"x"), None);
    }
}
