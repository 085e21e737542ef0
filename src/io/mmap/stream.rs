use log::{debug, error, info, trace};
use std::{fmt, io, time::Duration};

use crate::buffer::Metadata;
use crate::device::Device;
use crate::error::{other, Error, Result};
use crate::io::mmap::{Arena, Frame};

/// Streaming state of a device
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    Idle,
    Streaming,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Idle => write!(f, "idle"),
            State::Streaming => write!(f, "streaming"),
        }
    }
}

/// Outcome of [`Stream::poll_once`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Poll {
    /// A frame was passed to the callback and its buffer queued again
    Delivered(Metadata),
    /// No filled buffer was ready
    Empty,
}

/// Stream of mapped buffers
///
/// Drives the device between idle and streaming and exchanges buffers with the driver: a filled
/// buffer is dequeued, shown to a callback and queued again right away.
///
/// An arena instance is used internally for buffer handling.
pub struct Stream<'a, D: Device + ?Sized> {
    arena: Arena<'a, D>,
    state: State,
}

impl<'a, D: Device + ?Sized> Stream<'a, D> {
    /// Returns an idle stream over an allocated arena
    pub fn new(arena: Arena<'a, D>) -> Self {
        Stream {
            arena,
            state: State::Idle,
        }
    }

    /// Allocates an arena with the given number of buffers and wraps it in a stream
    ///
    /// # Arguments
    ///
    /// * `dev` - Device with a configured format
    /// * `count` - Desired number of buffers
    ///
    /// # Example
    ///
    /// ```
    /// use v4lcap::{Handle, Poll, Stream};
    ///
    /// if let Ok(mut dev) = Handle::open("/dev/video0") {
    ///     if let Ok(mut stream) = Stream::with_buffers(&mut dev, 4) {
    ///         if stream.start().is_ok() {
    ///             let _ = stream.poll_once(|frame| println!("{} bytes", frame.len()));
    ///         }
    ///         let _ = stream.release();
    ///     }
    /// }
    /// ```
    pub fn with_buffers(dev: &'a mut D, count: u32) -> Result<Self> {
        Ok(Stream::new(Arena::allocate(dev, count)?))
    }

    /// Current streaming state
    pub fn state(&self) -> State {
        self.state
    }

    /// The buffers of this stream
    pub fn arena(&self) -> &Arena<'a, D> {
        &self.arena
    }

    /// The device being streamed from
    pub fn device(&self) -> &D {
        self.arena.device()
    }

    /// Starts streaming
    ///
    /// Requires an idle stream whose buffers are all queued. Starting an active stream does
    /// nothing. On failure the stream stays idle.
    pub fn start(&mut self) -> Result<()> {
        if self.state == State::Streaming {
            return Ok(());
        }
        if self.arena.is_empty() {
            return Err(Error::StreamOnFailed(other("no buffers allocated")));
        }
        if !self.arena.all_queued() {
            return Err(Error::StreamOnFailed(other("buffers are not queued")));
        }

        self.arena
            .device()
            .stream_on()
            .map_err(Error::StreamOnFailed)?;
        self.state = State::Streaming;

        info!("streaming started with {} buffers", self.arena.len());
        Ok(())
    }

    /// Stops streaming
    ///
    /// The stream is idle afterwards even if the driver reported an error. The driver gives up
    /// all buffers when it stops, so they are all application-owned then; see
    /// [`Stream::requeue_all`] to start again. Stopping an idle stream does nothing.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == State::Idle {
            return Ok(());
        }

        let result = self.arena.device().stream_off();
        self.state = State::Idle;
        self.arena.reclaim_all();

        result.map_err(Error::StreamOffFailed)?;
        info!("streaming stopped");
        Ok(())
    }

    /// Queues every buffer again after a stop
    pub fn requeue_all(&mut self) -> Result<()> {
        if self.state == State::Streaming {
            return Ok(());
        }

        self.arena.enqueue_all()
    }

    /// Dequeues at most one filled buffer and passes it to `on_frame`
    ///
    /// Never blocks: if no buffer is ready, [`Poll::Empty`] is returned and nothing changes.
    /// Otherwise the callback runs synchronously with a read-only view of the buffer, which is
    /// queued again as soon as the callback returns. Errors mean the driver state is unknown;
    /// the stream should be stopped and released.
    ///
    /// Looping is up to the caller, e.g. combined with [`Stream::wait`].
    pub fn poll_once<F>(&mut self, on_frame: F) -> Result<Poll>
    where
        F: FnOnce(&Frame<'_>),
    {
        if self.state != State::Streaming {
            return Err(Error::DequeueFailed(other("stream is not active")));
        }

        let buf = match self.arena.device().dequeue_buffer() {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Poll::Empty),
            Err(e) => return Err(Error::DequeueFailed(e)),
        };

        self.arena.take(buf.index).map_err(Error::DequeueFailed)?;

        let meta = Metadata::from(buf);
        let capacity = self.arena.buffer_len(buf.index as usize).unwrap_or(0);
        let view = self
            .arena
            .view(buf.index, buf.bytesused)
            .map_err(Error::DequeueFailed)?;
        on_frame(&Frame::mapped(view, meta, capacity));

        self.arena
            .requeue(buf.index)
            .map_err(Error::DequeueFailed)?;

        trace!(
            "frame {} delivered from buffer {} ({} bytes)",
            meta.sequence,
            meta.index,
            meta.bytesused
        );
        Ok(Poll::Delivered(meta))
    }

    /// Blocks until a filled buffer is ready or the timeout expires
    ///
    /// Returns whether a buffer is ready. `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<bool> {
        self.arena.device().wait(timeout)
    }

    /// Stops streaming if necessary, then unmaps and frees all buffers
    pub fn release(mut self) -> Result<()> {
        let stopped = self.stop();
        let released = self.arena.unmap_all();

        stopped?;
        released
    }
}

impl<'a, D: Device + ?Sized> Drop for Stream<'a, D> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            if let Error::StreamOffFailed(ref source) = e {
                // ENODEV means the file descriptor wrapped in the handle became invalid, most
                // likely because the device was unplugged or the connection (USB, PCI, ..)
                // broke down. Handle this case gracefully by ignoring it.
                if source.raw_os_error() == Some(libc::ENODEV) {
                    debug!("device vanished while streaming");
                    return;
                }
            }

            error!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::State as Ownership;
    use crate::mock::MockDevice;

    fn delivered(poll: Poll) -> Metadata {
        match poll {
            Poll::Delivered(meta) => meta,
            Poll::Empty => panic!("expected a frame"),
        }
    }

    #[test]
    fn frames_are_delivered_and_requeued() {
        let mut dev = MockDevice::new().with_max_buffers(2);
        let mut stream = Stream::with_buffers(&mut dev, 4).expect("allocation should succeed");
        stream.start().expect("start should succeed");
        assert_eq!(stream.state(), State::Streaming);

        assert_eq!(stream.device().complete_frame(b"\xff\xd8first"), Some(0));
        let mut seen = Vec::new();
        let meta = delivered(
            stream
                .poll_once(|frame| {
                    seen.extend_from_slice(frame.data());
                    assert_eq!(frame.meta().index, 0);
                    assert_eq!(frame.capacity(), 640 * 480 * 2);
                })
                .expect("poll should succeed"),
        );

        assert_eq!(seen, b"\xff\xd8first");
        assert_eq!((meta.index, meta.sequence), (0, 0));
        assert_eq!(stream.arena().state(0), Some(Ownership::Driver));
        assert_eq!(stream.device().queued(), vec![1, 0]);

        stream.release().expect("release should succeed");
        assert_eq!(dev.live_mappings(), 0);
        assert!(!dev.is_streaming());
    }

    #[test]
    fn buffers_cycle_without_double_delivery() {
        let mut dev = MockDevice::new().with_max_buffers(3);
        let mut stream = Stream::with_buffers(&mut dev, 3).expect("allocation should succeed");
        stream.start().expect("start should succeed");

        let mut order = Vec::new();
        for round in 0..9u32 {
            stream.device().complete_frame(&round.to_le_bytes());
            let meta = delivered(stream.poll_once(|_| {}).expect("poll should succeed"));
            assert_eq!(meta.sequence, round);
            order.push(meta.index);
            assert!(stream.arena().all_queued());
        }
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn empty_queue_changes_nothing() {
        let mut dev = MockDevice::new().with_max_buffers(2);
        let mut stream = Stream::with_buffers(&mut dev, 2).expect("allocation should succeed");
        stream.start().expect("start should succeed");

        let mut called = false;
        let poll = stream.poll_once(|_| called = true).expect("poll should succeed");
        assert_eq!(poll, Poll::Empty);
        assert!(!called);
        assert!(stream.arena().all_queued());
        assert_eq!(stream.state(), State::Streaming);
        assert!(!stream.wait(Some(Duration::from_millis(1))).expect("wait"));
    }

    #[test]
    fn polling_an_idle_stream_fails() {
        let mut dev = MockDevice::new();
        let mut stream = Stream::with_buffers(&mut dev, 2).expect("allocation should succeed");
        assert!(matches!(
            stream.poll_once(|_| {}),
            Err(Error::DequeueFailed(_))
        ));
    }

    #[test]
    fn zero_buffers_never_stream() {
        let mut dev = MockDevice::new().with_max_buffers(0);
        assert!(matches!(
            Stream::with_buffers(&mut dev, 4),
            Err(Error::AllocationFailed(_))
        ));
        assert!(!dev.is_streaming());
    }

    #[test]
    fn failed_start_stays_idle() {
        let mut dev = MockDevice::new().fail_stream_on();
        let mut stream = Stream::with_buffers(&mut dev, 2).expect("allocation should succeed");
        assert!(matches!(stream.start(), Err(Error::StreamOnFailed(_))));
        assert_eq!(stream.state(), State::Idle);
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let mut dev = MockDevice::new();
        let mut stream = Stream::with_buffers(&mut dev, 2).expect("allocation should succeed");
        stream.stop().expect("stopping an idle stream is a no-op");

        stream.start().expect("start should succeed");
        stream.start().expect("second start is a no-op");
        stream.stop().expect("stop should succeed");
        stream.stop().expect("second stop is a no-op");
        assert_eq!(stream.state(), State::Idle);
    }

    #[test]
    fn restart_needs_requeued_buffers() {
        let mut dev = MockDevice::new().with_max_buffers(2);
        let mut stream = Stream::with_buffers(&mut dev, 2).expect("allocation should succeed");
        stream.start().expect("start should succeed");
        stream.stop().expect("stop should succeed");

        assert_eq!(stream.arena().state(0), Some(Ownership::Application));
        assert!(matches!(stream.start(), Err(Error::StreamOnFailed(_))));

        stream.requeue_all().expect("requeue should succeed");
        stream.start().expect("restart should succeed");
        stream.device().complete_frame(b"again");
        delivered(stream.poll_once(|_| {}).expect("poll should succeed"));
    }

    #[test]
    fn dequeue_failure_is_reported() {
        let mut dev = MockDevice::new();
        let mut stream = Stream::with_buffers(&mut dev, 2).expect("allocation should succeed");
        stream.start().expect("start should succeed");

        stream.device().set_fail_dequeue(true);
        assert!(matches!(
            stream.poll_once(|_| {}),
            Err(Error::DequeueFailed(_))
        ));
    }

    #[test]
    fn requeue_failure_is_reported() {
        let mut dev = MockDevice::new().with_max_buffers(2);
        let mut stream = Stream::with_buffers(&mut dev, 2).expect("allocation should succeed");
        stream.start().expect("start should succeed");

        stream.device().set_fail_queue_at(Some(0));
        stream.device().complete_frame(b"lost");
        let mut called = false;
        assert!(matches!(
            stream.poll_once(|_| called = true),
            Err(Error::DequeueFailed(_))
        ));
        assert!(called);
        assert_eq!(stream.arena().state(0), Some(Ownership::Application));

        stream.release().expect("release should succeed");
        assert_eq!(dev.live_mappings(), 0);
    }

    #[test]
    fn release_after_stop_unmaps_every_buffer() {
        let mut dev = MockDevice::new().with_max_buffers(3);
        let mut stream = Stream::with_buffers(&mut dev, 8).expect("allocation should succeed");
        stream.start().expect("start should succeed");
        stream.stop().expect("stop should succeed");

        stream.release().expect("release should succeed");
        assert_eq!(dev.unmap_calls(), 3);
        assert_eq!(dev.live_mappings(), 0);
        assert_eq!(dev.allocated(), 0);
    }

    #[test]
    fn release_reports_stream_off_failure_but_still_unmaps() {
        let mut dev = MockDevice::new().fail_stream_off(libc::EIO);
        let mut stream = Stream::with_buffers(&mut dev, 2).expect("allocation should succeed");
        stream.start().expect("start should succeed");

        assert!(matches!(stream.release(), Err(Error::StreamOffFailed(_))));
        assert_eq!(dev.live_mappings(), 0);
    }

    #[test]
    fn drop_stops_and_unmaps() {
        let mut dev = MockDevice::new().fail_stream_off(libc::ENODEV);
        {
            let mut stream = Stream::with_buffers(&mut dev, 2).expect("allocation should succeed");
            stream.start().expect("start should succeed");
        }
        assert!(!dev.is_streaming());
        assert_eq!(dev.live_mappings(), 0);
    }
}
