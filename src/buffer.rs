use bitflags::bitflags;
use std::fmt;

use crate::timestamp::Timestamp;

/// Buffer type
///
/// Specific types of devices require buffers of corresponding types.
/// Only single-planar video capture is streamed by this crate.
#[allow(clippy::unreadable_literal)]
#[rustfmt::skip]
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Type {
    VideoCapture        = 1,
}

bitflags! {
    #[allow(clippy::unreadable_literal)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u32 {
        /// Buffer is mapped
        const MAPPED                = 0x00000001;
        /// Buffer is queued for processing
        const QUEUED                = 0x00000002;
        /// Buffer is ready
        const DONE                  = 0x00000004;
        /// Image is a keyframe (I-frame)
        const KEYFRAME              = 0x00000008;
        /// Image is a P-frame
        const PFRAME                = 0x00000010;
        /// Image is a B-frame
        const BFRAME                = 0x00000020;
        /// Buffer is ready, but the data contained within is corrupted
        const ERROR                 = 0x00000040;
        /// Timecode field is valid
        const TIMECODE              = 0x00000100;
        /// Buffer is prepared for queuing
        const PREPARED              = 0x00000400;
        /// Timestamp type
        const TIMESTAMP_MONOTONIC   = 0x00002000;
        const TIMESTAMP_COPY        = 0x00004000;
        /// Timestamp taken at start of exposure instead of end of frame
        const TSTAMP_SRC_SOE        = 0x00010000;
        /// Last buffer produced by the hardware
        const LAST                  = 0x00100000;
    }
}

impl From<u32> for Flags {
    fn from(flags: u32) -> Self {
        Self::from_bits_truncate(flags)
    }
}

impl From<Flags> for u32 {
    fn from(flags: Flags) -> Self {
        flags.bits()
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Who may touch a mapped buffer right now
///
/// A buffer owned by the driver may be written by the device at any time and must not be read.
/// Dequeueing hands it to the application, queueing hands it back.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    /// Queued; the device may write into it
    Driver,
    /// Dequeued; readable until queued again
    Application,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Driver => write!(f, "driver-owned"),
            State::Application => write!(f, "application-owned"),
        }
    }
}

/// Buffer metadata, mostly used not to convolute the main buffer structs
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Index of the buffer inside its arena
    pub index: u32,
    /// Number of bytes occupied by the data in the buffer
    pub bytesused: u32,
    /// Buffer flags
    pub flags: Flags,
    /// Time of capture (usually set by the driver)
    pub timestamp: Timestamp,
    /// Sequence number, counting the frames
    pub sequence: u32,
}

/// A buffer the driver handed back after filling it
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Dequeued {
    pub index: u32,
    pub bytesused: u32,
    pub flags: Flags,
    pub timestamp: Timestamp,
    pub sequence: u32,
}

impl From<Dequeued> for Metadata {
    fn from(buf: Dequeued) -> Self {
        Metadata {
            index: buf.index,
            bytesused: buf.bytesused,
            flags: buf.flags,
            timestamp: buf.timestamp,
            sequence: buf.sequence,
        }
    }
}

/// Placement of a driver buffer as reported by [`crate::v4l2::vidioc::VIDIOC_QUERYBUF`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Placement {
    pub index: u32,
    /// Size of the buffer in bytes
    pub length: u32,
    /// Cookie to pass to mmap()
    pub offset: u32,
}
