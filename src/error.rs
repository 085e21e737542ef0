//! Error types of the capture core

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::capability;

/// Result type alias using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Capture core errors
///
/// Every variant keeps the OS error that caused it as its source. Nothing in this crate retries:
/// the caller decides whether to reconfigure or to tear the session down (see
/// [`Error::is_fatal`]).
#[derive(Debug, Error)]
pub enum Error {
    /// The device node could not be opened
    #[error("failed to open {}", path.display())]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Closing the device node failed
    #[error("failed to close device")]
    CloseFailed(#[source] io::Error),

    /// A capability or format query was not answered
    #[error("device query failed")]
    QueryFailed(#[source] io::Error),

    /// The device cannot do streaming video capture
    #[error("device does not support streaming capture (capabilities: {0})")]
    Unsupported(capability::Flags),

    /// The driver refused the requested format
    #[error("format {width}x{height} rejected")]
    FormatRejected {
        width: u32,
        height: u32,
        #[source]
        source: io::Error,
    },

    /// Buffers could not be requested, mapped or queued
    #[error("buffer allocation failed")]
    AllocationFailed(#[source] io::Error),

    /// A mapped buffer could not be unmapped
    #[error("failed to unmap buffer")]
    UnmapFailed(#[source] io::Error),

    /// The driver refused to start streaming
    #[error("failed to start streaming")]
    StreamOnFailed(#[source] io::Error),

    /// The driver refused to stop streaming
    #[error("failed to stop streaming")]
    StreamOffFailed(#[source] io::Error),

    /// A buffer could not be dequeued or handed back to the driver
    #[error("failed to exchange buffer with the driver")]
    DequeueFailed(#[source] io::Error),
}

impl Error {
    /// Whether the capture session has to be torn down and reopened
    ///
    /// Configuration stage errors (queries, formats, missing capabilities) may be retried with
    /// different parameters before any buffer exists. Everything touching the buffer pool leaves
    /// the driver in an unknown state.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::OpenFailed { .. }
            | Error::QueryFailed(_)
            | Error::Unsupported(_)
            | Error::FormatRejected { .. }
            | Error::StreamOnFailed(_) => false,
            Error::CloseFailed(_)
            | Error::AllocationFailed(_)
            | Error::UnmapFailed(_)
            | Error::StreamOffFailed(_)
            | Error::DequeueFailed(_) => true,
        }
    }
}

/// Shorthand for errors raised by this crate rather than the kernel
pub(crate) fn other(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, msg)
}
