//! Memory-mapped video capture on top of video4linux
//!
//! The crate drives a single capture device through the usual V4L2 streaming cycle:
//! open the node, check its capabilities, negotiate a format, map a pool of driver buffers,
//! start streaming and exchange filled buffers with the driver one at a time.
//!
//! Two kernel access backends are available, selected at compile time:
//!
//! * `v4l2` (default) talks to the kernel directly through ioctl() and mmap()
//! * `libv4l` routes all calls through libv4l2, which adds format conversion for some devices
//!
//! # Example
//!
//! ```
//! use v4lcap::{capability, format, Handle, Poll, Stream};
//!
//! if let Ok(mut dev) = Handle::open("/dev/video0") {
//!     let caps = capability::query(&dev).expect("Failed to query capabilities");
//!     if capability::supports_streaming_capture(&caps) {
//!         let fmt = format::configure(&mut dev, 640, 480).expect("Failed to set format");
//!         println!("Active format:\n{}", fmt);
//!
//!         let mut stream = Stream::with_buffers(&mut dev, 4).expect("Failed to create stream");
//!         stream.start().expect("Failed to start streaming");
//!         while let Ok(Poll::Empty) = stream.poll_once(|_| {}) {
//!             stream.wait(None).expect("Failed to wait for a frame");
//!         }
//!         stream.release().expect("Failed to release buffers");
//!     }
//! }
//! ```
//!
//! Ownership rules of the kernel interface are expressed with lifetimes: buffers borrow the
//! device, so it can be neither closed nor reconfigured while they are mapped, and a frame is
//! only readable inside the callback it was handed to.

#[cfg(feature = "v4l-sys")]
pub use v4l_sys;

#[cfg(feature = "v4l2-sys")]
pub use v4l2_sys as v4l_sys;

pub mod v4l2;

pub mod buffer;
pub mod capability;
pub mod device;
pub mod error;
pub mod format;
pub mod io;
pub mod memory;
pub mod session;
pub mod timestamp;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use capability::Capabilities;
pub use device::{Device, Handle};
pub use error::{Error, Result};
pub use format::{FieldOrder, Format, FourCC};
pub use io::mmap::{Arena, Frame, Poll, Stream};
pub use session::{Config, Session};
pub use timestamp::Timestamp;
