//! Open, configure and stream a capture device in one go

use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::capability::{self, Capabilities};
use crate::device::{Device, Handle};
use crate::error::{Error, Result};
use crate::format::{self, Format};
use crate::io::mmap::{Frame, Poll, Stream};

/// How long to wait for a filled buffer before checking the running flag again
const WAIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Session parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Device node
    pub path: PathBuf,
    /// Requested width in pixels, the driver may pick another one
    pub width: u32,
    /// Requested height in pixels, the driver may pick another one
    pub height: u32,
    /// Number of buffers to request
    pub buffer_count: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            path: PathBuf::from("/dev/video0"),
            width: 640,
            height: 480,
            buffer_count: 8,
        }
    }
}

impl Config {
    /// Sets the device node
    ///
    /// # Arguments
    ///
    /// * `path` - Path (e.g. "/dev/video2")
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = path.as_ref().to_path_buf();
        self
    }

    /// Sets the requested geometry
    ///
    /// # Arguments
    ///
    /// * `width` - Width in pixels
    /// * `height` - Height in pixels
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Sets the number of buffers to request; the driver may grant a different number
    pub fn buffer_count(mut self, count: u32) -> Self {
        self.buffer_count = count;
        self
    }
}

/// A configured capture device
///
/// Creating a session checks that the device can stream video capture and applies the
/// requested geometry. [`Session::capture`] then runs a complete streaming cycle.
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use v4lcap::session::{Config, Session};
///
/// let config = Config::default().size(1280, 720);
/// if let Ok(mut session) = Session::open(&config) {
///     let running = AtomicBool::new(true);
///     let frames = session.capture(&running, |frame| {
///         println!("{} bytes", frame.len());
///         running.store(false, Ordering::Relaxed);
///     });
///     println!("{:?}", frames);
/// }
/// ```
pub struct Session<D: Device = Handle> {
    dev: D,
    caps: Capabilities,
    format: Format,
    buffer_count: u32,
}

impl Session<Handle> {
    /// Opens the configured device node and prepares it for capture
    ///
    /// The node is closed again if any step fails.
    pub fn open(config: &Config) -> Result<Self> {
        let dev = Handle::open(&config.path)?;
        info!("device {} opened", config.path.display());
        Session::with_device(dev, config)
    }

    /// Closes the device node
    pub fn close(self) -> Result<()> {
        let path = self.dev.path().to_path_buf();
        self.dev.close()?;
        info!("device {} closed", path.display());
        Ok(())
    }
}

impl<D: Device> Session<D> {
    /// Prepares an already opened device for capture
    ///
    /// # Arguments
    ///
    /// * `dev` - Device to take ownership of
    /// * `config` - Geometry and buffer count; the path is ignored
    pub fn with_device(mut dev: D, config: &Config) -> Result<Self> {
        let caps = capability::query(&dev)?;
        if !capability::supports_streaming_capture(&caps) {
            return Err(Error::Unsupported(caps.capabilities));
        }
        info!("{} ({}) supports streaming capture", caps.card, caps.driver);

        // the list is informational, a broken enumeration does not stop us
        for desc in format::enumerate(&dev) {
            match desc {
                Ok(desc) => debug!(
                    "supported format: {} ({}{})",
                    desc.fourcc,
                    desc.description,
                    if desc.is_compressed() { ", compressed" } else { "" }
                ),
                Err(e) => debug!("format enumeration aborted: {}", e),
            }
        }

        let requested = format::configure(&mut dev, config.width, config.height)?;
        // buffers are sized by what the device applies, read it back
        let format = format::active(&dev)?;
        if format != requested {
            warn!("active format differs from the negotiated one: {:?}", format);
        }

        Ok(Session {
            dev,
            caps,
            format,
            buffer_count: config.buffer_count,
        })
    }

    /// Capabilities reported when the session was created
    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// The format the driver settled on
    pub fn format(&self) -> &Format {
        &self.format
    }

    /// The device the session owns
    pub fn device(&self) -> &D {
        &self.dev
    }

    /// Streams frames into `on_frame` as long as `running` is set
    ///
    /// Buffers are allocated and streaming is started first. Whenever no frame is ready the
    /// session waits for the device, checking `running` at least every 100 ms. Streaming is
    /// stopped and all buffers are released before this returns, on error paths as well.
    ///
    /// Returns the number of delivered frames.
    pub fn capture<F>(&mut self, running: &AtomicBool, mut on_frame: F) -> Result<u64>
    where
        F: FnMut(&Frame<'_>),
    {
        let mut stream = Stream::with_buffers(&mut self.dev, self.buffer_count)?;

        let streamed = pump(&mut stream, running, &mut on_frame);
        let released = stream.release();

        let frames = streamed?;
        released?;
        info!("capture finished after {} frames", frames);
        Ok(frames)
    }
}

fn pump<D, F>(stream: &mut Stream<'_, D>, running: &AtomicBool, on_frame: &mut F) -> Result<u64>
where
    D: Device + ?Sized,
    F: FnMut(&Frame<'_>),
{
    stream.start()?;

    let mut frames = 0;
    while running.load(Ordering::Relaxed) {
        match stream.poll_once(|frame| on_frame(frame))? {
            Poll::Delivered(_) => frames += 1,
            Poll::Empty => {
                stream.wait(Some(WAIT_TIMEOUT)).map_err(Error::DequeueFailed)?;
            }
        }
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Flags;
    use crate::mock::MockDevice;
    use std::cell::Cell;

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert_eq!(config.path, Path::new("/dev/video0"));
        assert_eq!((config.width, config.height), (640, 480));
        assert_eq!(config.buffer_count, 8);

        let config = config.path("/dev/video2").size(320, 240).buffer_count(4);
        assert_eq!(config.path, Path::new("/dev/video2"));
        assert_eq!((config.width, config.height, config.buffer_count), (320, 240, 4));
    }

    #[test]
    fn missing_node_fails_to_open() {
        let config = Config::default().path("/dev/this-is-not-a-video-device");
        assert!(matches!(
            Session::open(&config),
            Err(Error::OpenFailed { .. })
        ));
    }

    #[test]
    fn device_without_capture_is_unsupported() {
        let dev = MockDevice::new().with_capabilities(Flags::STREAMING | Flags::VIDEO_OUTPUT);
        match Session::with_device(dev, &Config::default()) {
            Err(Error::Unsupported(flags)) => assert!(!flags.contains(Flags::VIDEO_CAPTURE)),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("an output device must be rejected"),
        }
    }

    #[test]
    fn adjusted_format_is_reported() {
        let dev = MockDevice::new().with_frame_sizes(&[(352, 288), (1280, 720)]);
        let session =
            Session::with_device(dev, &Config::default()).expect("session should be created");
        assert_eq!((session.format().width, session.format().height), (352, 288));
        assert_eq!(
            *session.format(),
            format::active(session.device()).expect("G_FMT should succeed")
        );
        assert_eq!(session.capabilities().card, "Mock Camera");
    }

    #[test]
    fn capture_runs_until_the_flag_is_cleared() {
        let dev = MockDevice::new()
            .with_max_buffers(3)
            .with_auto_frames(b"\xff\xd8\xff\xd9");
        let mut session = Session::with_device(dev, &Config::default().buffer_count(4))
            .expect("session should be created");

        let running = AtomicBool::new(true);
        let seen = Cell::new(0);
        let frames = session
            .capture(&running, |frame| {
                assert_eq!(frame.data(), b"\xff\xd8\xff\xd9");
                seen.set(seen.get() + 1);
                if seen.get() == 5 {
                    running.store(false, Ordering::Relaxed);
                }
            })
            .expect("capture should succeed");

        assert_eq!(frames, 5);
        let dev = session.device();
        assert!(!dev.is_streaming());
        assert_eq!(dev.live_mappings(), 0);
        assert_eq!(dev.unmap_calls(), 3);
        assert_eq!(dev.allocated(), 0);
    }

    #[test]
    fn cleared_flag_captures_nothing() {
        let dev = MockDevice::new().with_auto_frames(b"x");
        let mut session =
            Session::with_device(dev, &Config::default()).expect("session should be created");

        let running = AtomicBool::new(false);
        let frames = session
            .capture(&running, |_| panic!("no frame expected"))
            .expect("capture should succeed");
        assert_eq!(frames, 0);
        assert_eq!(session.device().live_mappings(), 0);
    }

    #[test]
    fn capture_tears_down_after_a_failure() {
        let dev = MockDevice::new().with_auto_frames(b"x");
        let mut session =
            Session::with_device(dev, &Config::default()).expect("session should be created");
        session.device().set_fail_dequeue(true);

        let running = AtomicBool::new(true);
        let err = session
            .capture(&running, |_| {})
            .expect_err("dequeue failure must end the capture");
        assert!(matches!(err, Error::DequeueFailed(_)));
        assert!(err.is_fatal());
        assert!(!session.device().is_streaming());
        assert_eq!(session.device().live_mappings(), 0);
    }

    #[test]
    fn failed_start_releases_buffers() {
        let dev = MockDevice::new().fail_stream_on();
        let mut session =
            Session::with_device(dev, &Config::default()).expect("session should be created");

        let running = AtomicBool::new(true);
        assert!(matches!(
            session.capture(&running, |_| {}),
            Err(Error::StreamOnFailed(_))
        ));
        assert_eq!(session.device().live_mappings(), 0);
        assert_eq!(session.device().allocated(), 0);
    }
}
