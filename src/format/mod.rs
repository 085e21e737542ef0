use log::{debug, info, warn};
use std::{convert::TryFrom, fmt, io, mem};

use crate::device::Device;
use crate::error::{Error, Result};
use crate::v4l_sys::*;

pub mod description;
pub use description::Description;

pub mod field;
pub use field::FieldOrder;

pub mod fourcc;
pub use fourcc::FourCC;

/// Pixel encoding requested from every device: motion JPEG frames
pub const PIXEL_FORMAT: FourCC = FourCC::new(b"JPEG");

/// Field order requested from every device
pub const FIELD_ORDER: FieldOrder = FieldOrder::Interlaced;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// Streaming format (single-planar)
pub struct Format {
    /// width in pixels
    pub width: u32,
    /// height in pixels
    pub height: u32,
    /// pixelformat code
    pub fourcc: FourCC,
    /// field order for interlacing
    pub field_order: FieldOrder,

    /// bytes per line
    pub stride: u32,
    /// maximum number of bytes required to store an image
    pub size: u32,
}

impl Format {
    /// Returns a capture format
    ///
    /// # Arguments
    ///
    /// * `width` - Width in pixels
    /// * `height` - Height in pixels
    /// * `fourcc` - Four character code (pixelformat)
    ///
    /// # Example
    ///
    /// ```
    /// use v4lcap::format::{Format, FourCC};
    /// let fmt = Format::new(640, 480, FourCC::new(b"YUYV"));
    /// ```
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        Format {
            width,
            height,
            fourcc,
            field_order: FieldOrder::Any,
            stride: 0,
            size: 0,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "width          : {}", self.width)?;
        writeln!(f, "height         : {}", self.height)?;
        writeln!(f, "fourcc         : {}", self.fourcc)?;
        writeln!(f, "field          : {}", self.field_order)?;
        writeln!(f, "stride         : {}", self.stride)?;
        writeln!(f, "size           : {}", self.size)?;
        Ok(())
    }
}

impl From<v4l2_pix_format> for Format {
    fn from(fmt: v4l2_pix_format) -> Self {
        Self {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.pixelformat),
            // drivers are not supposed to report anything outside the enum
            field_order: FieldOrder::try_from(fmt.field).unwrap_or(FieldOrder::Any),
            stride: fmt.bytesperline,
            size: fmt.sizeimage,
        }
    }
}

impl From<Format> for v4l2_pix_format {
    fn from(format: Format) -> Self {
        Self {
            width: format.width,
            height: format.height,
            pixelformat: format.fourcc.into(),
            field: format.field_order as u32,
            bytesperline: format.stride,
            sizeimage: format.size,
            ..unsafe { mem::zeroed() }
        }
    }
}

/// Request a capture geometry from the device
///
/// The pixel encoding ([`PIXEL_FORMAT`]) and field order ([`FIELD_ORDER`]) are fixed. Drivers
/// adjust width and height to the closest size they support, so the returned format is the one
/// to size buffers by, not the request.
///
/// The device is borrowed mutably: a format cannot change while an arena holds on to it.
///
/// # Arguments
///
/// * `dev` - Opened device
/// * `width` - Desired width in pixels
/// * `height` - Desired height in pixels
///
/// # Example
///
/// ```
/// use v4lcap::{format, Handle};
///
/// if let Ok(mut dev) = Handle::open("/dev/video0") {
///     if let Ok(fmt) = format::configure(&mut dev, 640, 480) {
///         print!("{}", fmt);
///     }
/// }
/// ```
pub fn configure<D: Device + ?Sized>(dev: &mut D, width: u32, height: u32) -> Result<Format> {
    let request = Format {
        field_order: FIELD_ORDER,
        ..Format::new(width, height, PIXEL_FORMAT)
    };

    let actual = dev
        .set_format(&request)
        .map_err(|source| Error::FormatRejected {
            width,
            height,
            source,
        })?;

    if actual.fourcc != PIXEL_FORMAT {
        warn!(
            "driver does not deliver {}, frames will be {}",
            PIXEL_FORMAT, actual.fourcc
        );
    }
    if actual.width != width || actual.height != height {
        info!(
            "requested {}x{}, driver chose {}x{}",
            width, height, actual.width, actual.height
        );
    }
    debug!(
        "active format: {}x{} {} ({}), {} bytes per image",
        actual.width, actual.height, actual.fourcc, actual.field_order, actual.size
    );
    Ok(actual)
}

/// Read the format the device currently applies
///
/// # Example
///
/// ```
/// use v4lcap::{format, Handle};
///
/// if let Ok(dev) = Handle::open("/dev/video0") {
///     if let Ok(fmt) = format::active(&dev) {
///         print!("{}", fmt);
///     }
/// }
/// ```
pub fn active<D: Device + ?Sized>(dev: &D) -> Result<Format> {
    dev.format().map_err(Error::QueryFailed)
}

/// Enumerate the pixel formats a device supports
///
/// Formats are queried lazily, one per step, starting at index 0 until the driver reports that
/// there are no more. To start over, call this function again.
///
/// # Example
///
/// ```
/// use v4lcap::{format, Handle};
///
/// if let Ok(dev) = Handle::open("/dev/video0") {
///     for desc in format::enumerate(&dev).flatten() {
///         println!("{} ({})", desc.fourcc, desc.description);
///     }
/// }
/// ```
pub fn enumerate<D: Device + ?Sized>(dev: &D) -> Formats<'_, D> {
    Formats {
        dev,
        index: 0,
        done: false,
    }
}

/// Lazy sequence of [`Description`]s, see [`enumerate`]
pub struct Formats<'a, D: Device + ?Sized> {
    dev: &'a D,
    index: u32,
    done: bool,
}

impl<'a, D: Device + ?Sized> Iterator for Formats<'a, D> {
    type Item = Result<Description>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.dev.enum_format(self.index) {
            Ok(desc) => {
                self.index += 1;
                Some(Ok(desc))
            }
            // EINVAL marks the end of the list
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(Error::QueryFailed(e)))
            }
        }
    }
}

impl<'a, D: Device + ?Sized> std::iter::FusedIterator for Formats<'a, D> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    #[test]
    fn exact_geometry_is_kept() {
        let mut dev = MockDevice::new();
        let fmt = configure(&mut dev, 640, 480).expect("format should be accepted");
        assert_eq!((fmt.width, fmt.height), (640, 480));
        assert_eq!(fmt.fourcc, PIXEL_FORMAT);
        assert_eq!(fmt.field_order, FieldOrder::Interlaced);
    }

    #[test]
    fn driver_adjusted_geometry_is_returned() {
        let mut dev = MockDevice::new().with_frame_sizes(&[(352, 288)]);
        let fmt = configure(&mut dev, 640, 480).expect("format should be accepted");
        assert_eq!((fmt.width, fmt.height), (352, 288));
        assert!(fmt.size >= 352 * 288 / 8);
    }

    #[test]
    fn rejection_carries_the_request() {
        let mut dev = MockDevice::new().fail_set_format();
        match configure(&mut dev, 800, 600) {
            Err(Error::FormatRejected { width, height, .. }) => {
                assert_eq!((width, height), (800, 600));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn enumeration_stops_at_einval() {
        let dev = MockDevice::new().with_formats(&[b"JPEG", b"YUYV", b"MJPG"]);
        let fourccs: Vec<_> = enumerate(&dev)
            .map(|desc| desc.expect("enumeration should succeed").fourcc)
            .collect();
        assert_eq!(
            fourccs,
            vec![
                FourCC::new(b"JPEG"),
                FourCC::new(b"YUYV"),
                FourCC::new(b"MJPG")
            ]
        );

        // a fresh call starts over at index 0
        let first = enumerate(&dev).next().expect("one format").expect("ok");
        assert_eq!(first.index, 0);
    }

    #[test]
    fn enumeration_yields_other_errors_once() {
        let dev = MockDevice::new().fail_query();
        let mut formats = enumerate(&dev);
        assert!(matches!(formats.next(), Some(Err(Error::QueryFailed(_)))));
        assert!(formats.next().is_none());
    }

    #[test]
    fn substituted_encoding_is_returned() {
        let mut dev = MockDevice::new().with_formats(&[b"YUYV"]);
        let fmt = configure(&mut dev, 640, 480).expect("format should be accepted");
        assert_eq!(fmt.fourcc, FourCC::new(b"YUYV"));
    }

    #[test]
    fn active_format_matches_the_configured_one() {
        let mut dev = MockDevice::new().with_frame_sizes(&[(320, 240)]);
        let fmt = configure(&mut dev, 640, 480).expect("format should be accepted");
        assert_eq!(active(&dev).expect("G_FMT should succeed"), fmt);

        let dev = MockDevice::new().fail_query();
        assert!(matches!(active(&dev), Err(Error::QueryFailed(_))));
    }

    #[test]
    fn unknown_field_order_falls_back_to_any() {
        let mut raw: v4l2_pix_format = Format::new(640, 480, PIXEL_FORMAT).into();
        // V4L2_FIELD_SEQ_TB
        raw.field = 5;
        assert_eq!(Format::from(raw).field_order, FieldOrder::Any);

        raw.field = 7;
        assert_eq!(Format::from(raw).field_order, FieldOrder::Alternate);
    }

    #[test]
    fn format_survives_the_kernel_struct() {
        let fmt = Format {
            field_order: FieldOrder::Interlaced,
            stride: 0,
            size: 153_600,
            ..Format::new(640, 480, PIXEL_FORMAT)
        };
        let raw: v4l2_pix_format = fmt.into();
        assert_eq!(raw.field, 4);
        assert_eq!(Format::from(raw), fmt);
    }
}
