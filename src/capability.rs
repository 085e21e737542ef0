use bitflags::bitflags;
use log::debug;
use std::fmt;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::v4l_sys::*;

bitflags! {
    #[allow(clippy::unreadable_literal)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags : u32 {
        const VIDEO_CAPTURE         = 0x00000001;
        const VIDEO_OUTPUT          = 0x00000002;
        const VIDEO_OVERLAY         = 0x00000004;
        const VBI_CAPTURE           = 0x00000010;
        const VBI_OUTPUT            = 0x00000020;
        const SLICED_VBI_CAPTURE    = 0x00000040;
        const SLICED_VBI_OUTPUT     = 0x00000080;
        const RDS_CAPTURE           = 0x00000100;
        const VIDEO_OUTPUT_OVERLAY  = 0x00000200;
        const HW_FREQ_SEEK          = 0x00000400;
        const RDS_OUTPUT            = 0x00000800;

        const VIDEO_CAPTURE_MPLANE  = 0x00001000;
        const VIDEO_OUTPUT_MPLANE   = 0x00002000;
        const VIDEO_M2M_MPLANE      = 0x00004000;
        const VIDEO_M2M             = 0x00008000;

        const TUNER                 = 0x00010000;
        const AUDIO                 = 0x00020000;
        const RADIO                 = 0x00040000;
        const MODULATOR             = 0x00080000;

        const SDR_CAPTURE           = 0x00100000;
        const EXT_PIX_FORMAT        = 0x00200000;
        const SDR_OUTPUT            = 0x00400000;
        const META_CAPTURE          = 0x00800000;

        const READ_WRITE            = 0x01000000;
        const ASYNC_IO              = 0x02000000;
        const STREAMING             = 0x04000000;
        const META_OUTPUT           = 0x08000000;

        const TOUCH                 = 0x10000000;

        const DEVICE_CAPS           = 0x80000000;
    }
}

impl From<u32> for Flags {
    fn from(flags: u32) -> Self {
        Self::from_bits_retain(flags)
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

#[derive(Debug, Clone, PartialEq, Eq)]
/// Device capabilities
pub struct Capabilities {
    /// Driver name, e.g. uvc for usb video class devices
    pub driver: String,
    /// Card name
    pub card: String,
    /// Bus name, e.g. USB or PCI
    pub bus: String,
    /// Version number MAJOR.MINOR.PATCH
    pub version: (u8, u8, u8),

    /// Capability flags of the opened node
    pub capabilities: Flags,
}

impl Capabilities {
    /// Returns a capability snapshot without driver information
    ///
    /// # Arguments
    ///
    /// * `capabilities` - Capability flags of the device node
    ///
    /// # Example
    ///
    /// ```
    /// use v4lcap::capability::{Capabilities, Flags};
    /// let caps = Capabilities::new(Flags::VIDEO_CAPTURE | Flags::STREAMING);
    /// assert!(v4lcap::capability::supports_streaming_capture(&caps));
    /// ```
    pub fn new(capabilities: Flags) -> Self {
        Capabilities {
            driver: String::new(),
            card: String::new(),
            bus: String::new(),
            version: (0, 0, 0),
            capabilities,
        }
    }
}

pub(crate) fn c_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl From<v4l2_capability> for Capabilities {
    fn from(cap: v4l2_capability) -> Self {
        // device_caps describes the opened node, capabilities the whole physical device
        let physical = Flags::from(cap.capabilities);
        let capabilities = if physical.contains(Flags::DEVICE_CAPS) {
            Flags::from(cap.device_caps)
        } else {
            physical
        };

        Capabilities {
            driver: c_str(&cap.driver),
            card: c_str(&cap.card),
            bus: c_str(&cap.bus_info),
            version: (
                ((cap.version >> 16) & 0xff) as u8,
                ((cap.version >> 8) & 0xff) as u8,
                (cap.version & 0xff) as u8,
            ),
            capabilities,
        }
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Driver      : {}", self.driver)?;
        writeln!(f, "Card        : {}", self.card)?;
        writeln!(f, "Bus         : {}", self.bus)?;
        writeln!(
            f,
            "Version     : {}.{}.{}",
            self.version.0, self.version.1, self.version.2
        )?;
        writeln!(f, "Capabilites : {}", self.capabilities)?;
        Ok(())
    }
}

/// Query the capabilities of a device
///
/// # Arguments
///
/// * `dev` - Opened device
///
/// # Example
///
/// ```
/// use v4lcap::{capability, Handle};
///
/// if let Ok(dev) = Handle::open("/dev/video0") {
///     if let Ok(caps) = capability::query(&dev) {
///         print!("{}", caps);
///     }
/// }
/// ```
pub fn query<D: Device + ?Sized>(dev: &D) -> Result<Capabilities> {
    let caps = dev.query_caps().map_err(Error::QueryFailed)?;
    debug!(
        "capabilities of {} ({}): {}",
        caps.card, caps.driver, caps.capabilities
    );
    Ok(caps)
}

/// Whether buffers may be allocated for streaming capture on this device
///
/// Both streaming I/O and video capture are required. A read()-only device or one that streams
/// for anything but video capture (output, metadata, ...) is rejected.
pub fn supports_streaming_capture(caps: &Capabilities) -> bool {
    caps.capabilities
        .contains(Flags::STREAMING | Flags::VIDEO_CAPTURE)
}
