use bitflags::bitflags;

use crate::capability::c_str;
use crate::format::FourCC;
use crate::v4l_sys::*;

bitflags! {
    /// Properties of an enumerated pixel format
    #[allow(clippy::unreadable_literal)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags : u32 {
        const COMPRESSED            = 0x0001;
        /// Converted in software (libv4l), not produced by the hardware
        const EMULATED              = 0x0002;
        const CONTINUOUS_BITSTREAM  = 0x0004;
        const DYN_RESOLUTION        = 0x0008;
    }
}

/// One pixel format offered by a device, see [`crate::format::enumerate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Description {
    /// Position in the driver's list
    pub index: u32,
    /// Buffer type the format applies to
    pub typ: u32,
    pub flags: Flags,
    /// Human readable name chosen by the driver
    pub description: String,
    pub fourcc: FourCC,
}

impl Description {
    /// Whether frames in this format are compressed (JPEG, H.264, ...)
    pub fn is_compressed(&self) -> bool {
        self.flags.contains(Flags::COMPRESSED)
    }
}

impl From<v4l2_fmtdesc> for Description {
    fn from(desc: v4l2_fmtdesc) -> Self {
        Description {
            index: desc.index,
            typ: desc.type_,
            flags: Flags::from_bits_truncate(desc.flags),
            description: c_str(&desc.description),
            fourcc: FourCC::from(desc.pixelformat),
        }
    }
}
