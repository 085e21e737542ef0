use std::convert::TryFrom;
use std::fmt;

/// Field order of captured images (`enum v4l2_field`)
///
/// Only the orders a single-planar capture device reports for whole frames are modelled.
/// Sequential and field-pair orders are not requested by this crate; drivers reporting them
/// are read back as [`FieldOrder::Any`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum FieldOrder {
    /// Let the driver choose
    Any = 0,
    /// Full frames, no interlacing
    Progressive = 1,
    /// Top field only
    Top = 2,
    /// Bottom field only
    Bottom = 3,
    /// Both fields interleaved line by line in one buffer
    Interlaced = 4,
    /// Top and bottom fields in alternating buffers
    Alternate = 7,
}

impl fmt::Display for FieldOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldOrder::Any => "any",
            FieldOrder::Progressive => "progressive",
            FieldOrder::Top => "top",
            FieldOrder::Bottom => "bottom",
            FieldOrder::Interlaced => "interlaced",
            FieldOrder::Alternate => "alternate",
        };
        f.write_str(name)
    }
}

impl TryFrom<u32> for FieldOrder {
    /// The code that has no counterpart
    type Error = u32;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => FieldOrder::Any,
            1 => FieldOrder::Progressive,
            2 => FieldOrder::Top,
            3 => FieldOrder::Bottom,
            4 => FieldOrder::Interlaced,
            7 => FieldOrder::Alternate,
            other => return Err(other),
        })
    }
}
