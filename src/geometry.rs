//! Region-of-interest, binning and pixel data type model.
//!
//! Pure data: no hardware access happens here. The chip owns a live copy of
//! each value and snapshots them into `ExposureSettings` when an exposure
//! starts.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CamdError, CamdResult};

/// Value accepted by [`Rect::resolve`] meaning "use the chip value".
pub const FULL_CHIP: i32 = -1;

/// Rectangle in chip coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    /// Left column (pixel)
    pub x: u32,
    /// Top row (pixel)
    pub y: u32,
    /// Width in unbinned pixels
    pub width: u32,
    /// Height in unbinned pixels
    pub height: u32,
}

impl Rect {
    /// Creates a rectangle.
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Full sensor rectangle anchored at the origin.
    pub fn full_sensor(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Number of unbinned pixels.
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Resolves a client box request against `chip`.
    ///
    /// Each argument may be [`FULL_CHIP`] to take the chip's value for that
    /// axis, so `(-1, -1, -1, -1)` is the whole chip.
    ///
    /// # Errors
    /// * `InvalidParameter` - negative values other than `-1`, or a zero size
    /// * `OutOfRange` - the rectangle starts before the chip or extends past it
    pub fn resolve(chip: &Rect, x: i32, y: i32, width: i32, height: i32) -> CamdResult<Rect> {
        let pick = |value: i32, fallback: u32, name: &str| -> CamdResult<u32> {
            match value {
                FULL_CHIP => Ok(fallback),
                v if v < 0 => Err(CamdError::InvalidParameter(format!(
                    "{name} must be -1 or non-negative, got {v}"
                ))),
                v => Ok(v.unsigned_abs()),
            }
        };

        let x = pick(x, chip.x, "x")?;
        let y = pick(y, chip.y, "y")?;
        let width = pick(width, chip.width, "width")?;
        let height = pick(height, chip.height, "height")?;

        if width == 0 || height == 0 {
            return Err(CamdError::InvalidParameter(format!(
                "empty region {width}x{height}"
            )));
        }

        let fits = |start: u32, len: u32, origin: u32, size: u32| {
            start >= origin && u64::from(start - origin) + u64::from(len) <= u64::from(size)
        };
        if !fits(x, width, chip.x, chip.width) || !fits(y, height, chip.y, chip.height) {
            return Err(CamdError::OutOfRange(format!(
                "box [{x}, {y}, {width}, {height}] exceeds chip {chip}"
            )));
        }

        Ok(Rect::new(x, y, width, height))
    }

    /// Centered rectangle of the requested size.
    ///
    /// A size that is not positive or does not fit falls back to half of the
    /// chip dimension, placed a quarter in.
    pub fn centered(chip: &Rect, width: i32, height: i32) -> Rect {
        let axis = |requested: i32, size: u32| -> (u32, u32) {
            match u32::try_from(requested) {
                Ok(len) if len > 0 && len <= size => (size / 2 - len / 2, len),
                _ => (size / 4, size / 2),
            }
        };
        let (x, w) = axis(width, chip.width);
        let (y, h) = axis(height, chip.height);
        Rect::new(x, y, w, h)
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}, {}]", self.x, self.y, self.width, self.height)
    }
}

/// Binning factors. Displayed as `HxV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Binning2D {
    /// Rows summed into one output row
    pub vertical: u32,
    /// Columns summed into one output column
    pub horizontal: u32,
}

impl Binning2D {
    /// Creates a binning; `vertical` first to match the `binning` command.
    pub fn new(vertical: u32, horizontal: u32) -> Self {
        Self {
            vertical,
            horizontal,
        }
    }

    /// No binning.
    pub fn unbinned() -> Self {
        Self::new(1, 1)
    }
}

impl Default for Binning2D {
    fn default() -> Self {
        Self::unbinned()
    }
}

impl fmt::Display for Binning2D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.horizontal, self.vertical)
    }
}

/// Pixel data type emitted by a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// unsigned 8-bit
    Byte,
    /// signed 16-bit
    Short,
    /// signed 32-bit
    Long,
    /// signed 64-bit
    LongLong,
    /// 32-bit float
    Float,
    /// 64-bit float
    Double,
    /// signed 8-bit
    #[serde(rename = "sbyte")]
    SByte,
    /// unsigned 16-bit
    #[serde(rename = "ushort")]
    UShort,
    /// unsigned 32-bit
    #[serde(rename = "ulong")]
    ULong,
}

impl DataType {
    /// FITS-style bits-per-pixel code, negative for floating point.
    pub fn bitpix(&self) -> i16 {
        match self {
            DataType::Byte | DataType::SByte => 8,
            DataType::Short | DataType::UShort => 16,
            DataType::Long | DataType::ULong => 32,
            DataType::LongLong => 64,
            DataType::Float => -32,
            DataType::Double => -64,
        }
    }

    /// Bytes per pixel.
    pub fn pixel_byte_size(&self) -> u32 {
        u32::from(self.bitpix().unsigned_abs()) / 8
    }

    /// Wire code carried in the image header.
    pub fn code(&self) -> i16 {
        match self {
            DataType::SByte => 10,
            DataType::UShort => 20,
            DataType::ULong => 40,
            other => other.bitpix(),
        }
    }

    /// Short name used in logs and status output.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Byte => "byte",
            DataType::Short => "short",
            DataType::Long => "long",
            DataType::LongLong => "long_long",
            DataType::Float => "float",
            DataType::Double => "double",
            DataType::SByte => "sbyte",
            DataType::UShort => "ushort",
            DataType::ULong => "ulong",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shutter state for an exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shutter {
    /// Shutter opens; sky frame
    Light,
    /// Shutter stays closed; dark or bias frame
    Dark,
}

impl Shutter {
    /// Header code: 1 light, 0 dark.
    pub fn code(&self) -> u16 {
        match self {
            Shutter::Light => 1,
            Shutter::Dark => 0,
        }
    }
}
