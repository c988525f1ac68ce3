//! Capability interface implemented by camera drivers.
//!
//! The core never branches on camera model. Each sensor is driven through a
//! [`ChipDriver`]; vendor code lives behind it. Cooling and filter wheels are
//! optional collaborators with their own small traits.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::chip::ExposureSettings;
use crate::error::{CamdError, CamdResult};
use crate::geometry::{Binning2D, DataType, Rect};
use crate::status::{ExposureStatus, ReadoutStatus};
use crate::stream::Readout;

/// Geometry and capabilities a driver reports at init.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChipDescriptor {
    /// Sensor name
    pub name: String,
    /// Readable area in chip coordinates
    pub size: Rect,
    /// Pixel pitch in micrometers (x, y)
    pub pixel_size: (f64, f64),
    /// Supported binnings; the first one is the default
    pub binnings: Vec<Binning2D>,
    /// Supported data types; the first one is the default
    pub data_types: Vec<DataType>,
    /// Number of independent output channels
    pub channels: usize,
    /// Whether a new exposure may start while the previous frame reads out
    pub frame_transfer: bool,
}

impl ChipDescriptor {
    /// Checks the descriptor is usable.
    ///
    /// # Errors
    /// `InvalidParameter` for empty geometry or capability lists.
    pub fn validate(&self) -> CamdResult<()> {
        if self.size.width == 0 || self.size.height == 0 {
            return Err(CamdError::InvalidParameter(format!(
                "chip '{}' reports empty geometry {}",
                self.name, self.size
            )));
        }
        if self.binnings.is_empty() || self.data_types.is_empty() {
            return Err(CamdError::InvalidParameter(format!(
                "chip '{}' declares no binning or data type",
                self.name
            )));
        }
        if self
            .binnings
            .iter()
            .any(|b| b.vertical == 0 || b.horizontal == 0)
        {
            return Err(CamdError::InvalidParameter(format!(
                "chip '{}' declares a zero binning factor",
                self.name
            )));
        }
        if self.channels == 0 {
            return Err(CamdError::InvalidParameter(format!(
                "chip '{}' declares no data channels",
                self.name
            )));
        }
        Ok(())
    }
}

/// Software exposure timer kept by the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureTimer {
    /// When integration started
    pub started: Instant,
    /// When integration is expected to end
    pub end: Instant,
}

impl ExposureTimer {
    /// Timer for an exposure of `length` starting now.
    ///
    /// # Errors
    /// `InvalidParameter` when the end lies beyond what the clock represents.
    pub fn start(length: Duration) -> CamdResult<Self> {
        let started = Instant::now();
        let end = started.checked_add(length).ok_or_else(|| {
            CamdError::InvalidParameter(format!(
                "exposure of {}s exceeds the clock range",
                length.as_secs_f64()
            ))
        })?;
        Ok(Self { started, end })
    }

    /// `Remaining` until `end`, then `Done`.
    pub fn status(&self) -> ExposureStatus {
        let now = Instant::now();
        if now >= self.end {
            ExposureStatus::Done
        } else {
            ExposureStatus::Remaining(self.end - now)
        }
    }
}

/// Per-sensor driver operations consumed by the state machine.
///
/// Methods that only reset hardware return `CamdResult` so failures can be
/// logged, but the core never aborts on them.
pub trait ChipDriver: Send {
    /// Discovers geometry and capabilities.
    ///
    /// # Errors
    /// `HardwareFault` when the sensor cannot be opened.
    fn init(&mut self) -> CamdResult<ChipDescriptor>;

    /// Programs a binning before the exposure that uses it.
    fn set_binning(&mut self, _binning: Binning2D) -> CamdResult<()> {
        Ok(())
    }

    /// Starts integrating the frame described by `settings`.
    ///
    /// # Errors
    /// `HardwareFault` if the exposure could not start.
    fn start_exposure(&mut self, settings: &ExposureSettings) -> CamdResult<()>;

    /// Reports exposure progress. The default trusts the software timer.
    fn is_exposing(&mut self, timer: &ExposureTimer) -> ExposureStatus {
        timer.status()
    }

    /// Called once after `is_exposing` reported `Done`.
    fn end_exposure(&mut self) -> CamdResult<()> {
        Ok(())
    }

    /// Aborts a running exposure.
    fn stop_exposure(&mut self) -> CamdResult<()>;

    /// Prepares digitizing the frame described by `settings`.
    ///
    /// # Errors
    /// `HardwareFault` if the readout could not start.
    fn start_readout(&mut self, settings: &ExposureSettings) -> CamdResult<()>;

    /// Moves the next increment of pixel data through `readout`.
    fn do_readout(&mut self, readout: &mut Readout<'_>) -> ReadoutStatus;

    /// Called after a readout finished or was aborted.
    fn end_readout(&mut self) -> CamdResult<()> {
        Ok(())
    }

    /// Interrupts anything the hardware is doing; used on kill.
    fn cancel_priority_operations(&mut self) {}
}

/// Temperature control collaborator.
pub trait Cooling: Send {
    /// Sets the target temperature in degrees Celsius.
    ///
    /// # Errors
    /// `InvalidParameter` for a target the cooler cannot reach.
    fn set_cool_temp(&mut self, celsius: f64) -> CamdResult<()>;

    /// Turns regulation on or off.
    ///
    /// # Errors
    /// `HardwareFault` if the cooler does not respond.
    fn switch_cooling(&mut self, on: bool) -> CamdResult<()>;

    /// Current sensor temperature in degrees Celsius.
    fn temperature(&self) -> Option<f64>;

    /// Target temperature, when regulating.
    fn setpoint(&self) -> Option<f64>;
}

/// Filter wheel collaborator.
pub trait FilterWheel: Send {
    /// Current filter position.
    fn filter_num(&self) -> u32;

    /// Moves to `position`.
    ///
    /// # Errors
    /// `InvalidParameter` for a position past the wheel size.
    fn set_filter_num(&mut self, position: u32) -> CamdResult<()>;

    /// Number of positions.
    fn filter_count(&self) -> u32;
}
