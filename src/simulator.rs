//! Simulated camera hardware.
//!
//! Provides a [`ChipDriver`] that integrates against the software timer and
//! digitizes a synthetic gradient image a few rows per poll, plus a cooler and
//! a filter wheel. Useful for running the daemon and the tests without a
//! sensor attached.
//!
//! Faults can be injected through [`SimulatorControl`], which stays shared
//! with the test after the driver has been handed to a chip.
//!
//! # Pixel pattern
//!
//! Light frames carry `bias + ((x + y + frame) % 256) * 100`, dark frames only
//! the bias, so both the shutter and the used ROI can be checked in the bytes.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chip::ExposureSettings;
use crate::driver::{ChipDescriptor, ChipDriver, Cooling, ExposureTimer, FilterWheel};
use crate::error::{CamdError, CamdResult};
use crate::geometry::{Binning2D, DataType, Rect, Shutter};
use crate::status::{ExposureStatus, ReadoutStatus};
use crate::stream::Readout;

/// Bias level of every simulated pixel.
pub const SIMULATED_BIAS: u32 = 100;

// =============================================================================
// Configuration
// =============================================================================

fn default_name() -> String {
    "simulated".to_string()
}

fn default_size() -> u32 {
    1024
}

fn default_pixel_size() -> (f64, f64) {
    (9.0, 9.0)
}

fn default_binnings() -> Vec<Binning2D> {
    vec![Binning2D::unbinned(), Binning2D::new(2, 2)]
}

fn default_data_types() -> Vec<DataType> {
    vec![DataType::UShort]
}

fn default_channels() -> usize {
    1
}

fn default_rows_per_poll() -> u32 {
    16
}

fn default_retry_delay_us() -> u64 {
    1_000
}

/// Parameters of one simulated sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedChipConfig {
    /// Sensor name
    #[serde(default = "default_name")]
    pub name: String,

    /// Width in pixels
    #[serde(default = "default_size")]
    pub width: u32,

    /// Height in pixels
    #[serde(default = "default_size")]
    pub height: u32,

    /// Pixel pitch in micrometers
    #[serde(default = "default_pixel_size")]
    pub pixel_size: (f64, f64),

    /// Supported binnings, default first
    #[serde(default = "default_binnings")]
    pub binnings: Vec<Binning2D>,

    /// Supported data types, default first
    #[serde(default = "default_data_types")]
    pub data_types: Vec<DataType>,

    /// Number of output channels
    #[serde(default = "default_channels")]
    pub channels: usize,

    /// Whether the sensor supports frame transfer
    #[serde(default)]
    pub frame_transfer: bool,

    /// Binned rows digitized per readout step
    #[serde(default = "default_rows_per_poll")]
    pub rows_per_poll: u32,

    /// Every n-th readout step reports "retry later", 0 disables
    #[serde(default)]
    pub retry_every: u32,

    /// Delay requested by a retry
    #[serde(default = "default_retry_delay_us")]
    pub retry_delay_us: u64,
}

impl Default for SimulatedChipConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            width: default_size(),
            height: default_size(),
            pixel_size: default_pixel_size(),
            binnings: default_binnings(),
            data_types: default_data_types(),
            channels: default_channels(),
            frame_transfer: false,
            rows_per_poll: default_rows_per_poll(),
            retry_every: 0,
            retry_delay_us: default_retry_delay_us(),
        }
    }
}

// =============================================================================
// Control handle
// =============================================================================

/// Counts of driver calls made by the core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverCalls {
    /// `set_binning` calls
    pub set_binning: u32,
    /// `start_exposure` calls
    pub start_exposure: u32,
    /// `end_exposure` calls
    pub end_exposure: u32,
    /// `stop_exposure` calls
    pub stop_exposure: u32,
    /// `start_readout` calls
    pub start_readout: u32,
    /// `do_readout` calls
    pub do_readout: u32,
    /// `end_readout` calls
    pub end_readout: u32,
    /// `cancel_priority_operations` calls
    pub cancel: u32,
}

#[derive(Debug, Default)]
struct Faults {
    start_exposure: Option<String>,
    exposure: Option<String>,
    readout_after_rows: Option<(u32, String)>,
}

/// Shared handle to observe and perturb a [`SimulatedChip`].
#[derive(Debug, Default)]
pub struct SimulatorControl {
    calls: Mutex<DriverCalls>,
    faults: Mutex<Faults>,
}

impl SimulatorControl {
    /// Driver calls so far.
    pub fn calls(&self) -> DriverCalls {
        self.calls.lock().clone()
    }

    /// Makes the next `start_exposure` fail.
    pub fn fail_next_start(&self, message: impl Into<String>) {
        self.faults.lock().start_exposure = Some(message.into());
    }

    /// Makes `is_exposing` report a fault until cleared.
    pub fn fail_exposure(&self, message: impl Into<String>) {
        self.faults.lock().exposure = Some(message.into());
    }

    /// Makes the readout fail once `rows` binned rows have been produced.
    pub fn fail_readout_after(&self, rows: u32, message: impl Into<String>) {
        self.faults.lock().readout_after_rows = Some((rows, message.into()));
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }
}

// =============================================================================
// SimulatedChip
// =============================================================================

struct ActiveReadout {
    settings: ExposureSettings,
    frame: u32,
    row: u32,
    pending: Vec<Vec<u8>>,
}

/// Simulated sensor.
pub struct SimulatedChip {
    config: SimulatedChipConfig,
    control: Arc<SimulatorControl>,
    frames: u32,
    last_exposure: Option<ExposureSettings>,
    readout: Option<ActiveReadout>,
    steps: u32,
}

impl SimulatedChip {
    /// Creates a simulated sensor.
    pub fn new(config: SimulatedChipConfig) -> Self {
        Self {
            config,
            control: Arc::new(SimulatorControl::default()),
            frames: 0,
            last_exposure: None,
            readout: None,
            steps: 0,
        }
    }

    /// Handle for observing calls and injecting faults.
    pub fn control(&self) -> Arc<SimulatorControl> {
        Arc::clone(&self.control)
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_micros(self.config.retry_delay_us)
    }
}

impl ChipDriver for SimulatedChip {
    fn init(&mut self) -> CamdResult<ChipDescriptor> {
        info!(name = %self.config.name, width = self.config.width, height = self.config.height, "simulated chip opened");
        Ok(ChipDescriptor {
            name: self.config.name.clone(),
            size: Rect::full_sensor(self.config.width, self.config.height),
            pixel_size: self.config.pixel_size,
            binnings: self.config.binnings.clone(),
            data_types: self.config.data_types.clone(),
            channels: self.config.channels,
            frame_transfer: self.config.frame_transfer,
        })
    }

    fn set_binning(&mut self, binning: Binning2D) -> CamdResult<()> {
        self.control.calls.lock().set_binning += 1;
        debug!(binning = %binning, "simulated binning programmed");
        Ok(())
    }

    fn start_exposure(&mut self, settings: &ExposureSettings) -> CamdResult<()> {
        self.control.calls.lock().start_exposure += 1;
        if let Some(message) = self.control.faults.lock().start_exposure.take() {
            return Err(CamdError::HardwareFault(message));
        }
        self.last_exposure = Some(settings.clone());
        Ok(())
    }

    fn is_exposing(&mut self, timer: &ExposureTimer) -> ExposureStatus {
        if let Some(message) = self.control.faults.lock().exposure.clone() {
            return ExposureStatus::Error(message);
        }
        timer.status()
    }

    fn end_exposure(&mut self) -> CamdResult<()> {
        self.control.calls.lock().end_exposure += 1;
        self.frames += 1;
        Ok(())
    }

    fn stop_exposure(&mut self) -> CamdResult<()> {
        self.control.calls.lock().stop_exposure += 1;
        self.last_exposure = None;
        Ok(())
    }

    fn start_readout(&mut self, settings: &ExposureSettings) -> CamdResult<()> {
        self.control.calls.lock().start_readout += 1;
        self.readout = Some(ActiveReadout {
            settings: settings.clone(),
            frame: self.frames,
            row: 0,
            pending: vec![Vec::new(); settings.channels.len()],
        });
        Ok(())
    }

    fn do_readout(&mut self, readout: &mut Readout<'_>) -> ReadoutStatus {
        self.control.calls.lock().do_readout += 1;
        self.steps += 1;
        if self.config.retry_every > 0 && self.steps % self.config.retry_every == 0 {
            return ReadoutStatus::RetryAfter(self.retry_delay());
        }

        let retry = self.retry_delay();
        let rows_per_poll = self.config.rows_per_poll.max(1);
        let fault = self.control.faults.lock().readout_after_rows.clone();
        let Some(active) = self.readout.as_mut() else {
            return ReadoutStatus::Failed("readout was not started".into());
        };

        for _ in 0..rows_per_poll {
            if let Some(status) = flush(active, readout).interrupt(retry) {
                return status;
            }
            if active.row >= active.settings.height_binned() {
                return ReadoutStatus::Complete;
            }
            if let Some((rows, message)) = &fault {
                if active.row >= *rows {
                    return ReadoutStatus::Failed(message.clone());
                }
            }
            let row = render_row(&active.settings, active.frame, active.row);
            for pending in &mut active.pending {
                pending.extend_from_slice(&row);
            }
            active.row += 1;
        }
        if let Some(status) = flush(active, readout).interrupt(retry) {
            return status;
        }
        if active.row >= active.settings.height_binned() {
            ReadoutStatus::Complete
        } else {
            ReadoutStatus::Continue
        }
    }

    fn end_readout(&mut self) -> CamdResult<()> {
        self.control.calls.lock().end_readout += 1;
        self.readout = None;
        Ok(())
    }

    fn cancel_priority_operations(&mut self) {
        self.control.calls.lock().cancel += 1;
        self.readout = None;
        self.last_exposure = None;
    }
}

enum Flush {
    Drained,
    Blocked,
    Retry,
    Failed(String),
}

impl Flush {
    /// Status ending this step early, `None` when everything went out.
    fn interrupt(self, retry: Duration) -> Option<ReadoutStatus> {
        match self {
            Flush::Drained => None,
            Flush::Blocked => Some(ReadoutStatus::Continue),
            Flush::Retry => Some(ReadoutStatus::RetryAfter(retry)),
            Flush::Failed(message) => Some(ReadoutStatus::Failed(message)),
        }
    }
}

fn flush(active: &mut ActiveReadout, readout: &mut Readout<'_>) -> Flush {
    for (channel, pending) in active.pending.iter_mut().enumerate() {
        if pending.is_empty() {
            continue;
        }
        match readout.send_readout_data(channel, pending) {
            Ok(sent) => {
                pending.drain(..sent);
                if !pending.is_empty() {
                    return Flush::Blocked;
                }
            }
            Err(err) if err.is_transient() => return Flush::Retry,
            Err(err) => return Flush::Failed(err.to_string()),
        }
    }
    Flush::Drained
}

/// Value of binned pixel (`x`, `y`) of `frame`.
pub fn simulated_pixel(settings: &ExposureSettings, frame: u32, x: u32, y: u32) -> u32 {
    match settings.shutter {
        Shutter::Dark => SIMULATED_BIAS,
        Shutter::Light => {
            let column = settings.roi.x + x * settings.binning.horizontal;
            let line = settings.roi.y + y * settings.binning.vertical;
            SIMULATED_BIAS + (column.wrapping_add(line).wrapping_add(frame) % 256) * 100
        }
    }
}

fn render_row(settings: &ExposureSettings, frame: u32, row: u32) -> Vec<u8> {
    let width = settings.width_binned();
    let mut out = Vec::with_capacity(usize::try_from(settings.line_byte_size()).unwrap_or(0));
    for x in 0..width {
        let value = simulated_pixel(settings, frame, x, row);
        match settings.data_type {
            DataType::Byte => out.push(u8::try_from(value.min(255)).unwrap_or(u8::MAX)),
            DataType::SByte => out.push(i8::try_from(value.min(127)).unwrap_or(i8::MAX) as u8),
            DataType::Short => out.extend_from_slice(
                &i16::try_from(value.min(32_767)).unwrap_or(i16::MAX).to_le_bytes(),
            ),
            DataType::UShort => out.extend_from_slice(
                &u16::try_from(value.min(65_535)).unwrap_or(u16::MAX).to_le_bytes(),
            ),
            DataType::Long => out.extend_from_slice(
                &i32::try_from(value).unwrap_or(i32::MAX).to_le_bytes(),
            ),
            DataType::ULong => out.extend_from_slice(&value.to_le_bytes()),
            DataType::LongLong => out.extend_from_slice(&i64::from(value).to_le_bytes()),
            DataType::Float => out.extend_from_slice(&(value as f32).to_le_bytes()),
            DataType::Double => out.extend_from_slice(&f64::from(value).to_le_bytes()),
        }
    }
    out
}

// =============================================================================
// Auxiliary collaborators
// =============================================================================

/// Cooler that reaches its setpoint immediately.
#[derive(Debug, Clone)]
pub struct SimulatedCooler {
    ambient: f64,
    min_temp: f64,
    setpoint: Option<f64>,
    on: bool,
}

impl SimulatedCooler {
    /// Cooler at `ambient` that cannot go below `min_temp`.
    pub fn new(ambient: f64, min_temp: f64) -> Self {
        Self {
            ambient,
            min_temp,
            setpoint: None,
            on: false,
        }
    }
}

impl Cooling for SimulatedCooler {
    fn set_cool_temp(&mut self, celsius: f64) -> CamdResult<()> {
        if !celsius.is_finite() || celsius < self.min_temp || celsius > self.ambient {
            return Err(CamdError::InvalidParameter(format!(
                "setpoint {celsius} outside [{}, {}]",
                self.min_temp, self.ambient
            )));
        }
        self.setpoint = Some(celsius);
        self.on = true;
        Ok(())
    }

    fn switch_cooling(&mut self, on: bool) -> CamdResult<()> {
        self.on = on;
        Ok(())
    }

    fn temperature(&self) -> Option<f64> {
        match (self.on, self.setpoint) {
            (true, Some(setpoint)) => Some(setpoint),
            _ => Some(self.ambient),
        }
    }

    fn setpoint(&self) -> Option<f64> {
        self.setpoint.filter(|_| self.on)
    }
}

/// Filter wheel that moves instantly.
#[derive(Debug, Clone)]
pub struct SimulatedFilterWheel {
    count: u32,
    position: u32,
}

impl SimulatedFilterWheel {
    /// Wheel with `count` positions, parked at 0.
    pub fn new(count: u32) -> Self {
        Self {
            count: count.max(1),
            position: 0,
        }
    }
}

impl FilterWheel for SimulatedFilterWheel {
    fn filter_num(&self) -> u32 {
        self.position
    }

    fn set_filter_num(&mut self, position: u32) -> CamdResult<()> {
        if position >= self.count {
            return Err(CamdError::InvalidParameter(format!(
                "filter {position} not in wheel of {}",
                self.count
            )));
        }
        self.position = position;
        Ok(())
    }

    fn filter_count(&self) -> u32 {
        self.count
    }
}
