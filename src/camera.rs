//! Camera: the set of chips plus the exposure/readout state machine.
//!
//! A [`Camera`] owns its chips and optional collaborators. Client commands
//! are methods on it and return synchronously; long running work advances
//! only from [`Camera::idle`], which the daemon loop calls whenever the
//! previous hint expires.
//!
//! # Transitions
//!
//! | From | Event | To |
//! |---|---|---|
//! | Idle, Failed | expose with empty queue | Exposing |
//! | busy | expose | unchanged, request queued |
//! | Readout on a frame transfer chip | expose with empty queue | Exposing\|Readout |
//! | Exposing | exposure done, auto readout | Readout, Exposing\|Readout with a queued request |
//! | Exposing | exposure done, manual readout | Data |
//! | Data | readout | Readout |
//! | Exposing\|Readout | readout done | Exposing |
//! | Readout | readout done | Idle, Exposing with a queued request |
//! | any | hardware fault | Failed |

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::chip::{CameraChip, ExposureSettings};
use crate::config::CamdConfig;
use crate::connection::{ConnectionId, ConnectionRef};
use crate::driver::{ChipDriver, Cooling, FilterWheel};
use crate::error::{CamdError, CamdResult};
use crate::geometry::{Binning2D, DataType, Rect, Shutter};
use crate::queue::ExposureRequest;
use crate::simulator::{SimulatedChip, SimulatedCooler, SimulatedFilterWheel, SimulatorControl};
use crate::statistics::StatisticsSummary;
use crate::status::{ChipState, ExposureStatus, ReadoutStatus};

// =============================================================================
// Settings
// =============================================================================

/// Camera-wide behaviour, usually built from [`CamdConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    /// Camera name
    pub name: String,
    /// Upper bound on the number of chips
    pub max_chips: usize,
    /// Shortest accepted exposure
    pub exposure_min: Duration,
    /// Longest accepted exposure
    pub exposure_max: Duration,
    /// Start readout as soon as an exposure ends
    pub auto_readout: bool,
    /// Collect pixel statistics during readout
    pub statistics: bool,
    /// Poll hint when nothing is in flight
    pub idle_timeout: Duration,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self::from(&CamdConfig::default())
    }
}

impl From<&CamdConfig> for CameraSettings {
    fn from(config: &CamdConfig) -> Self {
        let camera = &config.camera;
        Self {
            name: camera.name.clone(),
            max_chips: camera.max_chips,
            exposure_min: Duration::try_from_secs_f64(camera.exposure_min).unwrap_or_default(),
            exposure_max: Duration::try_from_secs_f64(camera.exposure_max)
                .unwrap_or(Duration::MAX),
            auto_readout: camera.auto_readout,
            statistics: camera.statistics,
            idle_timeout: config.poll.idle_timeout(),
        }
    }
}

/// Result of an accepted `expose` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposeOutcome {
    /// The exposure started with this camera-wide number.
    Started {
        /// Exposure number
        exposure: u64,
    },
    /// The chip was busy; the request waits at this 1-based position.
    Queued {
        /// Queue position
        position: usize,
    },
}

// =============================================================================
// Status report
// =============================================================================

/// Snapshot of the camera for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct CameraInfo {
    /// Camera name
    pub name: String,
    /// Exposures started so far
    pub exposures: u64,
    /// Per chip status
    pub chips: Vec<ChipInfo>,
    /// Cooler status, when present
    pub cooler: Option<CoolerInfo>,
    /// Filter wheel status, when present
    pub filter: Option<FilterInfo>,
    /// Whether `shutdown` has run
    pub shut_down: bool,
}

/// Status of one chip.
#[derive(Debug, Clone, Serialize)]
pub struct ChipInfo {
    /// Chip index
    pub id: usize,
    /// Sensor name
    pub name: String,
    /// Derived state
    pub state: ChipState,
    /// Full readable area
    pub size: Rect,
    /// Live ROI
    pub window: Rect,
    /// Live binning
    pub binning: Binning2D,
    /// Live data type
    pub data_type: DataType,
    /// Live channel mask
    pub channels: Vec<bool>,
    /// Frame transfer support
    pub frame_transfer: bool,
    /// Requests waiting in the queue
    pub queued: usize,
    /// Settings of the last started exposure
    pub used: Option<ExposureSettings>,
    /// Recorded device error
    pub last_error: Option<String>,
    /// Outcome of the last readout
    pub last_readout: Option<ReadoutInfo>,
}

/// Outcome of a readout, as reported by `info`.
#[derive(Debug, Clone, Serialize)]
pub struct ReadoutInfo {
    /// Exposure number
    pub exposure: u64,
    /// Pixel bytes delivered
    pub bytes_sent: u64,
    /// Whether every channel was delivered
    pub complete: bool,
    /// Pixel statistics, when collected
    pub statistics: Option<StatisticsSummary>,
    /// Pixels per second
    pub speed: Option<f64>,
}

/// Cooler status.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CoolerInfo {
    /// Sensor temperature
    pub temperature: Option<f64>,
    /// Regulation target
    pub setpoint: Option<f64>,
}

/// Filter wheel status.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FilterInfo {
    /// Current position
    pub position: u32,
    /// Number of positions
    pub count: u32,
}

// =============================================================================
// Camera
// =============================================================================

/// All chips of one camera and the state machine driving them.
pub struct Camera {
    settings: CameraSettings,
    chips: Vec<CameraChip>,
    cooler: Option<Box<dyn Cooling>>,
    filter_wheel: Option<Box<dyn FilterWheel>>,
    exposures: u64,
    shut_down: bool,
}

impl std::fmt::Debug for Camera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Camera")
            .field("name", &self.settings.name)
            .field("chips", &self.chips)
            .field("exposures", &self.exposures)
            .field("shut_down", &self.shut_down)
            .finish_non_exhaustive()
    }
}

impl Camera {
    /// Initializes one chip per driver.
    ///
    /// # Errors
    /// * `InvalidParameter` - zero drivers, or more than `max_chips`
    /// * any driver init failure
    pub fn new(settings: CameraSettings, drivers: Vec<Box<dyn ChipDriver>>) -> CamdResult<Self> {
        if drivers.is_empty() || drivers.len() > settings.max_chips {
            return Err(CamdError::InvalidParameter(format!(
                "camera '{}' needs 1..={} chips, got {}",
                settings.name,
                settings.max_chips,
                drivers.len()
            )));
        }
        if settings.exposure_min > settings.exposure_max {
            return Err(CamdError::InvalidParameter(format!(
                "exposure_min {:?} exceeds exposure_max {:?}",
                settings.exposure_min, settings.exposure_max
            )));
        }

        let chips = drivers
            .into_iter()
            .enumerate()
            .map(|(id, driver)| CameraChip::new(id, driver, settings.statistics))
            .collect::<CamdResult<Vec<_>>>()?;

        info!(camera = %settings.name, chips = chips.len(), "camera initialized");
        Ok(Self {
            settings,
            chips,
            cooler: None,
            filter_wheel: None,
            exposures: 0,
            shut_down: false,
        })
    }

    /// Builds a simulated camera from configuration.
    ///
    /// Returns the control handle of every simulated chip, in chip order.
    ///
    /// # Errors
    /// Same as [`Camera::new`].
    pub fn simulated(config: &CamdConfig) -> CamdResult<(Self, Vec<std::sync::Arc<SimulatorControl>>)> {
        let mut controls = Vec::with_capacity(config.simulator.chips.len());
        let drivers: Vec<Box<dyn ChipDriver>> = config
            .simulator
            .chips
            .iter()
            .map(|chip| {
                let driver = SimulatedChip::new(chip.clone());
                controls.push(driver.control());
                Box::new(driver) as Box<dyn ChipDriver>
            })
            .collect();

        let mut camera = Self::new(CameraSettings::from(config), drivers)?;
        if let Some(cooler) = &config.cooler {
            camera = camera.with_cooler(Box::new(SimulatedCooler::new(
                cooler.ambient,
                cooler.min_temp,
            )));
        }
        if let Some(wheel) = &config.filter_wheel {
            camera = camera.with_filter_wheel(Box::new(SimulatedFilterWheel::new(wheel.positions)));
        }
        Ok((camera, controls))
    }

    /// Attaches a cooler.
    pub fn with_cooler(mut self, cooler: Box<dyn Cooling>) -> Self {
        self.cooler = Some(cooler);
        self
    }

    /// Attaches a filter wheel.
    pub fn with_filter_wheel(mut self, wheel: Box<dyn FilterWheel>) -> Self {
        self.filter_wheel = Some(wheel);
        self
    }

    /// Camera-wide behaviour.
    pub fn settings(&self) -> &CameraSettings {
        &self.settings
    }

    /// Number of chips.
    pub fn chip_count(&self) -> usize {
        self.chips.len()
    }

    /// All chips, by index.
    pub fn chips(&self) -> &[CameraChip] {
        &self.chips
    }

    /// Chip `id`.
    ///
    /// # Errors
    /// `InvalidParameter` for an unknown id.
    pub fn chip(&self, id: usize) -> CamdResult<&CameraChip> {
        let count = self.chips.len();
        self.chips.get(id).ok_or_else(|| unknown_chip(id, count))
    }

    fn chip_mut(&mut self, id: usize) -> CamdResult<&mut CameraChip> {
        let count = self.chips.len();
        self.chips.get_mut(id).ok_or_else(|| unknown_chip(id, count))
    }

    fn ensure_running(&self) -> CamdResult<()> {
        if self.shut_down {
            return Err(CamdError::ProtocolViolation(format!(
                "camera '{}' is shut down",
                self.settings.name
            )));
        }
        Ok(())
    }

    /// Exposures started so far.
    pub fn exposure_count(&self) -> u64 {
        self.exposures
    }

    /// Whether [`Camera::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    // =========================================================================
    // Exposure commands
    // =========================================================================

    /// Requests an exposure of `exptime` seconds on `chip`.
    ///
    /// Starts immediately when the chip can take it, otherwise queues the
    /// request behind the ones already waiting. Image data and the final
    /// status go to `connection`.
    ///
    /// # Errors
    /// * `InvalidParameter` - unknown chip, or an exposure time that is
    ///   negative, not finite or outside the configured range
    /// * `HardwareFault` - the driver refused to start
    pub fn expose(
        &mut self,
        chip: usize,
        shutter: Shutter,
        exptime: f64,
        connection: ConnectionRef,
    ) -> CamdResult<ExposeOutcome> {
        self.ensure_running()?;
        let exposure = self.validate_exptime(exptime)?;
        let filter = self.filter_wheel.as_ref().map(|w| w.filter_num());
        let number = self.exposures + 1;

        let target = self.chip_mut(chip)?;
        let request = ExposureRequest::new(chip, shutter, exposure, connection);
        if target.is_busy() {
            let position = target.enqueue(request);
            debug!(chip, position, "exposure queued");
            return Ok(ExposeOutcome::Queued { position });
        }

        target.clear_error();
        target.start_exposure(request, number, filter)?;
        self.exposures = number;
        Ok(ExposeOutcome::Started { exposure: number })
    }

    fn validate_exptime(&self, exptime: f64) -> CamdResult<Duration> {
        let exposure = Duration::try_from_secs_f64(exptime).map_err(|_| {
            CamdError::InvalidParameter(format!("invalid exposure time {exptime}"))
        })?;
        if exposure < self.settings.exposure_min || exposure > self.settings.exposure_max {
            return Err(CamdError::InvalidParameter(format!(
                "exposure time {exptime} outside [{}, {}]",
                self.settings.exposure_min.as_secs_f64(),
                self.settings.exposure_max.as_secs_f64()
            )));
        }
        Ok(exposure)
    }

    /// Aborts the running exposure and any frame awaiting readout, and cancels
    /// the queue. A readout already streaming continues.
    ///
    /// # Errors
    /// `InvalidParameter` for an unknown chip.
    pub fn stop_expose(&mut self, chip: usize) -> CamdResult<()> {
        let target = self.chip_mut(chip)?;
        target.stop_exposure("exposure stopped");
        target.cancel_queue(&CamdError::Cancelled("exposure stopped".into()));
        target.clear_error();
        info!(chip, "stop expose");
        Ok(())
    }

    /// Streams the exposed frame of `chip` to `connection`.
    ///
    /// Only needed when auto readout is off.
    ///
    /// # Errors
    /// * `ProtocolViolation` - no exposed frame, or a readout already running
    /// * `HardwareFault` - the readout could not start; the chip fails
    pub fn readout(&mut self, chip: usize, connection: ConnectionRef) -> CamdResult<()> {
        self.ensure_running()?;
        let target = self.chip_mut(chip)?;
        if !target.has_exposed_frame() {
            return Err(CamdError::ProtocolViolation(format!(
                "chip {chip} has no image to read out"
            )));
        }
        if let Err(err) = target.start_readout(Some(connection)) {
            if matches!(err, CamdError::HardwareFault(_)) {
                target.fail(err.clone());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Aborts the readout and any frame awaiting one, and cancels the queue.
    ///
    /// # Errors
    /// `InvalidParameter` for an unknown chip.
    pub fn stop_read(&mut self, chip: usize) -> CamdResult<()> {
        let target = self.chip_mut(chip)?;
        target.abort_readout("readout stopped");
        target.cancel_queue(&CamdError::Cancelled("readout stopped".into()));
        target.clear_error();
        info!(chip, "stop read");
        Ok(())
    }

    /// Aborts everything on every chip.
    pub fn kill_all(&mut self) {
        self.abort_everything("killed");
        info!(camera = %self.settings.name, "all operations killed");
    }

    fn abort_everything(&mut self, reason: &str) {
        let cancelled = CamdError::Cancelled(reason.to_string());
        for chip in &mut self.chips {
            chip.cancel_priority_operations();
            chip.stop_exposure(reason);
            chip.abort_readout(reason);
            chip.cancel_queue(&cancelled);
            chip.clear_error();
        }
    }

    /// Forgets a disconnected client on every chip.
    ///
    /// Its queued requests are dropped; its running cycles continue and their
    /// data is discarded.
    pub fn delete_connection(&mut self, connection: ConnectionId) {
        let removed: usize = self
            .chips
            .iter_mut()
            .map(|chip| chip.delete_connection(connection))
            .sum();
        debug!(connection, removed, "connection deleted");
    }

    // =========================================================================
    // Live settings
    // =========================================================================

    /// Sets the live binning of `chip`.
    ///
    /// # Errors
    /// `InvalidParameter` for an unknown chip or an undeclared binning.
    pub fn binning(&mut self, chip: usize, vertical: u32, horizontal: u32) -> CamdResult<()> {
        self.chip_mut(chip)?.set_binning(vertical, horizontal)
    }

    /// Sets the live ROI of `chip`; `-1` on an axis means the chip value.
    ///
    /// # Errors
    /// `OutOfRange` or `InvalidParameter`, see [`CameraChip::box_`].
    pub fn box_(&mut self, chip: usize, x: i32, y: i32, width: i32, height: i32) -> CamdResult<Rect> {
        self.chip_mut(chip)?.box_(x, y, width, height)
    }

    /// Centers a window on `chip`.
    ///
    /// # Errors
    /// See [`CameraChip::center`].
    pub fn center(&mut self, chip: usize, width: i32, height: i32) -> CamdResult<Rect> {
        self.chip_mut(chip)?.center(width, height)
    }

    /// Sets the live data type of `chip`.
    ///
    /// # Errors
    /// `InvalidParameter` for an unknown chip or an undeclared type.
    pub fn data_type(&mut self, chip: usize, data_type: DataType) -> CamdResult<()> {
        self.chip_mut(chip)?.set_data_type(data_type)
    }

    /// Sets which channels of `chip` are read out.
    ///
    /// # Errors
    /// `InvalidParameter` for an unknown chip or a bad mask.
    pub fn channels(&mut self, chip: usize, mask: &[bool]) -> CamdResult<()> {
        self.chip_mut(chip)?.set_channels(mask)
    }

    /// Restores the live defaults of `chip`.
    ///
    /// # Errors
    /// `InvalidParameter` for an unknown chip.
    pub fn reset_defaults(&mut self, chip: usize) -> CamdResult<()> {
        self.chip_mut(chip)?.reset_defaults();
        Ok(())
    }

    /// Bytes still owed on `channel` of the readout running on `chip`.
    ///
    /// # Errors
    /// `InvalidParameter` for an unknown chip, `ProtocolViolation` when the
    /// chip is not reading out.
    pub fn write_binary_data_size(&self, chip: usize, channel: usize) -> CamdResult<u64> {
        self.chip(chip)?.write_binary_data_size(channel)
    }

    // =========================================================================
    // Cooling and filter wheel
    // =========================================================================

    fn cooler_mut(&mut self) -> CamdResult<&mut Box<dyn Cooling>> {
        self.cooler
            .as_mut()
            .ok_or_else(|| CamdError::NotSupported("camera has no cooler".into()))
    }

    fn wheel(&self) -> CamdResult<&dyn FilterWheel> {
        self.filter_wheel
            .as_deref()
            .ok_or_else(|| CamdError::NotSupported("camera has no filter wheel".into()))
    }

    /// Sets the cooler target.
    ///
    /// # Errors
    /// `NotSupported` without a cooler, otherwise the cooler's error.
    pub fn set_cool_temp(&mut self, celsius: f64) -> CamdResult<()> {
        self.cooler_mut()?.set_cool_temp(celsius)?;
        info!(celsius, "cooler setpoint");
        Ok(())
    }

    /// Turns cooling on or off.
    ///
    /// # Errors
    /// `NotSupported` without a cooler.
    pub fn switch_cooling(&mut self, on: bool) -> CamdResult<()> {
        self.cooler_mut()?.switch_cooling(on)
    }

    /// Sensor temperature.
    ///
    /// # Errors
    /// `NotSupported` without a cooler.
    pub fn temperature(&self) -> CamdResult<Option<f64>> {
        self.cooler
            .as_ref()
            .map(|c| c.temperature())
            .ok_or_else(|| CamdError::NotSupported("camera has no cooler".into()))
    }

    /// Current filter position.
    ///
    /// # Errors
    /// `NotSupported` without a filter wheel.
    pub fn filter_num(&self) -> CamdResult<u32> {
        Ok(self.wheel()?.filter_num())
    }

    /// Number of filter positions.
    ///
    /// # Errors
    /// `NotSupported` without a filter wheel.
    pub fn filter_count(&self) -> CamdResult<u32> {
        Ok(self.wheel()?.filter_count())
    }

    /// Moves the filter wheel.
    ///
    /// # Errors
    /// * `NotSupported` - no filter wheel
    /// * `ProtocolViolation` - a chip is exposing
    /// * `InvalidParameter` - no such position
    pub fn set_filter_num(&mut self, position: u32) -> CamdResult<()> {
        if self.chips.iter().any(CameraChip::is_exposure_running) {
            return Err(CamdError::ProtocolViolation(
                "cannot move the filter wheel while exposing".into(),
            ));
        }
        let wheel = self
            .filter_wheel
            .as_mut()
            .ok_or_else(|| CamdError::NotSupported("camera has no filter wheel".into()))?;
        wheel.set_filter_num(position)?;
        info!(position, "filter changed");
        Ok(())
    }

    // =========================================================================
    // Poll loop
    // =========================================================================

    /// Advances every chip by one step.
    ///
    /// Returns how soon the loop should call again: zero while data flows or
    /// a transition just happened, the remaining exposure time while
    /// exposing, the driver's delay after a retry, and the idle timeout when
    /// nothing is in flight.
    pub fn idle(&mut self) -> Duration {
        if self.shut_down {
            return self.settings.idle_timeout;
        }
        let mut hint = self.settings.idle_timeout;
        for index in 0..self.chips.len() {
            hint = hint.min(self.poll_chip(index));
        }
        hint
    }

    fn poll_chip(&mut self, index: usize) -> Duration {
        let mut hint = self.settings.idle_timeout;

        match self.chips[index].is_exposing() {
            None => {}
            Some(ExposureStatus::Remaining(left)) => hint = hint.min(left),
            Some(ExposureStatus::Done) => {
                self.finish_exposure(index);
                hint = Duration::ZERO;
            }
            Some(ExposureStatus::Error(message)) => {
                self.chips[index].fail(CamdError::HardwareFault(message));
                return hint;
            }
        }

        match self.chips[index].do_readout() {
            None => {}
            Some(status @ (ReadoutStatus::Continue | ReadoutStatus::RetryAfter(_))) => {
                if let ReadoutStatus::RetryAfter(delay) = status {
                    debug!(chip = index, ?delay, "readout retry");
                }
                hint = status.next_poll().map_or(hint, |next| hint.min(next));
            }
            Some(ReadoutStatus::Complete) => {
                self.finish_readout(index);
                hint = Duration::ZERO;
            }
            Some(ReadoutStatus::Failed(message)) => {
                self.chips[index].fail(CamdError::HardwareFault(message));
                return hint;
            }
        }

        hint
    }

    fn finish_exposure(&mut self, index: usize) {
        let auto_readout = self.settings.auto_readout;
        let chip = &mut self.chips[index];
        chip.end_exposure();

        if auto_readout && !chip.is_reading() {
            if let Err(err) = chip.start_readout(None) {
                chip.fail(err);
                return;
            }
        }
        if chip.supports_frame_transfer() {
            self.start_next(index);
        }
    }

    fn finish_readout(&mut self, index: usize) {
        let auto_readout = self.settings.auto_readout;
        let chip = &mut self.chips[index];
        if let Some(summary) = chip.end_readout(true) {
            if let Some(stats) = summary.statistics {
                debug!(
                    chip = index,
                    exposure = summary.settings.number,
                    min = stats.min,
                    max = stats.max,
                    average = stats.average,
                    "frame statistics"
                );
            }
        }

        if chip.has_exposed_frame() {
            if !auto_readout {
                return;
            }
            if let Err(err) = chip.start_readout(None) {
                chip.fail(err);
                return;
            }
        }
        self.start_next(index);
    }

    /// Starts the oldest queued request if the chip can take it.
    fn start_next(&mut self, index: usize) {
        let filter = self.filter_wheel.as_ref().map(|w| w.filter_num());
        let chip = &mut self.chips[index];
        let can_start = !chip.is_exposure_running()
            && !chip.has_exposed_frame()
            && (!chip.is_reading() || chip.supports_frame_transfer());
        if !can_start {
            return;
        }
        let Some(request) = chip.drain_next() else {
            return;
        };

        let number = self.exposures + 1;
        chip.clear_error();
        match chip.start_exposure(request.clone(), number, filter) {
            Ok(()) => self.exposures = number,
            Err(err) => chip.fail_queued_start(&request, err),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Aborts everything and releases every connection. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.abort_everything("camera shut down");
        if let Some(cooler) = self.cooler.as_mut() {
            if let Err(err) = cooler.switch_cooling(false) {
                warn!(error = %err, "failed to switch cooling off");
            }
        }
        self.shut_down = true;
        info!(camera = %self.settings.name, exposures = self.exposures, "camera shut down");
    }

    /// Status of the camera and every chip.
    pub fn info(&self) -> CameraInfo {
        CameraInfo {
            name: self.settings.name.clone(),
            exposures: self.exposures,
            chips: self.chips.iter().map(chip_info).collect(),
            cooler: self.cooler.as_ref().map(|c| CoolerInfo {
                temperature: c.temperature(),
                setpoint: c.setpoint(),
            }),
            filter: self.filter_wheel.as_ref().map(|w| FilterInfo {
                position: w.filter_num(),
                count: w.filter_count(),
            }),
            shut_down: self.shut_down,
        }
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn unknown_chip(id: usize, count: usize) -> CamdError {
    CamdError::InvalidParameter(format!("no chip {id}, camera has {count}"))
}

fn chip_info(chip: &CameraChip) -> ChipInfo {
    let descriptor = chip.descriptor();
    ChipInfo {
        id: chip.id(),
        name: descriptor.name.clone(),
        state: chip.state(),
        size: descriptor.size,
        window: chip.window(),
        binning: chip.binning(),
        data_type: chip.data_type(),
        channels: chip.channels().mask().to_vec(),
        frame_transfer: descriptor.frame_transfer,
        queued: chip.queue().len(),
        used: chip.used_settings().cloned(),
        last_error: chip.last_error().map(ToString::to_string),
        last_readout: chip.last_readout().map(|r| ReadoutInfo {
            exposure: r.settings.number,
            bytes_sent: r.bytes_sent,
            complete: r.complete,
            statistics: r.statistics,
            speed: r.speed,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemoryConnection;
    use crate::simulator::SimulatedChipConfig;
    use std::sync::Arc;

    fn camera(chips: Vec<SimulatedChipConfig>) -> Camera {
        let mut config = CamdConfig::default();
        config.simulator.chips = chips;
        Camera::simulated(&config).unwrap().0
    }

    fn small_chip() -> SimulatedChipConfig {
        SimulatedChipConfig {
            width: 16,
            height: 16,
            ..SimulatedChipConfig::default()
        }
    }

    #[test]
    fn test_chip_count_is_checked() {
        let settings = CameraSettings {
            max_chips: 1,
            ..CameraSettings::default()
        };
        let too_many: Vec<Box<dyn ChipDriver>> = vec![
            Box::new(SimulatedChip::new(small_chip())),
            Box::new(SimulatedChip::new(small_chip())),
        ];
        assert!(matches!(
            Camera::new(settings.clone(), too_many),
            Err(CamdError::InvalidParameter(_))
        ));
        assert!(Camera::new(settings, Vec::new()).is_err());
    }

    #[test]
    fn test_unknown_chip_is_rejected() {
        let mut camera = camera(vec![small_chip()]);
        let conn = MemoryConnection::new("client").shared();
        let err = camera.expose(3, Shutter::Light, 1.0, conn).unwrap_err();
        assert!(matches!(err, CamdError::InvalidParameter(_)));
        assert!(camera.box_(1, 0, 0, 1, 1).is_err());
    }

    #[test]
    fn test_exptime_validation() {
        let mut config = CamdConfig::default();
        config.simulator.chips = vec![small_chip()];
        config.camera.exposure_min = 0.5;
        config.camera.exposure_max = 10.0;
        let (mut camera, _) = Camera::simulated(&config).unwrap();
        let conn = MemoryConnection::new("client").shared();

        for bad in [-1.0, f64::NAN, f64::INFINITY, 0.1, 11.0] {
            let err = camera
                .expose(0, Shutter::Light, bad, conn.clone())
                .unwrap_err();
            assert!(matches!(err, CamdError::InvalidParameter(_)), "{bad}");
        }
        assert_eq!(camera.chip(0).unwrap().state(), ChipState::Idle);
        assert_eq!(camera.exposure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_untimeable_exposure_is_rejected() {
        let mut config = CamdConfig::default();
        config.simulator.chips = vec![small_chip()];
        config.camera.exposure_max = 1e300;
        let (mut camera, controls) = Camera::simulated(&config).unwrap();
        let conn = MemoryConnection::new("client").shared();

        let err = camera
            .expose(0, Shutter::Light, 1e19, conn.clone())
            .unwrap_err();
        assert!(matches!(err, CamdError::InvalidParameter(_)));
        assert_eq!(controls[0].calls().start_exposure, 0);
        assert_eq!(camera.chip(0).unwrap().state(), ChipState::Idle);
        assert_eq!(camera.exposure_count(), 0);
        assert!(conn.failures().is_empty());
    }

    #[test]
    fn test_missing_collaborators_are_not_supported() {
        let mut camera = camera(vec![small_chip()]);
        assert!(matches!(camera.set_cool_temp(-10.0), Err(CamdError::NotSupported(_))));
        assert!(matches!(camera.temperature(), Err(CamdError::NotSupported(_))));
        assert!(matches!(camera.set_filter_num(1), Err(CamdError::NotSupported(_))));
        assert!(matches!(camera.filter_num(), Err(CamdError::NotSupported(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_change_rejected_while_exposing() {
        let mut config = CamdConfig::default();
        config.simulator.chips = vec![small_chip()];
        config.filter_wheel = Some(crate::config::FilterWheelConfig { positions: 4 });
        let (mut camera, _) = Camera::simulated(&config).unwrap();
        let conn = MemoryConnection::new("client").shared();

        camera.set_filter_num(2).unwrap();
        camera.expose(0, Shutter::Light, 5.0, conn).unwrap();
        assert!(matches!(camera.set_filter_num(1), Err(CamdError::ProtocolViolation(_))));
        assert_eq!(camera.filter_num().unwrap(), 2);
        assert_eq!(
            camera.chip(0).unwrap().exposure_settings().unwrap().filter,
            Some(2)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_hint_tracks_exposure() {
        let mut camera = camera(vec![small_chip()]);
        assert_eq!(camera.idle(), camera.settings().idle_timeout);

        let conn = MemoryConnection::new("client").shared();
        camera.expose(0, Shutter::Light, 0.25, conn).unwrap();
        assert_eq!(camera.idle(), Duration::from_millis(250));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(camera.idle(), Duration::from_millis(150));
    }

    #[test]
    fn test_shutdown_is_idempotent_and_releases_connections() {
        let mut camera = camera(vec![small_chip()]);
        let conn = MemoryConnection::new("client").shared();
        let as_ref: ConnectionRef = conn.clone();
        camera.expose(0, Shutter::Light, 100.0, as_ref.clone()).unwrap();
        camera.expose(0, Shutter::Light, 1.0, as_ref.clone()).unwrap();
        drop(as_ref);

        camera.shutdown();
        camera.shutdown();
        assert!(camera.is_shut_down());
        assert_eq!(Arc::strong_count(&conn), 1);
        assert_eq!(conn.failures().len(), 2);
        assert!(camera.expose(0, Shutter::Light, 1.0, conn.clone()).is_err());
    }

    #[test]
    fn test_info_serializes() {
        let mut camera = camera(vec![small_chip()]);
        camera.box_(0, 2, 2, 8, 8).unwrap();
        let info = camera.info();
        assert_eq!(info.chips.len(), 1);
        assert_eq!(info.chips[0].window, Rect::new(2, 2, 8, 8));

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["chips"][0]["state"], "idle");
        assert!(json["cooler"].is_null());
    }
}
