//! One sensor and its exposure/readout cycles.
//!
//! A chip keeps two kinds of state. The *live* ROI, binning, data type and
//! channel mask are what clients change with `box`, `binning` and friends.
//! The *used* values are copied into an [`ExposureSettings`] when an exposure
//! starts, and only that copy is consulted until the frame is read out. With
//! frame transfer two copies coexist: the frame streaming out and the frame
//! integrating.
//!
//! The chip provides the primitives; [`crate::camera::Camera`] decides when to
//! call them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionId, ConnectionRef};
use crate::driver::{ChipDescriptor, ChipDriver, ExposureTimer};
use crate::error::{CamdError, CamdResult};
use crate::geometry::{Binning2D, DataType, Rect, Shutter};
use crate::queue::{ExposureQueue, ExposureRequest};
use crate::statistics::StatisticsSummary;
use crate::status::{ChipState, ExposureStatus, ReadoutStatus};
use crate::stream::{DataChannels, Readout, ReadoutStream};

/// Immutable snapshot of everything one frame is taken with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExposureSettings {
    /// Camera-wide exposure number
    pub number: u64,
    /// Chip index
    pub chip: usize,
    /// Used ROI
    pub roi: Rect,
    /// Used binning
    pub binning: Binning2D,
    /// Used pixel data type
    pub data_type: DataType,
    /// Physical indices of the enabled channels
    pub channels: Vec<usize>,
    /// Light or dark
    pub shutter: Shutter,
    /// Integration time
    pub exposure: Duration,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// Filter position at start
    pub filter: Option<u32>,
}

impl ExposureSettings {
    /// Output columns after binning.
    pub fn width_binned(&self) -> u32 {
        self.roi.width.div_ceil(self.binning.horizontal.max(1))
    }

    /// Output rows after binning.
    pub fn height_binned(&self) -> u32 {
        self.roi.height.div_ceil(self.binning.vertical.max(1))
    }

    /// Output pixels per channel.
    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width_binned()) * u64::from(self.height_binned())
    }

    /// Bytes per channel.
    pub fn chip_byte_size(&self) -> u64 {
        self.pixel_count() * u64::from(self.data_type.pixel_byte_size())
    }

    /// Bytes in one binned output row.
    pub fn line_byte_size(&self) -> u64 {
        u64::from(self.width_binned()) * u64::from(self.data_type.pixel_byte_size())
    }
}

struct ExposureCycle {
    settings: ExposureSettings,
    timer: ExposureTimer,
    connection: Option<ConnectionRef>,
}

/// Frame whose exposure ended and that waits to be read out.
struct ExposedFrame {
    settings: ExposureSettings,
    connection: Option<ConnectionRef>,
}

struct ReadoutCycle {
    settings: ExposureSettings,
    stream: ReadoutStream,
}

/// Outcome of a finished or aborted readout.
#[derive(Debug, Clone)]
pub struct ReadoutSummary {
    /// Frame that was read
    pub settings: ExposureSettings,
    /// Pixel bytes delivered across channels
    pub bytes_sent: u64,
    /// Whether every channel was delivered in full
    pub complete: bool,
    /// Pixel statistics, when collected
    pub statistics: Option<StatisticsSummary>,
    /// Pixels per second
    pub speed: Option<f64>,
}

/// A sensor owned by the camera.
pub struct CameraChip {
    id: usize,
    descriptor: ChipDescriptor,
    driver: Box<dyn ChipDriver>,
    window: Rect,
    binning: Binning2D,
    programmed_binning: Option<Binning2D>,
    data_type: DataType,
    channels: DataChannels,
    exposure: Option<ExposureCycle>,
    exposed: Option<ExposedFrame>,
    readout: Option<ReadoutCycle>,
    queue: ExposureQueue,
    used: Option<ExposureSettings>,
    last_error: Option<CamdError>,
    last_readout: Option<ReadoutSummary>,
    collect_statistics: bool,
}

impl std::fmt::Debug for CameraChip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraChip")
            .field("id", &self.id)
            .field("name", &self.descriptor.name)
            .field("state", &self.state())
            .field("window", &self.window)
            .field("binning", &self.binning)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl CameraChip {
    /// Initializes `driver` and builds the chip with full-frame defaults.
    ///
    /// # Errors
    /// Driver init failures, or an unusable descriptor.
    pub fn new(id: usize, mut driver: Box<dyn ChipDriver>, collect_statistics: bool) -> CamdResult<Self> {
        let descriptor = driver.init()?;
        descriptor.validate()?;

        let binning = descriptor.binnings[0];
        let data_type = descriptor.data_types[0];
        info!(
            chip = id,
            name = %descriptor.name,
            size = %descriptor.size,
            channels = descriptor.channels,
            frame_transfer = descriptor.frame_transfer,
            "chip initialized"
        );

        Ok(Self {
            id,
            window: descriptor.size,
            binning,
            programmed_binning: None,
            data_type,
            channels: DataChannels::new(descriptor.channels),
            descriptor,
            driver,
            exposure: None,
            exposed: None,
            readout: None,
            queue: ExposureQueue::new(),
            used: None,
            last_error: None,
            last_readout: None,
            collect_statistics,
        })
    }

    // =========================================================================
    // Live settings
    // =========================================================================

    /// Chip index.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Geometry and capabilities reported by the driver.
    pub fn descriptor(&self) -> &ChipDescriptor {
        &self.descriptor
    }

    /// Live ROI.
    pub fn window(&self) -> Rect {
        self.window
    }

    /// Live binning.
    pub fn binning(&self) -> Binning2D {
        self.binning
    }

    /// Live data type.
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Live channel mask.
    pub fn channels(&self) -> &DataChannels {
        &self.channels
    }

    /// Whether the sensor supports frame transfer.
    pub fn supports_frame_transfer(&self) -> bool {
        self.descriptor.frame_transfer
    }

    /// Sets the live binning.
    ///
    /// # Errors
    /// `InvalidParameter` if the driver does not declare this binning.
    pub fn set_binning(&mut self, vertical: u32, horizontal: u32) -> CamdResult<()> {
        let requested = Binning2D::new(vertical, horizontal);
        if !self.descriptor.binnings.contains(&requested) {
            return Err(CamdError::InvalidParameter(format!(
                "chip {} does not support binning {requested}",
                self.id
            )));
        }
        self.binning = requested;
        debug!(chip = self.id, binning = %requested, "binning set");
        Ok(())
    }

    /// Sets the live ROI; `-1` on an axis takes the chip value.
    ///
    /// # Errors
    /// `OutOfRange` when the box leaves the chip, `InvalidParameter` for
    /// malformed values.
    pub fn box_(&mut self, x: i32, y: i32, width: i32, height: i32) -> CamdResult<Rect> {
        let window = Rect::resolve(&self.descriptor.size, x, y, width, height)?;
        self.window = window;
        debug!(chip = self.id, window = %window, "box set");
        Ok(window)
    }

    /// Centers a `width` x `height` window, see [`Rect::centered`].
    ///
    /// # Errors
    /// Same as [`CameraChip::box_`].
    pub fn center(&mut self, width: i32, height: i32) -> CamdResult<Rect> {
        let centered = Rect::centered(&self.descriptor.size, width, height);
        let offset = |origin: u32, v: u32| i32::try_from(origin + v).unwrap_or(i32::MAX);
        let size = |v: u32| i32::try_from(v).unwrap_or(i32::MAX);
        self.box_(
            offset(self.descriptor.size.x, centered.x),
            offset(self.descriptor.size.y, centered.y),
            size(centered.width),
            size(centered.height),
        )
    }

    /// Sets the live data type.
    ///
    /// # Errors
    /// `InvalidParameter` if the driver does not declare it.
    pub fn set_data_type(&mut self, data_type: DataType) -> CamdResult<()> {
        if !self.descriptor.data_types.contains(&data_type) {
            return Err(CamdError::InvalidParameter(format!(
                "chip {} does not support data type {data_type}",
                self.id
            )));
        }
        self.data_type = data_type;
        Ok(())
    }

    /// Sets which channels are read out.
    ///
    /// # Errors
    /// See [`DataChannels::set_mask`].
    pub fn set_channels(&mut self, mask: &[bool]) -> CamdResult<()> {
        self.channels.set_mask(mask)
    }

    /// Restores full frame, default binning and default data type.
    pub fn reset_defaults(&mut self) {
        self.window = self.descriptor.size;
        self.binning = self.descriptor.binnings[0];
        self.data_type = self.descriptor.data_types[0];
        debug!(chip = self.id, "live settings reset to defaults");
    }

    /// Bytes per channel a frame taken now would produce.
    pub fn live_chip_byte_size(&self) -> u64 {
        let width = u64::from(self.window.width.div_ceil(self.binning.horizontal));
        let height = u64::from(self.window.height.div_ceil(self.binning.vertical));
        width * height * u64::from(self.data_type.pixel_byte_size())
    }

    // =========================================================================
    // Used settings
    // =========================================================================

    /// Snapshot of the most recently started exposure.
    pub fn used_settings(&self) -> Option<&ExposureSettings> {
        self.used.as_ref()
    }

    /// Used ROI, the live ROI before the first exposure.
    pub fn used_roi(&self) -> Rect {
        self.used.as_ref().map_or(self.window, |s| s.roi)
    }

    /// Used binning, the live binning before the first exposure.
    pub fn used_binning(&self) -> Binning2D {
        self.used.as_ref().map_or(self.binning, |s| s.binning)
    }

    /// Used output width.
    pub fn used_width_binned(&self) -> u32 {
        self.used_roi().width.div_ceil(self.used_binning().horizontal)
    }

    /// Used output height.
    pub fn used_height_binned(&self) -> u32 {
        self.used_roi().height.div_ceil(self.used_binning().vertical)
    }

    /// Bytes per channel of the used frame.
    pub fn chip_byte_size(&self) -> u64 {
        match &self.used {
            Some(settings) => settings.chip_byte_size(),
            None => self.live_chip_byte_size(),
        }
    }

    /// Snapshot of the frame currently streaming.
    pub fn readout_settings(&self) -> Option<&ExposureSettings> {
        self.readout.as_ref().map(|r| &r.settings)
    }

    /// Snapshot of the frame currently integrating.
    pub fn exposure_settings(&self) -> Option<&ExposureSettings> {
        self.exposure.as_ref().map(|e| &e.settings)
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Observable state derived from the cycles in flight.
    pub fn state(&self) -> ChipState {
        match (self.exposure.is_some(), self.readout.is_some()) {
            (true, true) => ChipState::ExposingReadout,
            (true, false) => ChipState::Exposing,
            (false, true) => ChipState::Readout,
            (false, false) if self.exposed.is_some() => ChipState::Data,
            (false, false) if self.last_error.is_some() => ChipState::Failed,
            (false, false) => ChipState::Idle,
        }
    }

    /// True while an exposure integrates.
    pub fn is_exposure_running(&self) -> bool {
        self.exposure.is_some()
    }

    /// True while a readout streams.
    pub fn is_reading(&self) -> bool {
        self.readout.is_some()
    }

    /// True when an exposed frame waits for readout.
    pub fn has_exposed_frame(&self) -> bool {
        self.exposed.is_some()
    }

    /// Whether a new exposure has to wait in the queue.
    pub fn is_busy(&self) -> bool {
        self.exposure.is_some()
            || self.exposed.is_some()
            || (self.readout.is_some() && !self.descriptor.frame_transfer)
            || !self.queue.is_empty()
    }

    /// Error of the last failed cycle.
    pub fn last_error(&self) -> Option<&CamdError> {
        self.last_error.as_ref()
    }

    /// Clears the recorded device error.
    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// Summary of the last readout.
    pub fn last_readout(&self) -> Option<&ReadoutSummary> {
        self.last_readout.as_ref()
    }

    /// Bytes still owed on `channel` of the current readout.
    ///
    /// # Errors
    /// `ProtocolViolation` when no readout is active.
    pub fn write_binary_data_size(&self, channel: usize) -> CamdResult<u64> {
        self.readout
            .as_ref()
            .map(|r| r.stream.write_binary_data_size(channel))
            .ok_or_else(|| {
                CamdError::ProtocolViolation(format!("chip {} is not reading out", self.id))
            })
    }

    /// Times the current readout's streams reached zero.
    pub fn drain_events(&self) -> Option<u32> {
        self.readout.as_ref().map(|r| r.stream.drain_events())
    }

    /// Pending exposures.
    pub fn queue(&self) -> &ExposureQueue {
        &self.queue
    }

    /// Adds a request to the queue, returns its position.
    pub fn enqueue(&mut self, request: ExposureRequest) -> usize {
        self.queue.enqueue(request)
    }

    /// Pops the next queued request.
    pub fn drain_next(&mut self) -> Option<ExposureRequest> {
        self.queue.drain_next()
    }

    // =========================================================================
    // Exposure
    // =========================================================================

    /// Snapshots the live settings and starts integrating.
    ///
    /// # Errors
    /// * `ProtocolViolation` - an exposure is already running
    /// * `HardwareFault` - the driver refused to start
    pub fn start_exposure(
        &mut self,
        request: ExposureRequest,
        number: u64,
        filter: Option<u32>,
    ) -> CamdResult<()> {
        if self.exposure.is_some() {
            return Err(CamdError::ProtocolViolation(format!(
                "chip {} is already exposing",
                self.id
            )));
        }

        let settings = ExposureSettings {
            number,
            chip: self.id,
            roi: self.window,
            binning: self.binning,
            data_type: self.data_type,
            channels: self.channels.enabled_physical(),
            shutter: request.shutter,
            exposure: request.exposure,
            started_at: Utc::now(),
            filter,
        };

        let timer = ExposureTimer::start(settings.exposure)?;
        if self.programmed_binning != Some(settings.binning) {
            self.driver
                .set_binning(settings.binning)
                .map_err(hardware_fault)?;
            self.programmed_binning = Some(settings.binning);
        }
        self.driver
            .start_exposure(&settings)
            .map_err(hardware_fault)?;

        info!(
            chip = self.id,
            exposure = number,
            exptime = settings.exposure.as_secs_f64(),
            roi = %settings.roi,
            binning = %settings.binning,
            shutter = ?settings.shutter,
            "exposure started"
        );
        self.used = Some(settings.clone());
        self.exposure = Some(ExposureCycle {
            timer,
            settings,
            connection: Some(request.connection),
        });
        Ok(())
    }

    /// Progress of the running exposure, `None` when nothing integrates.
    ///
    /// Keeps answering `Done` until [`CameraChip::end_exposure`] is called.
    pub fn is_exposing(&mut self) -> Option<ExposureStatus> {
        let cycle = self.exposure.as_ref()?;
        Some(self.driver.is_exposing(&cycle.timer))
    }

    /// Ends the finished exposure; the frame now waits for readout.
    ///
    /// Returns false when no exposure was running.
    pub fn end_exposure(&mut self) -> bool {
        let Some(cycle) = self.exposure.take() else {
            return false;
        };
        if let Err(err) = self.driver.end_exposure() {
            warn!(chip = self.id, error = %err, "driver end_exposure failed");
        }
        info!(chip = self.id, exposure = cycle.settings.number, "exposure finished");
        self.exposed = Some(ExposedFrame {
            settings: cycle.settings,
            connection: cycle.connection,
        });
        true
    }

    /// Aborts the running exposure and drops any frame waiting for readout.
    ///
    /// Their clients receive `Cancelled`. Returns true if anything was stopped.
    pub fn stop_exposure(&mut self, reason: &str) -> bool {
        let mut stopped = false;
        if let Some(cycle) = self.exposure.take() {
            if let Err(err) = self.driver.stop_exposure() {
                warn!(chip = self.id, error = %err, "driver stop_exposure failed");
            }
            notify_cancelled(cycle.connection.as_ref(), reason);
            info!(chip = self.id, exposure = cycle.settings.number, "exposure stopped");
            stopped = true;
        }
        if let Some(frame) = self.exposed.take() {
            notify_cancelled(frame.connection.as_ref(), reason);
            stopped = true;
        }
        stopped
    }

    // =========================================================================
    // Readout
    // =========================================================================

    /// Starts streaming the exposed frame.
    ///
    /// `connection` overrides the client that requested the exposure.
    ///
    /// # Errors
    /// * `ProtocolViolation` - no exposed frame, or a readout is already running
    /// * `HardwareFault` - the driver or the connection refused to start
    pub fn start_readout(&mut self, connection: Option<ConnectionRef>) -> CamdResult<()> {
        if self.readout.is_some() {
            return Err(CamdError::ProtocolViolation(format!(
                "chip {} is already reading out",
                self.id
            )));
        }
        let frame = self.exposed.as_ref().ok_or_else(|| {
            CamdError::ProtocolViolation(format!("chip {} has no image to read out", self.id))
        })?;

        let target = connection.or_else(|| frame.connection.clone());
        let stream = ReadoutStream::open(&frame.settings, target, self.collect_statistics)
            .map_err(hardware_fault)?;
        if let Err(err) = self.driver.start_readout(&frame.settings) {
            stream.close(false);
            return Err(hardware_fault(err));
        }

        let Some(frame) = self.exposed.take() else {
            return Err(CamdError::ProtocolViolation(format!(
                "chip {} lost its exposed frame",
                self.id
            )));
        };
        info!(
            chip = self.id,
            exposure = frame.settings.number,
            bytes = frame.settings.chip_byte_size()
                * u64::try_from(frame.settings.channels.len()).unwrap_or(u64::MAX),
            "readout started"
        );
        self.readout = Some(ReadoutCycle {
            settings: frame.settings,
            stream,
        });
        Ok(())
    }

    /// Runs one readout step; `None` when no readout is active.
    ///
    /// A step that leaves every channel drained reports `Complete`. A driver
    /// that claims completion while bytes are still owed reports `Failed`.
    pub fn do_readout(&mut self) -> Option<ReadoutStatus> {
        let cycle = self.readout.as_mut()?;
        if cycle.stream.all_drained() {
            return Some(ReadoutStatus::Complete);
        }

        let status = {
            let mut readout = Readout::new(&cycle.settings, &mut cycle.stream);
            self.driver.do_readout(&mut readout)
        };

        let status = match status {
            ReadoutStatus::Continue | ReadoutStatus::RetryAfter(_) if cycle.stream.all_drained() => {
                ReadoutStatus::Complete
            }
            ReadoutStatus::Complete if !cycle.stream.all_drained() => ReadoutStatus::Failed(format!(
                "driver finished readout with {} bytes outstanding",
                cycle.stream.total_remaining()
            )),
            other => other,
        };
        Some(status)
    }

    /// Ends the readout and closes the client streams.
    pub fn end_readout(&mut self, complete: bool) -> Option<ReadoutSummary> {
        let cycle = self.readout.take()?;
        if let Err(err) = self.driver.end_readout() {
            warn!(chip = self.id, error = %err, "driver end_readout failed");
        }
        let complete = complete && cycle.stream.all_drained();
        cycle.stream.close(complete);

        let summary = ReadoutSummary {
            bytes_sent: cycle.stream.total_sent(),
            complete,
            statistics: cycle.stream.statistics(),
            speed: cycle.stream.speed(cycle.settings.data_type.pixel_byte_size()),
            settings: cycle.settings,
        };
        if complete {
            if let Some(conn) = cycle.stream.connection() {
                conn.command_ok(&format!(
                    "chip {} exposure {} read out",
                    self.id, summary.settings.number
                ));
            }
            info!(
                chip = self.id,
                exposure = summary.settings.number,
                bytes = summary.bytes_sent,
                pixels_per_second = summary.speed.unwrap_or(0.0),
                "readout finished"
            );
        } else {
            notify_cancelled(cycle.stream.connection(), "readout aborted");
            info!(
                chip = self.id,
                exposure = summary.settings.number,
                bytes = summary.bytes_sent,
                "readout aborted"
            );
        }
        self.last_readout = Some(summary.clone());
        Some(summary)
    }

    /// Aborts the readout and drops any frame waiting for one.
    ///
    /// Returns true if anything was aborted.
    pub fn abort_readout(&mut self, reason: &str) -> bool {
        let mut aborted = self.end_readout(false).is_some();
        if let Some(frame) = self.exposed.take() {
            notify_cancelled(frame.connection.as_ref(), reason);
            aborted = true;
        }
        aborted
    }

    // =========================================================================
    // Cancellation and failure
    // =========================================================================

    /// Empties the queue, reporting `error` to every waiting client.
    pub fn cancel_queue(&mut self, error: &CamdError) -> usize {
        let cancelled = self.queue.cancel_all();
        for request in &cancelled {
            request.connection.command_failed(error);
        }
        if !cancelled.is_empty() {
            info!(chip = self.id, count = cancelled.len(), "queued exposures cancelled");
        }
        cancelled.len()
    }

    /// Asks the driver to interrupt whatever it is doing.
    pub fn cancel_priority_operations(&mut self) {
        self.driver.cancel_priority_operations();
    }

    /// Aborts every cycle in flight after a hardware fault.
    ///
    /// Each affected client gets the error once, the queue is drained and the
    /// error stays recorded until the next exposure starts.
    pub fn fail(&mut self, fault: CamdError) {
        error!(chip = self.id, error = %fault, "chip failed");
        let mut notified: Vec<ConnectionId> = Vec::new();
        let mut notify = |conn: Option<&ConnectionRef>| {
            if let Some(conn) = conn {
                if !notified.contains(&conn.id()) {
                    notified.push(conn.id());
                    conn.command_failed(&fault);
                }
            }
        };

        if let Some(cycle) = self.exposure.take() {
            if let Err(err) = self.driver.stop_exposure() {
                warn!(chip = self.id, error = %err, "driver stop_exposure failed");
            }
            notify(cycle.connection.as_ref());
        }
        if let Some(frame) = self.exposed.take() {
            notify(frame.connection.as_ref());
        }
        if let Some(cycle) = self.readout.take() {
            if let Err(err) = self.driver.end_readout() {
                warn!(chip = self.id, error = %err, "driver end_readout failed");
            }
            cycle.stream.close(false);
            notify(cycle.stream.connection());
        }
        self.cancel_queue(&fault);
        self.last_error = Some(fault);
    }

    /// Records a queued request that failed to start.
    ///
    /// Only the queue is drained; a readout already streaming keeps going.
    pub fn fail_queued_start(&mut self, request: &ExposureRequest, fault: CamdError) {
        error!(chip = self.id, error = %fault, "queued exposure failed to start");
        request.connection.command_failed(&fault);
        self.cancel_queue(&fault);
        self.last_error = Some(fault);
    }

    /// Forgets a disconnected client; its cycles keep running without output.
    pub fn delete_connection(&mut self, connection: ConnectionId) -> usize {
        let removed = self.queue.remove_connection(connection);
        let matches = |conn: &Option<ConnectionRef>| {
            conn.as_ref().is_some_and(|c| c.id() == connection)
        };
        if let Some(cycle) = self.exposure.as_mut() {
            if matches(&cycle.connection) {
                cycle.connection = None;
            }
        }
        if let Some(frame) = self.exposed.as_mut() {
            if matches(&frame.connection) {
                frame.connection = None;
            }
        }
        if let Some(cycle) = self.readout.as_mut() {
            if cycle.stream.connection().is_some_and(|c| c.id() == connection) {
                cycle.stream.detach_connection();
            }
        }
        removed
    }
}

fn hardware_fault(err: CamdError) -> CamdError {
    match err {
        CamdError::HardwareFault(_) => err,
        other => CamdError::HardwareFault(other.to_string()),
    }
}

fn notify_cancelled(connection: Option<&ConnectionRef>, reason: &str) {
    if let Some(conn) = connection {
        conn.command_failed(&CamdError::Cancelled(reason.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, MemoryConnection};
    use crate::simulator::{SimulatedChip, SimulatedChipConfig};
    use std::sync::Arc;

    fn chip_with(config: SimulatedChipConfig) -> CameraChip {
        CameraChip::new(0, Box::new(SimulatedChip::new(config)), true).unwrap()
    }

    fn square_chip(size: u32) -> CameraChip {
        chip_with(SimulatedChipConfig {
            width: size,
            height: size,
            ..SimulatedChipConfig::default()
        })
    }

    fn request(conn: &Arc<MemoryConnection>, exposure: Duration) -> ExposureRequest {
        ExposureRequest::new(0, Shutter::Light, exposure, conn.clone())
    }

    #[test]
    fn test_defaults_after_init() {
        let chip = square_chip(64);
        assert_eq!(chip.window(), Rect::full_sensor(64, 64));
        assert_eq!(chip.binning(), Binning2D::unbinned());
        assert_eq!(chip.state(), ChipState::Idle);
        assert_eq!(chip.chip_byte_size(), 64 * 64 * 2);
    }

    #[test]
    fn test_unsupported_binning_is_rejected_without_change() {
        let mut chip = square_chip(64);
        let err = chip.set_binning(3, 3).unwrap_err();
        assert!(matches!(err, CamdError::InvalidParameter(_)));
        assert_eq!(chip.binning(), Binning2D::unbinned());
    }

    #[test]
    fn test_out_of_range_box_keeps_window() {
        let mut chip = square_chip(64);
        chip.box_(0, 0, 32, 32).unwrap();
        assert!(matches!(chip.box_(40, 0, 32, 32), Err(CamdError::OutOfRange(_))));
        assert_eq!(chip.window(), Rect::new(0, 0, 32, 32));
    }

    #[test]
    fn test_scenario_binned_roi_size() {
        let mut chip = square_chip(1024);
        chip.set_binning(2, 2).unwrap();
        chip.box_(100, 100, 400, 400).unwrap();
        let conn = MemoryConnection::new("client").shared();
        chip.start_exposure(request(&conn, Duration::ZERO), 1, None)
            .unwrap();

        assert_eq!(chip.used_width_binned(), 200);
        assert_eq!(chip.used_height_binned(), 200);
        assert_eq!(chip.chip_byte_size(), 200 * 200 * 2);
    }

    #[test]
    fn test_chip_byte_size_rounds_up_partial_bins() {
        let mut chip = chip_with(SimulatedChipConfig {
            width: 101,
            height: 33,
            binnings: vec![Binning2D::unbinned(), Binning2D::new(2, 2), Binning2D::new(4, 1)],
            ..SimulatedChipConfig::default()
        });
        for binning in chip.descriptor().binnings.clone() {
            chip.set_binning(binning.vertical, binning.horizontal).unwrap();
            let expected = u64::from(101u32.div_ceil(binning.horizontal))
                * u64::from(33u32.div_ceil(binning.vertical))
                * 2;
            assert_eq!(chip.live_chip_byte_size(), expected, "binning {binning}");
        }
    }

    #[test]
    fn test_snapshot_survives_live_changes() {
        let mut chip = square_chip(128);
        chip.box_(10, 20, 30, 40).unwrap();
        let conn = MemoryConnection::new("client").shared();
        chip.start_exposure(request(&conn, Duration::from_secs(10)), 1, None)
            .unwrap();

        chip.box_(-1, -1, -1, -1).unwrap();
        chip.set_binning(2, 2).unwrap();

        let used = chip.exposure_settings().unwrap();
        assert_eq!(used.roi, Rect::new(10, 20, 30, 40));
        assert_eq!(used.binning, Binning2D::unbinned());
        assert_eq!(chip.used_roi(), Rect::new(10, 20, 30, 40));
        assert_eq!(chip.window(), Rect::full_sensor(128, 128));
    }

    #[test]
    fn test_is_exposing_is_idempotent_until_end() {
        let mut chip = square_chip(16);
        assert_eq!(chip.is_exposing(), None);
        let conn = MemoryConnection::new("client").shared();
        chip.start_exposure(request(&conn, Duration::ZERO), 1, None)
            .unwrap();

        for _ in 0..3 {
            assert_eq!(chip.is_exposing(), Some(ExposureStatus::Done));
        }
        assert!(chip.end_exposure());
        assert_eq!(chip.is_exposing(), None);
        assert!(!chip.end_exposure());
        assert_eq!(chip.state(), ChipState::Data);
    }

    #[test]
    fn test_second_start_is_protocol_violation() {
        let mut chip = square_chip(16);
        let conn = MemoryConnection::new("client").shared();
        chip.start_exposure(request(&conn, Duration::from_secs(1)), 1, None)
            .unwrap();
        let err = chip
            .start_exposure(request(&conn, Duration::from_secs(1)), 2, None)
            .unwrap_err();
        assert!(matches!(err, CamdError::ProtocolViolation(_)));
    }

    #[test]
    fn test_readout_without_frame_is_protocol_violation() {
        let mut chip = square_chip(16);
        let err = chip.start_readout(None).unwrap_err();
        assert!(matches!(err, CamdError::ProtocolViolation(_)));
        assert!(chip.write_binary_data_size(0).is_err());
        assert_eq!(chip.do_readout(), None);
    }

    #[test]
    fn test_full_readout_cycle() {
        let mut chip = square_chip(8);
        let conn = MemoryConnection::new("client").shared();
        chip.start_exposure(request(&conn, Duration::ZERO), 1, None)
            .unwrap();
        chip.end_exposure();
        chip.start_readout(None).unwrap();
        assert_eq!(chip.state(), ChipState::Readout);
        assert_eq!(chip.write_binary_data_size(0).unwrap(), 128);

        let mut steps = 0;
        while chip.do_readout() != Some(ReadoutStatus::Complete) {
            steps += 1;
            assert!(steps < 100, "readout did not finish");
        }
        assert_eq!(chip.write_binary_data_size(0).unwrap(), 0);
        assert_eq!(chip.drain_events(), Some(1));

        let summary = chip.end_readout(true).unwrap();
        assert!(summary.complete);
        assert_eq!(summary.bytes_sent, 128);
        assert_eq!(summary.statistics.unwrap().pixels, 64);
        assert_eq!(chip.state(), ChipState::Idle);
        assert_eq!(conn.oks().len(), 1);
        assert_eq!(conn.take_finished_images()[0].total_bytes(), 128);
    }

    #[test]
    fn test_fail_notifies_each_client_once_and_drains_queue() {
        let mut chip = square_chip(16);
        let a = MemoryConnection::new("a").shared();
        let b = MemoryConnection::new("b").shared();
        chip.start_exposure(request(&a, Duration::from_secs(5)), 1, None)
            .unwrap();
        chip.enqueue(request(&a, Duration::from_secs(1)));
        chip.enqueue(request(&b, Duration::from_secs(1)));

        chip.fail(CamdError::HardwareFault("ccd lost".into()));

        assert_eq!(chip.state(), ChipState::Failed);
        assert!(chip.queue().is_empty());
        // running exposure and one queued request, both from `a`
        assert_eq!(a.failures().len(), 2);
        assert_eq!(b.failures().len(), 1);
        assert_eq!(Arc::strong_count(&b), 1);

        chip.clear_error();
        assert_eq!(chip.state(), ChipState::Idle);
    }

    #[test]
    fn test_delete_connection_detaches_readout() {
        let mut chip = square_chip(8);
        let conn = MemoryConnection::new("client").shared();
        chip.start_exposure(request(&conn, Duration::ZERO), 1, None)
            .unwrap();
        chip.end_exposure();
        chip.start_readout(None).unwrap();

        chip.delete_connection(conn.id());
        while chip.do_readout() != Some(ReadoutStatus::Complete) {}
        chip.end_readout(true);
        assert_eq!(Arc::strong_count(&conn), 1);
        assert!(conn.oks().is_empty());
    }

    #[test]
    fn test_reset_defaults() {
        let mut chip = square_chip(32);
        chip.box_(1, 1, 4, 4).unwrap();
        chip.set_binning(2, 2).unwrap();
        chip.reset_defaults();
        assert_eq!(chip.window(), Rect::full_sensor(32, 32));
        assert_eq!(chip.binning(), Binning2D::unbinned());
    }

    #[test]
    fn test_center_box() {
        let mut chip = square_chip(100);
        assert_eq!(chip.center(20, 10).unwrap(), Rect::new(40, 45, 20, 10));
        assert_eq!(chip.center(0, 0).unwrap(), Rect::new(25, 25, 50, 50));
    }
}
