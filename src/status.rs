//! Tagged results returned by the polling primitives.
//!
//! Each value is both a status and a scheduling hint: the poll loop sleeps for
//! the remaining time of an exposure or the retry delay of a readout step.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Result of asking a chip whether its exposure is still integrating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExposureStatus {
    /// Still exposing; check again after this long.
    Remaining(Duration),
    /// Integration finished and the exposure has not been ended yet.
    Done,
    /// The hardware reported a fault.
    Error(String),
}

/// Result of one readout step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadoutStatus {
    /// More data to move; call again on the next tick.
    Continue,
    /// The device could not deliver data this tick; call again after the delay.
    RetryAfter(Duration),
    /// The driver has nothing more to send.
    Complete,
    /// The hardware reported a fault.
    Failed(String),
}

impl ReadoutStatus {
    /// Poll hint for this status, if the readout is still running.
    pub fn next_poll(&self) -> Option<Duration> {
        match self {
            ReadoutStatus::Continue => Some(Duration::ZERO),
            ReadoutStatus::RetryAfter(delay) => Some(*delay),
            ReadoutStatus::Complete | ReadoutStatus::Failed(_) => None,
        }
    }
}

/// Observable chip state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChipState {
    /// Nothing in flight.
    Idle,
    /// Integrating.
    Exposing,
    /// Exposure finished, frame waits for a readout command.
    Data,
    /// Streaming a frame to a client.
    Readout,
    /// Frame-transfer overlap: next exposure integrates while the previous frame streams.
    ExposingReadout,
    /// The last cycle ended with a hardware fault.
    Failed,
}

impl ChipState {
    /// True while an exposure integrates.
    pub fn is_exposing(&self) -> bool {
        matches!(self, ChipState::Exposing | ChipState::ExposingReadout)
    }

    /// True while a readout streams.
    pub fn is_reading(&self) -> bool {
        matches!(self, ChipState::Readout | ChipState::ExposingReadout)
    }
}

impl fmt::Display for ChipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChipState::Idle => "IDLE",
            ChipState::Exposing => "EXPOSING",
            ChipState::Data => "DATA",
            ChipState::Readout => "READOUT",
            ChipState::ExposingReadout => "EXPOSING|READOUT",
            ChipState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}
