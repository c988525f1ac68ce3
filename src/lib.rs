//! Core library for the camd camera daemon.
//!
//! The crate holds the acquisition core of a multi-chip astronomical camera:
//! per-chip regions of interest and binning, the exposure/readout state
//! machine with optional frame transfer, per-chip exposure queues and the
//! multi-channel streaming of pixel data to clients. Sensors are reached
//! through the [`driver::ChipDriver`] trait; [`simulator`] provides one that
//! needs no hardware.
//!
//! Everything runs on a single task. [`camera::Camera`] is advanced by
//! [`camera::Camera::idle`], which [`daemon::run`] calls in a loop.

pub mod camera;
pub mod chip;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod driver;
pub mod error;
pub mod geometry;
pub mod queue;
pub mod simulator;
pub mod statistics;
pub mod status;
pub mod stream;

pub use camera::{Camera, CameraSettings, ExposeOutcome};
pub use chip::{CameraChip, ExposureSettings};
pub use connection::{Connection, ConnectionRef, MemoryConnection};
pub use driver::ChipDriver;
pub use error::{CamdError, CamdResult};
pub use geometry::{Binning2D, DataType, Rect, Shutter};
pub use status::{ChipState, ExposureStatus, ReadoutStatus};
