//! Common helpers for camd integration tests
//!
//! Builds simulated cameras and drives the poll loop under paused tokio time,
//! so exposures finish as soon as the test advances the clock.

#![allow(dead_code)] // Not every test file uses every helper

use std::sync::Arc;
use std::time::Duration;

use camd::config::CamdConfig;
use camd::simulator::{SimulatedChipConfig, SimulatorControl};
use camd::Camera;

/// Upper bound on poll ticks before a helper gives up.
pub const MAX_TICKS: usize = 100_000;

/// Simulated chip of `width` x `height`, otherwise default.
pub fn chip(width: u32, height: u32) -> SimulatedChipConfig {
    SimulatedChipConfig {
        width,
        height,
        ..SimulatedChipConfig::default()
    }
}

/// Simulated frame transfer chip that reads out one row per tick.
pub fn slow_ft_chip(width: u32, height: u32) -> SimulatedChipConfig {
    SimulatedChipConfig {
        frame_transfer: true,
        rows_per_poll: 1,
        ..chip(width, height)
    }
}

/// Camera with `chips`, after `tweak` adjusted the default configuration.
pub fn camera_with(
    chips: Vec<SimulatedChipConfig>,
    tweak: impl FnOnce(&mut CamdConfig),
) -> (Camera, Vec<Arc<SimulatorControl>>) {
    let mut config = CamdConfig::default();
    config.simulator.chips = chips;
    tweak(&mut config);
    config.validate().expect("test configuration must be valid");
    Camera::simulated(&config).expect("simulated camera must initialize")
}

/// Camera with `chips` and default settings.
pub fn camera(chips: Vec<SimulatedChipConfig>) -> Camera {
    camera_with(chips, |_| {}).0
}

/// Polls `camera` until `done` holds, advancing paused time by each hint.
///
/// Returns the number of ticks.
///
/// # Panics
/// If `done` does not hold within [`MAX_TICKS`] ticks.
pub async fn poll_until(camera: &mut Camera, mut done: impl FnMut(&Camera) -> bool) -> usize {
    for tick in 1..=MAX_TICKS {
        let hint = camera.idle();
        if done(camera) {
            return tick;
        }
        if hint > Duration::ZERO {
            tokio::time::advance(hint).await;
        }
    }
    panic!("condition not reached within {MAX_TICKS} ticks");
}

/// Polls until no chip has anything in flight or queued.
pub async fn settle(camera: &mut Camera) -> usize {
    poll_until(camera, |camera| {
        camera.chips().iter().all(|chip| {
            !chip.is_exposure_running()
                && !chip.is_reading()
                && !chip.has_exposed_frame()
                && chip.queue().is_empty()
        })
    })
    .await
}

/// Little-endian u16 pixels of a byte buffer.
pub fn u16_pixels(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
