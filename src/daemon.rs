//! Cooperative poll loop.
//!
//! The whole state machine runs on one task: call [`Camera::idle`], sleep for
//! the hint it returns, repeat. Commands are applied between ticks by whoever
//! owns the camera. The loop ends when the shutdown future resolves or the
//! caller's completion check passes, and always shuts the camera down.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info};

use crate::camera::Camera;
use crate::config::PollConfig;

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The shutdown future resolved.
    Shutdown,
    /// The completion check passed.
    Finished,
}

/// What the loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonSummary {
    /// Calls to `Camera::idle`
    pub ticks: u64,
    /// Why the loop returned
    pub reason: StopReason,
}

/// Runs the camera until `shutdown` resolves.
pub async fn run<F>(camera: &mut Camera, poll: &PollConfig, shutdown: F) -> DaemonSummary
where
    F: Future<Output = ()>,
{
    run_until(camera, poll, shutdown, |_| false).await
}

/// Runs the camera until `shutdown` resolves or `done` returns true.
///
/// `done` is checked after every tick.
pub async fn run_until<F, D>(
    camera: &mut Camera,
    poll: &PollConfig,
    shutdown: F,
    mut done: D,
) -> DaemonSummary
where
    F: Future<Output = ()>,
    D: FnMut(&Camera) -> bool,
{
    tokio::pin!(shutdown);
    let min_interval = poll.min_interval();
    let mut ticks = 0u64;
    info!(
        camera = %camera.settings().name,
        idle_timeout_ms = poll.idle_timeout_ms,
        "poll loop started"
    );

    let reason = loop {
        let hint = camera.idle();
        ticks += 1;
        if done(camera) {
            break StopReason::Finished;
        }

        let sleep = hint.max(min_interval);
        if sleep > Duration::ZERO {
            debug!(?sleep, "poll loop sleeping");
        }
        tokio::select! {
            biased;
            () = &mut shutdown => break StopReason::Shutdown,
            () = tokio::time::sleep(sleep) => {}
        }
    };

    camera.shutdown();
    info!(ticks, ?reason, "poll loop stopped");
    DaemonSummary { ticks, reason }
}
