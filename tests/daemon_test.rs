//! Poll loop driving the camera end to end.

mod common;

use std::sync::Arc;
use std::time::Duration;

use camd::daemon::{run, run_until, StopReason};
use camd::{CamdError, MemoryConnection, Shutter};
use common::{camera_with, chip};

#[tokio::test(start_paused = true)]
async fn test_scripted_exposures_complete() {
    let (mut camera, _) = camera_with(vec![chip(32, 32)], |_| {});
    let poll = camd::config::PollConfig::default();
    let client = MemoryConnection::new("client").shared();
    for _ in 0..3 {
        camera.expose(0, Shutter::Light, 2.0, client.clone()).unwrap();
    }

    let started = tokio::time::Instant::now();
    let watcher = client.clone();
    let summary = run_until(&mut camera, &poll, std::future::pending(), move |_| {
        watcher.oks().len() == 3
    })
    .await;

    assert_eq!(summary.reason, StopReason::Finished);
    assert!(started.elapsed() >= Duration::from_secs(6));
    assert!(camera.is_shut_down());
    let images = client.take_finished_images();
    assert_eq!(images.len(), 3);
    assert!(images.iter().all(|i| i.complete == Some(true)));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_mid_exposure_cancels_and_releases() {
    let (mut camera, controls) = camera_with(vec![chip(32, 32)], |config| {
        config.poll.idle_timeout_ms = 100;
    });
    let poll = camd::config::PollConfig {
        idle_timeout_ms: 100,
        min_interval_us: 0,
    };
    let client = MemoryConnection::new("client").shared();
    camera.expose(0, Shutter::Light, 60.0, client.clone()).unwrap();
    camera.expose(0, Shutter::Light, 60.0, client.clone()).unwrap();

    let summary = run(&mut camera, &poll, tokio::time::sleep(Duration::from_secs(1))).await;

    assert_eq!(summary.reason, StopReason::Shutdown);
    // hint of 100 ms while the 60 s exposure runs
    assert_eq!(summary.ticks, 10);
    let failures = client.failures();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|e| matches!(e, CamdError::Cancelled(_))));
    assert_eq!(Arc::strong_count(&client), 1);
    assert_eq!(controls[0].calls().stop_exposure, 1);
    assert!(camera.expose(0, Shutter::Light, 1.0, client.clone()).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_min_interval_limits_tick_rate() {
    let (mut camera, _) = camera_with(vec![chip(64, 256)], |_| {});
    let poll = camd::config::PollConfig {
        idle_timeout_ms: 1000,
        min_interval_us: 10_000,
    };
    let client = MemoryConnection::new("client").shared();
    camera.expose(0, Shutter::Light, 0.0, client.clone()).unwrap();

    let started = tokio::time::Instant::now();
    let watcher = client.clone();
    let summary = run_until(&mut camera, &poll, std::future::pending(), move |_| {
        !watcher.oks().is_empty()
    })
    .await;

    // every tick waited at least the minimum interval
    let floor = Duration::from_millis(10) * u32::try_from(summary.ticks - 1).unwrap();
    assert!(started.elapsed() >= floor);
    assert!(summary.ticks > 2);
}
