//! Frame transfer: exposing the next frame while the previous one streams.

mod common;

use std::time::Duration;

use camd::{CamdError, ChipState, ExposeOutcome, MemoryConnection, Rect, Shutter};
use common::{camera, camera_with, chip, poll_until, settle, slow_ft_chip};

#[tokio::test(start_paused = true)]
async fn test_exposing_readout_keeps_independent_snapshots() {
    let mut camera = camera(vec![slow_ft_chip(64, 64)]);
    let client = MemoryConnection::new("client").shared();

    camera.expose(0, Shutter::Light, 0.0, client.clone()).unwrap();
    camera.idle();
    assert_eq!(camera.chip(0).unwrap().state(), ChipState::Readout);

    camera.box_(0, 0, 0, 32, 32).unwrap();
    let outcome = camera.expose(0, Shutter::Light, 5.0, client.clone()).unwrap();
    assert_eq!(outcome, ExposeOutcome::Started { exposure: 2 });

    {
        let chip = camera.chip(0).unwrap();
        assert_eq!(chip.state(), ChipState::ExposingReadout);
        assert_eq!(chip.state().to_string(), "EXPOSING|READOUT");
        let reading = chip.readout_settings().unwrap();
        let exposing = chip.exposure_settings().unwrap();
        assert_eq!((reading.number, reading.roi), (1, Rect::full_sensor(64, 64)));
        assert_eq!((exposing.number, exposing.roi), (2, Rect::new(0, 0, 32, 32)));
    }

    poll_until(&mut camera, |c| c.chip(0).unwrap().state() == ChipState::Exposing).await;
    let first = client.take_finished_images();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].total_bytes(), 64 * 64 * 2);

    tokio::time::advance(Duration::from_secs(5)).await;
    settle(&mut camera).await;
    let second = client.take_finished_images();
    assert_eq!(second[0].exposure, 2);
    assert_eq!(second[0].total_bytes(), 32 * 32 * 2);
    assert_eq!(client.oks().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_queued_exposure_starts_with_readout() {
    let mut camera = camera(vec![slow_ft_chip(16, 16)]);
    let client = MemoryConnection::new("client").shared();

    camera.expose(0, Shutter::Light, 1.0, client.clone()).unwrap();
    assert_eq!(
        camera.expose(0, Shutter::Dark, 1.0, client.clone()).unwrap(),
        ExposeOutcome::Queued { position: 1 }
    );

    tokio::time::advance(Duration::from_secs(1)).await;
    camera.idle();
    let chip = camera.chip(0).unwrap();
    assert_eq!(chip.state(), ChipState::ExposingReadout);
    assert!(chip.queue().is_empty());
    assert_eq!(camera.exposure_count(), 2);

    settle(&mut camera).await;
    let images = client.take_finished_images();
    assert_eq!(images.iter().map(|i| i.exposure).collect::<Vec<_>>(), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_exposure_done_before_readout_waits_its_turn() {
    let mut camera = camera(vec![slow_ft_chip(64, 64)]);
    let client = MemoryConnection::new("client").shared();

    camera.expose(0, Shutter::Light, 0.0, client.clone()).unwrap();
    camera.idle();
    camera.expose(0, Shutter::Light, 0.0, client.clone()).unwrap();
    camera.idle();

    {
        let chip = camera.chip(0).unwrap();
        assert_eq!(chip.state(), ChipState::Readout);
        assert!(chip.has_exposed_frame());
        assert!(chip.is_busy());
    }
    assert_eq!(
        camera.expose(0, Shutter::Light, 0.0, client.clone()).unwrap(),
        ExposeOutcome::Queued { position: 1 }
    );

    settle(&mut camera).await;
    let images = client.take_finished_images();
    assert_eq!(images.iter().map(|i| i.exposure).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(images.iter().all(|i| i.complete == Some(true)));
}

#[tokio::test(start_paused = true)]
async fn test_chip_without_frame_transfer_queues_during_readout() {
    let mut camera = camera(vec![chip(64, 64)]);
    let client = MemoryConnection::new("client").shared();

    camera.expose(0, Shutter::Light, 0.0, client.clone()).unwrap();
    camera.idle();
    assert_eq!(camera.chip(0).unwrap().state(), ChipState::Readout);
    assert_eq!(
        camera.expose(0, Shutter::Light, 0.0, client.clone()).unwrap(),
        ExposeOutcome::Queued { position: 1 }
    );

    poll_until(&mut camera, |c| c.chip(0).unwrap().state() == ChipState::Exposing).await;
    assert_eq!(client.take_finished_images().len(), 1);
    settle(&mut camera).await;
    assert_eq!(client.take_finished_images().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_expose_leaves_overlapping_readout_running() {
    let mut camera = camera(vec![slow_ft_chip(32, 32)]);
    let reading = MemoryConnection::new("reading").shared();
    let exposing = MemoryConnection::new("exposing").shared();

    camera.expose(0, Shutter::Light, 0.0, reading.clone()).unwrap();
    camera.idle();
    camera.expose(0, Shutter::Light, 30.0, exposing.clone()).unwrap();
    assert_eq!(camera.chip(0).unwrap().state(), ChipState::ExposingReadout);

    camera.stop_expose(0).unwrap();
    assert_eq!(camera.chip(0).unwrap().state(), ChipState::Readout);
    assert!(matches!(exposing.failures()[0], CamdError::Cancelled(_)));

    settle(&mut camera).await;
    let images = reading.take_finished_images();
    assert_eq!(images[0].complete, Some(true));
    assert_eq!(images[0].total_bytes(), 32 * 32 * 2);
    assert!(exposing.images().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_queued_start_failure_spares_streaming_frame() {
    let (mut camera, controls) = camera_with(vec![slow_ft_chip(16, 16)], |_| {});
    let first = MemoryConnection::new("first").shared();
    let second = MemoryConnection::new("second").shared();
    let third = MemoryConnection::new("third").shared();

    camera.expose(0, Shutter::Light, 1.0, first.clone()).unwrap();
    camera.expose(0, Shutter::Light, 1.0, second.clone()).unwrap();
    camera.expose(0, Shutter::Light, 1.0, third.clone()).unwrap();
    controls[0].fail_next_start("boom");

    tokio::time::advance(Duration::from_secs(1)).await;
    camera.idle();
    {
        let chip = camera.chip(0).unwrap();
        assert_eq!(chip.state(), ChipState::Readout);
        assert!(chip.queue().is_empty());
    }
    assert!(matches!(second.failures()[0], CamdError::HardwareFault(_)));
    assert!(matches!(third.failures()[0], CamdError::HardwareFault(_)));

    settle(&mut camera).await;
    let images = first.take_finished_images();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].complete, Some(true));
    assert_eq!(images[0].total_bytes(), 16 * 16 * 2);
    assert!(first.failures().is_empty());
    assert_eq!(first.oks().len(), 1);
    assert_eq!(camera.chip(0).unwrap().state(), ChipState::Failed);
    assert_eq!(camera.exposure_count(), 1);
}
