//! Integration tests for the keep-alive scheduler
//!
//! These drive the full enumerate → resolve → play → sleep loop against a
//! scripted host, including operator shutdown and misbehaving devices.

use crate::support::{
    microphone, registry, speaker, wait_until, CountingSink, ScriptedEnumerator, TEST_RATE,
};
use insomnia_core::domain::audio::{
    AudioEnumerator, AudioError, DeviceInfo, Result as AudioResult, SampleRate,
};
use insomnia_core::domain::profile::{DeviceModel, DeviceProfileRegistry};
use insomnia_core::domain::scheduler::{
    CandidateMode, IdleBehavior, KeepAliveError, KeepAliveScheduler, SchedulerSettings, StopReason,
};
use insomnia_core::domain::tone::generate;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn settings(mode: CandidateMode, rescan: Option<Duration>, when_idle: IdleBehavior) -> SchedulerSettings {
    SchedulerSettings {
        mode,
        rescan_interval: rescan,
        when_idle,
    }
}

// ============================================================================
// PROFILE AND TONE SCENARIOS
// ============================================================================

#[test]
fn test_charge_3_profile_resolution() {
    let registry = DeviceProfileRegistry::default();

    let profile = registry.resolve("JBL Charge 3").unwrap();
    assert_eq!(profile.model(), DeviceModel::JblCharge3);
    assert_eq!(profile.interval_secs(), 5.0);

    let tone = profile.frequency_configuration();
    assert_eq!(tone.frequency(), 10);
    assert_eq!(tone.duration(), 2.0);
    assert_eq!(tone.sample_rate(), 44100);
    assert_eq!(tone.amplitude(), 0.005);

    assert!(registry.resolve("Unknown Speaker").is_none());
}

#[test]
fn test_charge_3_waveform() {
    let wave = generate(10, 2.0, 44100, 0.005).unwrap();

    assert_eq!(wave.len(), 88200);
    assert!(wave[0].abs() < 1e-6);
    assert!(wave[11025].abs() <= 0.005);
    assert!(wave.iter().all(|s| s.abs() <= 0.005));
}

// ============================================================================
// IDLE SCENARIOS
// ============================================================================

#[tokio::test]
async fn test_no_matches_exits_cleanly_when_configured() {
    let enumerator = ScriptedEnumerator::with_devices(vec![
        speaker(0, "HDMI Output"),
        microphone(1, "JBL Charge 3"),
    ]);
    let sink = CountingSink::default();
    let log = Arc::clone(&sink.log);

    let scheduler = KeepAliveScheduler::new(
        Arc::new(enumerator),
        Arc::new(sink),
        Arc::new(DeviceProfileRegistry::default()),
        settings(CandidateMode::AllDevices, None, IdleBehavior::Exit),
    );
    let (_stop_tx, stop_rx) = watch::channel(false);

    let report = tokio::time::timeout(Duration::from_secs(2), scheduler.run(stop_rx))
        .await
        .expect("scheduler should exit on its own")
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::Idle);
    assert!(report.devices.is_empty());
    assert_eq!(log.opened(), 0);
}

#[tokio::test]
async fn test_no_matches_stays_alive_when_waiting() {
    let enumerator = ScriptedEnumerator::with_default(speaker(0, "Unknown Speaker"));
    let sink = CountingSink::default();
    let log = Arc::clone(&sink.log);

    let scheduler = KeepAliveScheduler::new(
        Arc::new(enumerator),
        Arc::new(sink),
        Arc::new(DeviceProfileRegistry::default()),
        settings(
            CandidateMode::DefaultDevice,
            Some(Duration::from_millis(20)),
            IdleBehavior::Wait,
        ),
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(stop_rx));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!handle.is_finished(), "idle scheduler must keep running");

    stop_tx.send(true).unwrap();
    let report = handle.await.unwrap().unwrap();

    assert_eq!(report.stop_reason, StopReason::Interrupted);
    assert_eq!(log.opened(), 0);
}

// ============================================================================
// SHUTDOWN SCENARIOS
// ============================================================================

#[tokio::test]
async fn test_interrupt_during_sleep_stops_before_next_playback() {
    let enumerator = ScriptedEnumerator::with_default(speaker(0, "JBL Charge 3"));
    let sink = CountingSink::default();
    let log = Arc::clone(&sink.log);

    // Long interval: after the first playback the task sits in its sleep
    let scheduler = KeepAliveScheduler::new(
        Arc::new(enumerator),
        Arc::new(sink),
        registry(30.0, &[]),
        settings(CandidateMode::DefaultDevice, None, IdleBehavior::Wait),
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(stop_rx));

    assert!(wait_until(Duration::from_secs(2), || log.total_plays() == 1).await);

    stop_tx.send(true).unwrap();
    let report = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("shutdown must not wait for the interval")
        .unwrap()
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::Interrupted);
    assert_eq!(report.total_cycles(), 1);
    assert_eq!(log.opened(), 1);
    assert_eq!(log.released(), log.opened());
}

#[tokio::test]
async fn test_dropped_shutdown_sender_stops_scheduler() {
    let enumerator = ScriptedEnumerator::with_default(speaker(0, "JBL Charge 3"));
    let sink = CountingSink::default();
    let log = Arc::clone(&sink.log);

    let scheduler = KeepAliveScheduler::new(
        Arc::new(enumerator),
        Arc::new(sink),
        registry(30.0, &[]),
        settings(CandidateMode::DefaultDevice, None, IdleBehavior::Wait),
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(stop_rx));

    assert!(wait_until(Duration::from_secs(2), || log.total_plays() == 1).await);
    drop(stop_tx);

    let report = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.stop_reason, StopReason::Interrupted);
    assert_eq!(log.released(), log.opened());
}

// ============================================================================
// MULTI-DEVICE SCENARIOS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_device_does_not_delay_another() {
    let enumerator = ScriptedEnumerator::with_devices(vec![
        speaker(0, "Kitchen"),
        speaker(1, "Bedroom"),
        speaker(2, "HDMI Output"),
    ]);
    let sink = CountingSink::default().slow_on("Kitchen", Duration::from_millis(500));
    let log = Arc::clone(&sink.log);

    let scheduler = KeepAliveScheduler::new(
        Arc::new(enumerator),
        Arc::new(sink),
        registry(0.02, &["Kitchen", "Bedroom"]),
        settings(CandidateMode::AllDevices, None, IdleBehavior::Wait),
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(stop_rx));

    // While Kitchen is stuck in its first write, Bedroom keeps cycling
    assert!(wait_until(Duration::from_millis(400), || log.plays_for("Bedroom") >= 3).await);
    assert_eq!(log.plays_for("Kitchen"), 0);

    stop_tx.send(true).unwrap();
    let report = handle.await.unwrap().unwrap();

    assert_eq!(report.devices.len(), 2);
    assert_eq!(log.plays_for("HDMI Output"), 0);
    assert_eq!(log.released(), log.opened());
}

#[tokio::test]
async fn test_playback_failure_keeps_cycle_running() {
    let enumerator =
        ScriptedEnumerator::with_devices(vec![speaker(0, "Kitchen"), speaker(1, "Bedroom")]);
    let sink = CountingSink::default().failing_on("Kitchen");
    let log = Arc::clone(&sink.log);

    let scheduler = KeepAliveScheduler::new(
        Arc::new(enumerator),
        Arc::new(sink),
        registry(0.02, &["Kitchen", "Bedroom"]),
        settings(CandidateMode::AllDevices, None, IdleBehavior::Wait),
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(stop_rx));

    assert!(wait_until(Duration::from_secs(2), || log.plays_for("Bedroom") >= 3).await);
    stop_tx.send(true).unwrap();
    let report = handle.await.unwrap().unwrap();

    let kitchen = report
        .devices
        .iter()
        .find(|d| d.device.as_str() == "Kitchen")
        .unwrap();
    assert_eq!(kitchen.cycles, 0);
    assert!(kitchen.failures >= 2);

    let bedroom = report
        .devices
        .iter()
        .find(|d| d.device.as_str() == "Bedroom")
        .unwrap();
    assert_eq!(bedroom.failures, 0);
    assert!(bedroom.cycles >= 3);

    // Failed writes still release their stream
    assert_eq!(log.released(), log.opened());
}

#[tokio::test]
async fn test_crashed_device_task_is_restarted() {
    let enumerator =
        ScriptedEnumerator::with_devices(vec![speaker(0, "Kitchen"), speaker(1, "Bedroom")]);
    let sink = CountingSink::default().panicking_once_on("Kitchen");
    let log = Arc::clone(&sink.log);

    let scheduler = KeepAliveScheduler::new(
        Arc::new(enumerator),
        Arc::new(sink),
        registry(0.02, &["Kitchen", "Bedroom"]),
        settings(
            CandidateMode::AllDevices,
            Some(Duration::from_millis(30)),
            IdleBehavior::Wait,
        ),
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(stop_rx));

    // The first Kitchen task dies on its first open; the next pass respawns it
    assert!(wait_until(Duration::from_secs(2), || log.plays_for("Kitchen") >= 2).await);
    assert!(log.plays_for("Bedroom") >= 2);

    stop_tx.send(true).unwrap();
    let report = handle.await.unwrap().unwrap();

    let kitchen: Vec<_> = report
        .devices
        .iter()
        .filter(|d| d.device.as_str() == "Kitchen")
        .collect();
    assert_eq!(kitchen.len(), 2);
    assert_eq!(kitchen[0].cycles, 0);
    assert!(kitchen[1].cycles >= 2);
    assert_eq!(log.released(), log.opened());
}

// ============================================================================
// RESCAN SCENARIOS
// ============================================================================

#[tokio::test]
async fn test_default_device_switch_is_picked_up_on_rescan() {
    let enumerator = Arc::new(ScriptedEnumerator::with_default(speaker(0, "Unknown Speaker")));
    let sink = CountingSink::default();
    let log = Arc::clone(&sink.log);

    let scheduler = KeepAliveScheduler::new(
        enumerator.clone(),
        Arc::new(sink),
        registry(0.02, &[]),
        settings(
            CandidateMode::DefaultDevice,
            Some(Duration::from_millis(30)),
            IdleBehavior::Wait,
        ),
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(stop_rx));

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(log.opened(), 0);

    // User switches output to the speaker
    enumerator.set_default(Some(speaker(3, "JBL Charge 3")));
    assert!(wait_until(Duration::from_secs(2), || log.plays_for("JBL Charge 3") >= 2).await);

    // ...and away again; the task is stopped at the next pass
    enumerator.set_default(Some(speaker(0, "Unknown Speaker")));
    tokio::time::sleep(Duration::from_millis(150)).await;
    let plays_after_switch = log.total_plays();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(log.total_plays(), plays_after_switch);

    stop_tx.send(true).unwrap();
    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.devices.len(), 1);
    assert_eq!(report.devices[0].device.as_str(), "JBL Charge 3");
    assert_eq!(log.released(), log.opened());
}

#[tokio::test]
async fn test_exit_when_idle_after_device_disappears() {
    let enumerator = Arc::new(ScriptedEnumerator::with_default(speaker(0, "JBL Charge 3")));
    let sink = CountingSink::default();
    let log = Arc::clone(&sink.log);

    let scheduler = KeepAliveScheduler::new(
        enumerator.clone(),
        Arc::new(sink),
        registry(0.02, &[]),
        settings(
            CandidateMode::DefaultDevice,
            Some(Duration::from_millis(30)),
            IdleBehavior::Exit,
        ),
    );
    let (_stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(stop_rx));

    assert!(wait_until(Duration::from_secs(2), || log.total_plays() >= 1).await);
    enumerator.set_default(None);

    let report = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("scheduler should go idle and exit")
        .unwrap()
        .unwrap();
    assert_eq!(report.stop_reason, StopReason::Idle);
    assert_eq!(report.devices.len(), 1);
}

#[tokio::test]
async fn test_tone_uses_device_sample_rate() {
    let mut device = speaker(0, "JBL Charge 3");
    device.default_sample_rate = Some(SampleRate::Hz48000);
    let enumerator = ScriptedEnumerator::with_default(device);
    let sink = CountingSink::default();
    let log = Arc::clone(&sink.log);

    let scheduler = KeepAliveScheduler::new(
        Arc::new(enumerator),
        Arc::new(sink),
        registry(30.0, &[]),
        settings(CandidateMode::DefaultDevice, None, IdleBehavior::Wait),
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(stop_rx));

    assert!(wait_until(Duration::from_secs(2), || log.total_plays() == 1).await);
    stop_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(log.requested_rates(), vec![48000]);
}

#[tokio::test]
async fn test_tone_falls_back_to_profile_rate() {
    let mut device = speaker(0, "JBL Charge 3");
    device.default_sample_rate = None;
    let enumerator = ScriptedEnumerator::with_default(device);
    let sink = CountingSink::default();
    let log = Arc::clone(&sink.log);

    let scheduler = KeepAliveScheduler::new(
        Arc::new(enumerator),
        Arc::new(sink),
        registry(30.0, &[]),
        settings(CandidateMode::DefaultDevice, None, IdleBehavior::Wait),
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(stop_rx));

    assert!(wait_until(Duration::from_secs(2), || log.total_plays() == 1).await);
    stop_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(log.requested_rates(), vec![TEST_RATE]);
}

#[tokio::test]
async fn test_startup_failure_is_fatal() {
    struct DeadHost;

    impl AudioEnumerator for DeadHost {
        fn output_devices(&self) -> AudioResult<Vec<DeviceInfo>> {
            Err(AudioError::HostUnavailable("backend missing".to_string()))
        }

        fn default_output_device(&self) -> AudioResult<DeviceInfo> {
            Err(AudioError::HostUnavailable("backend missing".to_string()))
        }
    }

    let scheduler = KeepAliveScheduler::new(
        Arc::new(DeadHost),
        Arc::new(CountingSink::default()),
        Arc::new(DeviceProfileRegistry::default()),
        SchedulerSettings::default(),
    );
    let (_stop_tx, stop_rx) = watch::channel(false);

    let err = scheduler.run(stop_rx).await.unwrap_err();
    assert!(matches!(err, KeepAliveError::AudioSubsystemInit(_)));
    assert_eq!(err.exit_code(), 1);
}
