//! Room session lifecycle against a local FLV origin.


use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use live_stream::{MonitorEvent, PlayUrlResolver, RoomInfo, TriggerType};
use recorder::room::METADATA_KEY;
use recorder::{
    AttemptOutcome, AttemptState, EnabledFeature, PassthroughFactory, ProcessorFactory,
    RecorderConfig, RecorderError, RoomSession,
};

use mock_room::{
    eventually, next_connected, next_finished, CollectingFactory, GatedResolver, MockMonitor,
    StaticResolver,
};
use stream_fixture::{StreamFixture, STALL_CHUNK_LEN, TRICKLE_CHUNK_LEN};

const ROOM_ID: u64 = 1001;

struct Harness {
    session: RoomSession,
    monitor: Arc<MockMonitor>,
    factory: CollectingFactory,
    _work_dir: tempfile::TempDir,
}

fn room_info() -> RoomInfo {
    RoomInfo::new(ROOM_ID)
        .with_short_room_id(7)
        .with_user_name("streamer")
        .with_title("evening show")
}

fn test_config(work_dir: &tempfile::TempDir) -> RecorderConfig {
    RecorderConfig {
        work_dir: work_dir.path().to_string_lossy().into_owned(),
        stream_retry_ms: 1500,
        stop_grace_ms: 100,
        read_timeout_ms: 60_000,
        ..RecorderConfig::default()
    }
}

fn harness(
    resolver: Arc<dyn PlayUrlResolver>,
    configure: impl FnOnce(&mut RecorderConfig),
) -> Harness {
    let work_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&work_dir);
    configure(&mut config);

    let monitor = MockMonitor::new(room_info());
    let factory = CollectingFactory::default();
    let session = RoomSession::new(
        ROOM_ID,
        config,
        monitor.clone(),
        resolver,
        Arc::new(factory.clone()),
    )
    .unwrap();

    Harness {
        session,
        monitor,
        factory,
        _work_dir: work_dir,
    }
}

#[tokio::test]
async fn records_whole_stream_and_rechecks_after_remote_close() {
    let fixture = StreamFixture::start().await;
    let h = harness(StaticResolver::new(fixture.url("/hop1")), |_| {});
    let mut events = h.session.subscribe();

    let before = chrono::Local::now();
    h.monitor.fire_stream_started();
    assert_eq!(next_finished(&mut events).await, AttemptOutcome::RemoteClosed);

    let started_at = h.monitor.stream_start_time.lock().expect("start time not pushed");
    assert!(started_at >= before && started_at <= chrono::Local::now());
    assert_eq!(*h.factory.bytes.lock(), fixture.payload());
    assert_eq!(h.factory.created.load(Ordering::SeqCst), 1);
    assert_eq!(h.factory.finalized.load(Ordering::SeqCst), 1);
    assert!(h
        .monitor
        .checks
        .lock()
        .contains(&(TriggerType::HttpApiRecheck, Some(Duration::from_millis(1500)))));
    assert_eq!(h.monitor.last_recording(), Some(false));

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.attempt, AttemptState::Idle);
    assert!(!snapshot.has_processor);
    assert!(!snapshot.is_recording);
    assert_eq!(snapshot.download_speed_mbps, 0.0);

    let paths = h.factory.paths.lock().clone();
    assert_eq!(paths.len(), 1);
    let file_name = paths[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(file_name.starts_with("record-1001-"), "{}", file_name);
    assert!(file_name.ends_with("-evening show.flv"), "{}", file_name);

    // The next notification starts a fresh attempt
    h.monitor.fire_stream_started();
    assert_eq!(next_finished(&mut events).await, AttemptOutcome::RemoteClosed);
    assert_eq!(h.factory.created.load(Ordering::SeqCst), 2);
    assert_eq!(h.factory.bytes.lock().len(), fixture.payload().len() * 2);
}

#[tokio::test]
async fn non_200_schedules_recheck_without_processor() {
    let fixture = StreamFixture::start().await;
    let h = harness(StaticResolver::new(fixture.url("/missing")), |_| {});
    let mut events = h.session.subscribe();

    h.monitor.fire_stream_started();
    assert_eq!(next_finished(&mut events).await, AttemptOutcome::HttpStatus(404));

    assert_eq!(h.factory.created.load(Ordering::SeqCst), 0);
    assert_eq!(h.monitor.rechecks(), 1);
    assert_eq!(h.session.snapshot().attempt, AttemptState::Idle);
}

#[tokio::test]
async fn redirect_loop_ends_attempt() {
    let fixture = StreamFixture::start().await;
    let h = harness(StaticResolver::new(fixture.url("/loop")), |c| c.max_redirects = 3);
    let mut events = h.session.subscribe();

    h.monitor.fire_stream_started();
    assert_eq!(next_finished(&mut events).await, AttemptOutcome::TooManyRedirects);
    assert_eq!(fixture.request_count("/loop"), 4);
    assert_eq!(h.monitor.rechecks(), 1);
}

#[tokio::test]
async fn overlapping_notifications_start_a_single_attempt() {
    let fixture = StreamFixture::start().await;
    let resolver = GatedResolver::new(fixture.url("/live.flv"));
    let h = harness(resolver.clone(), |_| {});
    let mut events = h.session.subscribe();

    for _ in 0..5 {
        h.monitor.fire_stream_started();
    }
    eventually(|| resolver.calls.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.session.snapshot().attempt, AttemptState::Starting);

    resolver.gate.notify_one();
    assert_eq!(next_finished(&mut events).await, AttemptOutcome::RemoteClosed);
    assert_eq!(h.factory.created.load(Ordering::SeqCst), 1);
    assert_eq!(*h.factory.bytes.lock(), fixture.payload());
}

#[tokio::test]
async fn stop_record_force_closes_a_stalled_stream() {
    let fixture = StreamFixture::start().await;
    let h = harness(StaticResolver::new(fixture.url("/stall.flv")), |_| {});
    let mut events = h.session.subscribe();

    h.monitor.fire_stream_started();
    assert_eq!(next_connected(&mut events).await, "127.0.0.1");
    eventually(|| h.factory.bytes.lock().len() == STALL_CHUNK_LEN).await;
    eventually(|| h.monitor.recording_path.lock().is_some()).await;

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.attempt, AttemptState::Streaming);
    assert!(snapshot.is_recording);
    assert!(snapshot.has_processor);
    assert_eq!(h.monitor.last_recording(), Some(true));

    // Clip goes to the live processor
    h.session.clip().await.unwrap();
    assert_eq!(h.factory.clips.load(Ordering::SeqCst), 1);

    let started = Instant::now();
    h.session.stop_record().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));

    assert_eq!(next_finished(&mut events).await, AttemptOutcome::Cancelled);
    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.attempt, AttemptState::Idle);
    assert!(!snapshot.has_processor);
    assert!(snapshot.retry_enabled);
    assert_eq!(h.factory.finalized.load(Ordering::SeqCst), 1);
    assert_eq!(h.monitor.rechecks(), 0);
    assert_eq!(h.monitor.last_recording(), Some(false));

    // Idle clip is a no-op
    h.session.clip().await.unwrap();
    assert_eq!(h.factory.clips.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stop_then_restart_records_again() {
    let fixture = StreamFixture::start().await;
    let h = harness(StaticResolver::new(fixture.url("/stall.flv")), |_| {});
    let mut events = h.session.subscribe();

    h.monitor.fire_stream_started();
    next_connected(&mut events).await;
    eventually(|| h.factory.bytes.lock().len() == STALL_CHUNK_LEN).await;
    h.session.stop_record().await.unwrap();
    assert_eq!(next_finished(&mut events).await, AttemptOutcome::Cancelled);

    h.monitor.fire_stream_started();
    next_connected(&mut events).await;
    eventually(|| h.factory.bytes.lock().len() == STALL_CHUNK_LEN * 2).await;
    assert_eq!(h.factory.created.load(Ordering::SeqCst), 2);
    assert_eq!(h.session.snapshot().attempt, AttemptState::Streaming);
    assert!(h.session.is_recording());

    h.session.stop_record().await.unwrap();
    assert_eq!(next_finished(&mut events).await, AttemptOutcome::Cancelled);
    assert_eq!(h.factory.finalized.load(Ordering::SeqCst), 2);
    assert_eq!(h.monitor.rechecks(), 0);
    assert_eq!(fixture.request_count("/stall.flv"), 2);
}

#[tokio::test]
async fn graceful_stop_ends_at_next_read_without_recheck() {
    let fixture = StreamFixture::start().await;
    let h = harness(StaticResolver::new(fixture.url("/trickle.flv")), |c| {
        c.stop_grace_ms = 5_000;
    });
    let mut events = h.session.subscribe();

    h.monitor.fire_stream_started();
    next_connected(&mut events).await;
    eventually(|| h.factory.bytes.lock().len() >= TRICKLE_CHUNK_LEN * 2).await;

    let started = Instant::now();
    h.session.stop_record().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(next_finished(&mut events).await, AttemptOutcome::StoppedLocally);
    assert_eq!(h.monitor.rechecks(), 0);
    assert_eq!(h.monitor.last_recording(), Some(false));
    assert_eq!(h.factory.finalized.load(Ordering::SeqCst), 1);
    assert!(h.session.snapshot().retry_enabled);
}

#[tokio::test]
async fn stalled_body_fails_and_rechecks() {
    let fixture = StreamFixture::start().await;
    let h = harness(StaticResolver::new(fixture.url("/stall.flv")), |c| {
        c.read_timeout_ms = 200;
    });
    let mut events = h.session.subscribe();

    h.monitor.fire_stream_started();
    next_connected(&mut events).await;

    let outcome = next_finished(&mut events).await;
    assert!(matches!(outcome, AttemptOutcome::StreamFailed(_)), "{:?}", outcome);
    assert_eq!(h.factory.bytes.lock().len(), STALL_CHUNK_LEN);
    assert_eq!(h.factory.finalized.load(Ordering::SeqCst), 1);
    assert_eq!(h.monitor.rechecks(), 1);
    assert_eq!(h.monitor.last_recording(), Some(false));
    assert!(!h.session.is_recording());
    assert_eq!(h.session.snapshot().attempt, AttemptState::Idle);
}

#[tokio::test]
async fn aborted_body_fails_and_rechecks() {
    let fixture = StreamFixture::start().await;
    let h = harness(StaticResolver::new(fixture.url("/broken.flv")), |_| {});
    let mut events = h.session.subscribe();

    h.monitor.fire_stream_started();

    let outcome = next_finished(&mut events).await;
    assert!(matches!(outcome, AttemptOutcome::StreamFailed(_)), "{:?}", outcome);
    assert_eq!(h.monitor.rechecks(), 1);
    assert_eq!(h.monitor.last_recording(), Some(false));
    assert!(!h.session.is_recording());
}

#[tokio::test]
async fn clip_only_never_reports_recording_to_monitor() {
    let fixture = StreamFixture::start().await;
    let h = harness(StaticResolver::new(fixture.url("/hop1")), |c| {
        c.enabled_feature = EnabledFeature::ClipOnly;
    });
    let mut events = h.session.subscribe();

    h.monitor.fire_stream_started();
    assert_eq!(next_finished(&mut events).await, AttemptOutcome::RemoteClosed);

    assert_eq!(*h.factory.bytes.lock(), fixture.payload());
    assert!(!h.monitor.recording.lock().contains(&true));
    assert_eq!(*h.monitor.recording_path.lock(), None);
}

#[tokio::test]
async fn stop_record_while_connecting_cancels_attempt() {
    let fixture = StreamFixture::start().await;
    let resolver = GatedResolver::new(fixture.url("/live.flv"));
    let h = harness(resolver.clone(), |_| {});
    let mut events = h.session.subscribe();

    h.monitor.fire_stream_started();
    eventually(|| resolver.calls.load(Ordering::SeqCst) == 1).await;

    h.session.stop_record().await.unwrap();

    assert_eq!(next_finished(&mut events).await, AttemptOutcome::Cancelled);
    assert_eq!(h.factory.created.load(Ordering::SeqCst), 0);
    assert_eq!(h.monitor.rechecks(), 0);
    assert_eq!(fixture.request_count("/live.flv"), 0);
    assert!(h.session.snapshot().retry_enabled);
}

#[tokio::test]
async fn stop_record_when_idle_is_a_no_op() {
    let h = harness(StaticResolver::new("http://127.0.0.1:1/never"), |_| {});

    h.session.stop_record().await.unwrap();

    assert_eq!(h.session.snapshot().attempt, AttemptState::Idle);
    assert!(h.session.snapshot().retry_enabled);
    assert_eq!(h.session.wait_for_attempt().await, None);
}

#[tokio::test]
async fn wait_for_attempt_returns_outcome() {
    let fixture = StreamFixture::start().await;
    let resolver = GatedResolver::new(fixture.url("/missing"));
    let h = harness(resolver.clone(), |_| {});

    h.monitor.fire_stream_started();
    eventually(|| resolver.calls.load(Ordering::SeqCst) == 1).await;

    let waiter = {
        let session = h.session.clone();
        tokio::spawn(async move { session.wait_for_attempt().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    resolver.gate.notify_one();

    assert_eq!(waiter.await.unwrap(), Some(AttemptOutcome::HttpStatus(404)));
}

#[tokio::test]
async fn room_info_updates_reach_monitor_and_snapshot() {
    let h = harness(StaticResolver::new("http://127.0.0.1:1/never"), |_| {});

    eventually(|| h.session.snapshot().streamer_name == "streamer").await;
    assert_eq!(h.session.snapshot().short_room_id, 7);
    assert_eq!(*h.monitor.title.lock(), "evening show");

    h.monitor.send(MonitorEvent::RoomInfoUpdated(
        room_info().with_title("late night"),
    ));
    eventually(|| h.session.snapshot().title == "late night").await;
    assert_eq!(*h.monitor.title.lock(), "late night");
    assert_eq!(h.session.room_id(), ROOM_ID);
}

#[tokio::test]
async fn monitoring_and_manual_checks_go_to_monitor() {
    let h = harness(StaticResolver::new("http://127.0.0.1:1/never"), |_| {});

    assert!(h.session.start().unwrap());
    assert!(h.session.snapshot().is_monitoring);

    h.session.start_record().unwrap();
    assert!(h.monitor.checks.lock().contains(&(TriggerType::Manual, None)));

    h.session.refresh_room_info().unwrap();
    h.session.stop().unwrap();
    assert!(!h.session.snapshot().is_monitoring);
}

#[tokio::test]
async fn shutdown_is_idempotent_and_rejects_further_calls() {
    let fixture = StreamFixture::start().await;
    let h = harness(StaticResolver::new(fixture.url("/stall.flv")), |_| {});
    let mut events = h.session.subscribe();

    h.session.start().unwrap();
    h.monitor.fire_stream_started();
    next_connected(&mut events).await;

    h.session.shutdown().await;
    h.session.shutdown().await;

    assert!(h.session.is_disposed());
    assert!(!h.session.snapshot().is_monitoring);
    assert_eq!(h.session.snapshot().attempt, AttemptState::Idle);
    assert_eq!(h.factory.finalized.load(Ordering::SeqCst), 1);
    assert_eq!(h.monitor.rechecks(), 0);

    assert!(matches!(h.session.start(), Err(RecorderError::Disposed)));
    assert!(matches!(h.session.stop(), Err(RecorderError::Disposed)));
    assert!(matches!(h.session.start_record(), Err(RecorderError::Disposed)));
    assert!(matches!(h.session.refresh_room_info(), Err(RecorderError::Disposed)));
    assert!(matches!(h.session.clip().await, Err(RecorderError::Disposed)));
    assert!(matches!(h.session.stop_record().await, Err(RecorderError::Disposed)));
}

#[tokio::test]
async fn passthrough_writes_recording_and_metadata_sidecar() {
    let fixture = StreamFixture::start().await;
    let work_dir = tempfile::tempdir().unwrap();
    let config = RecorderConfig {
        record_filename_format: "{roomid}/{name}".to_string(),
        ..test_config(&work_dir)
    };
    let monitor = MockMonitor::new(room_info());
    let factory: Arc<dyn ProcessorFactory> = Arc::new(PassthroughFactory);
    let session = RoomSession::new(
        ROOM_ID,
        config,
        monitor.clone(),
        StaticResolver::new(fixture.url("/hop1")),
        factory,
    )
    .unwrap();
    let mut events = session.subscribe();

    eventually(|| session.snapshot().streamer_name == "streamer").await;
    monitor.fire_stream_started();
    assert_eq!(next_finished(&mut events).await, AttemptOutcome::RemoteClosed);

    let recording = work_dir.path().join("1001").join("streamer.flv");
    assert_eq!(std::fs::read(&recording).unwrap(), fixture.payload());

    let sidecar = work_dir.path().join("1001").join("streamer.flv.meta.json");
    let metadata: serde_json::Value =
        serde_json::from_slice(&std::fs::read(sidecar).unwrap()).unwrap();
    assert_eq!(metadata[METADATA_KEY]["roomid"], "1001");
    assert_eq!(metadata[METADATA_KEY]["streamername"], "streamer");

    session.shutdown().await;
}
