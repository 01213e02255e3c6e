mod common;

use std::sync::Arc;
use std::time::Duration;

use comlogger::events::{
    EngineEvent, STATUS_PAUSED, STATUS_RECONNECTING, STATUS_STALE, STATUS_STOPPED,
    STATUS_WAITING, STATUS_WRITE_ERROR,
};
use comlogger::hotplug::DeviceWatcher;
use comlogger::link::{LinkPhase, LinkTimings};
use comlogger::serial::mock::MockSerial;
use common::{fast_timings, mock_engine, settings, wait_until, FRAME, FRAME_LINE};
use tokio::time::sleep;

const WAIT: Duration = Duration::from_secs(3);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_device_reports_waiting() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockSerial::new();
    let (engine, _events) = mock_engine(&mock, settings("a", "COM3", dir.path(), fast_timings()));

    engine.start();
    assert!(engine.wants_running());
    assert!(wait_until(WAIT, || engine.status().text == STATUS_WAITING).await);
    assert!(!engine.is_running());
    assert_eq!(mock.open_count(), 0);

    engine.stop().await;
    assert_eq!(engine.status().text, STATUS_STOPPED);
    assert!(!engine.wants_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn frames_reach_file_and_live_rows() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockSerial::with_ports(["COM3"]);
    let (engine, mut events) =
        mock_engine(&mock, settings("a", "COM3", dir.path(), fast_timings()));

    engine.start();
    assert!(wait_until(WAIT, || engine.status().text == "running (COM3)").await);
    assert!(engine.is_running());
    assert_eq!(engine.last_frame_timestamp_utc(), None);

    // Split across two reads, with line noise in front
    assert!(mock.push("COM3", format!("garbage{}", &FRAME[..30])));
    assert!(mock.push("COM3", format!("{}\r\n", &FRAME[30..])));
    assert!(
        wait_until(WAIT, || {
            engine.store().read().ok().flatten().as_deref() == Some(FRAME_LINE)
        })
        .await
    );
    assert!(engine.last_frame_timestamp_utc().is_some());

    let mut row = None;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::LiveRow(r) = event {
            row = Some(r);
        }
    }
    let row = row.expect("live row published");
    assert_eq!(row.port, "COM3");
    assert_eq!(row.line, FRAME_LINE);
    assert_eq!(row.raw, FRAME);
    assert!((row.temperatures[0] - 20.8).abs() < 1e-9);

    engine.stop().await;
    assert_eq!(mock.active_streams(), 0);
    assert!(!engine.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unplug_rebinds_to_remaining_port() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockSerial::with_ports(["COM3", "COM7"]);
    let (engine, _events) = mock_engine(&mock, settings("a", "COM3", dir.path(), fast_timings()));

    engine.start();
    assert!(wait_until(WAIT, || engine.is_running()).await);
    assert_eq!(mock.open_history(), vec!["COM3"]);

    mock.unplug("COM3");
    assert!(
        wait_until(WAIT, || {
            engine.is_running() && engine.snapshot().bound_port.as_deref() == Some("COM7")
        })
        .await
    );
    let snap = engine.snapshot();
    assert_eq!(snap.requested_port, "COM3");
    assert!(snap.generation >= 2);
    assert!(snap.last_error.is_some());
    assert_eq!(mock.active_streams(), 1);

    assert!(mock.push("COM7", FRAME));
    assert!(
        wait_until(WAIT, || {
            engine.store().read().ok().flatten().as_deref() == Some(FRAME_LINE)
        })
        .await
    );
    engine.stop().await;
    assert_eq!(mock.active_streams(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_rebind_when_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockSerial::with_ports(["COM7"]);
    let mut cfg = settings("a", "COM3", dir.path(), fast_timings());
    cfg.auto_rebind = false;
    let (engine, _events) = mock_engine(&mock, cfg);

    engine.start();
    assert!(wait_until(WAIT, || engine.status().text == STATUS_WAITING).await);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(mock.open_count(), 0);

    // The configured port showing up is picked up by the poll loop
    mock.plug("COM3");
    assert!(wait_until(WAIT, || engine.is_running()).await);
    assert_eq!(mock.open_history(), vec!["COM3"]);
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_link_is_recycled_once_per_cooldown() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockSerial::with_ports(["COM1"]);
    let timings = LinkTimings {
        poll_interval: Duration::from_millis(20),
        idle_threshold: Duration::from_millis(150),
        grace_period: Duration::from_millis(50),
        reconnect_cooldown: Duration::from_millis(600),
        open_backoff_max: Duration::from_secs(1),
        read_timeout: Duration::from_millis(10),
    };
    let (engine, _events) = mock_engine(&mock, settings("a", "COM1", dir.path(), timings));

    engine.start();
    assert!(wait_until(WAIT, || mock.open_count() == 1).await);

    // Silent device: stale after the idle threshold, but kept open until the cooldown ends
    sleep(Duration::from_millis(350)).await;
    assert_eq!(engine.snapshot().phase, LinkPhase::OpenStale);
    assert_eq!(engine.status().text, STATUS_STALE);
    assert_eq!(mock.open_count(), 1);

    assert!(wait_until(WAIT, || mock.open_count() == 2).await);
    assert!(mock.active_streams() <= 1);
    // Reopening does not reset idle time, yet the next cycle waits for the cooldown again
    sleep(Duration::from_millis(250)).await;
    assert_eq!(mock.open_count(), 2);

    // A frame heals the link
    assert!(mock.push("COM1", FRAME));
    assert!(wait_until(WAIT, || engine.snapshot().phase == LinkPhase::OpenActive).await);
    assert_eq!(engine.status().text, "running (COM1)");

    engine.stop().await;
    assert_eq!(mock.active_streams(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_opens_back_off_and_recover() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockSerial::with_ports(["COM2"]);
    mock.set_open_failure("COM2", true);
    let (engine, _events) = mock_engine(&mock, settings("a", "COM2", dir.path(), fast_timings()));

    engine.start();
    assert!(wait_until(WAIT, || engine.snapshot().open_failures >= 2).await);
    assert!(engine
        .snapshot()
        .last_error
        .map(|e| e.message.contains("busy"))
        .unwrap_or(false));
    // Retries do not flap the status through "opening"
    assert_eq!(engine.status().text, STATUS_RECONNECTING);
    assert!(engine.wants_running());
    assert!(!engine.is_running());

    mock.set_open_failure("COM2", false);
    assert!(wait_until(WAIT, || engine.status().text == "running (COM2)").await);
    assert_eq!(engine.snapshot().open_failures, 0);
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_closes_port_and_start_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockSerial::with_ports(["COM4"]);
    let (engine, _events) = mock_engine(&mock, settings("a", "COM4", dir.path(), fast_timings()));

    engine.start();
    assert!(wait_until(WAIT, || engine.is_running()).await);
    engine.stop().await;
    assert_eq!(mock.active_streams(), 0);
    assert_eq!(engine.snapshot().phase, LinkPhase::Closed);
    assert_eq!(engine.status().text, STATUS_STOPPED);

    // Stopped means stopped: nothing reopens on its own
    sleep(Duration::from_millis(150)).await;
    assert_eq!(mock.open_count(), 1);

    engine.start();
    assert!(wait_until(WAIT, || engine.is_running()).await);
    assert_eq!(mock.open_count(), 2);
    assert!(mock.push("COM4", FRAME));
    assert!(
        wait_until(WAIT, || {
            engine.store().read().ok().flatten().as_deref() == Some(FRAME_LINE)
        })
        .await
    );
    engine.stop().await;
    assert_eq!(mock.active_streams(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn device_arrival_skips_the_cooldown() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockSerial::new();
    let timings = LinkTimings {
        reconnect_cooldown: Duration::from_secs(30),
        open_backoff_max: Duration::from_secs(30),
        ..fast_timings()
    };
    let (engine, _events) = mock_engine(&mock, settings("a", "COM5", dir.path(), timings));
    let engine = Arc::new(engine);

    engine.start();
    assert!(wait_until(WAIT, || engine.status().text == STATUS_WAITING).await);
    let watcher = DeviceWatcher::new(
        Arc::new(mock.clone()),
        vec![Arc::clone(&engine)],
        Duration::from_millis(20),
    )
    .spawn();
    // Let the watcher take its first inventory
    sleep(Duration::from_millis(60)).await;

    mock.plug("COM5");
    assert!(wait_until(WAIT, || engine.is_running()).await);

    watcher.stop().await;
    engine.stop().await;
    assert_eq!(mock.active_streams(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_device_is_not_recycled_during_grace() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockSerial::with_ports(["COM1"]);
    let timings = LinkTimings {
        idle_threshold: Duration::from_millis(100),
        grace_period: Duration::from_millis(600),
        ..fast_timings()
    };
    let (engine, _events) = mock_engine(&mock, settings("a", "COM1", dir.path(), timings));

    engine.start();
    assert!(wait_until(WAIT, || mock.open_count() == 1).await);
    sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.snapshot().phase, LinkPhase::OpenGrace);
    assert_eq!(engine.status().text, "running (COM1)");
    assert_eq!(mock.open_count(), 1);

    // Once the grace window is over the silence counts
    assert!(wait_until(WAIT, || mock.open_count() >= 2).await);
    engine.stop().await;
    assert_eq!(mock.active_streams(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn low_disk_space_pauses_writes() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockSerial::with_ports(["COM3"]);
    let mut cfg = settings("a", "COM3", dir.path(), fast_timings());
    cfg.store.min_free_bytes = u64::MAX;
    let (engine, _events) = mock_engine(&mock, cfg);

    engine.start();
    assert!(wait_until(WAIT, || engine.status().text == "running (COM3)").await);
    assert!(mock.push("COM3", FRAME));
    assert!(wait_until(WAIT, || engine.status().text == STATUS_PAUSED).await);
    assert_eq!(engine.store().read().unwrap(), None);
    // The link itself stays up
    assert!(engine.is_running());

    engine.stop().await;
    assert_eq!(engine.status().text, STATUS_STOPPED);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_error_clears_after_next_good_write() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockSerial::with_ports(["COM3"]);
    let mut cfg = settings("a", "COM3", dir.path(), fast_timings());
    cfg.store.attempts = 2;
    cfg.store.retry_delay = Duration::from_millis(1);
    let (engine, _events) = mock_engine(&mock, cfg);
    // A directory where the file should be makes every replace fail
    std::fs::create_dir(engine.store().path()).unwrap();

    engine.start();
    assert!(wait_until(WAIT, || engine.status().text == "running (COM3)").await);
    assert!(mock.push("COM3", FRAME));
    assert!(wait_until(WAIT, || engine.status().text == STATUS_WRITE_ERROR).await);
    assert!(engine.status().last_error.is_some());
    assert!(engine.is_running());

    std::fs::remove_dir(engine.store().path()).unwrap();
    assert!(mock.push("COM3", FRAME));
    assert!(wait_until(WAIT, || engine.status().text == "running (COM3)").await);
    assert_eq!(engine.store().read().unwrap().as_deref(), Some(FRAME_LINE));
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_during_failing_write_ends_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockSerial::with_ports(["COM3"]);
    let mut cfg = settings("a", "COM3", dir.path(), fast_timings());
    cfg.store.attempts = 5;
    cfg.store.retry_delay = Duration::from_millis(100);
    let (engine, _events) = mock_engine(&mock, cfg);
    std::fs::create_dir(engine.store().path()).unwrap();

    engine.start();
    assert!(wait_until(WAIT, || engine.status().text == "running (COM3)").await);
    assert!(mock.push("COM3", FRAME));
    // The frame is decoded, its write is now retrying
    assert!(wait_until(WAIT, || engine.last_frame_timestamp_utc().is_some()).await);

    engine.stop().await;
    assert_eq!(engine.status().text, STATUS_STOPPED);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.status().text, STATUS_STOPPED);
    assert_eq!(mock.active_streams(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_nudges_keep_the_open_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockSerial::with_ports(["COM2"]);
    mock.set_open_failure("COM2", true);
    let timings = LinkTimings {
        reconnect_cooldown: Duration::from_secs(30),
        open_backoff_max: Duration::from_secs(60),
        ..fast_timings()
    };
    let (engine, _events) = mock_engine(&mock, settings("a", "COM2", dir.path(), timings));

    engine.start();
    assert!(wait_until(WAIT, || engine.snapshot().open_failures == 1).await);
    for _ in 0..10 {
        engine.request_reconnect("device arrived");
        sleep(Duration::from_millis(40)).await;
    }
    assert_eq!(engine.snapshot().open_failures, 1);
    assert_eq!(engine.status().text, STATUS_RECONNECTING);
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn is_running_does_not_wait_for_a_slow_open() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockSerial::with_ports(["COM6"]);
    mock.set_open_delay("COM6", Duration::from_secs(1));
    let (engine, _events) = mock_engine(&mock, settings("a", "COM6", dir.path(), fast_timings()));

    engine.start();
    sleep(Duration::from_millis(200)).await;
    let asked = std::time::Instant::now();
    assert!(!engine.is_running());
    assert!(asked.elapsed() < Duration::from_millis(100));
    assert_eq!(engine.snapshot().phase, LinkPhase::Opening);

    assert!(wait_until(WAIT, || engine.is_running()).await);
    engine.stop().await;
    assert!(!engine.is_running());
}
