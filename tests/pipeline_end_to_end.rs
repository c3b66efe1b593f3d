use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use guard_pipeline::debounce::AlertTrigger;
use guard_pipeline::geo::LocationSource;
use guard_pipeline::ledger::AlertStatus;
use guard_pipeline::pipeline::{PipelineParts, PipelineSettings};
use guard_pipeline::recognize::{AdapterConfig, RecognizedItem, ScriptedRecognizer};
use guard_pipeline::{
    now_ms, AlertDispatcher, AlertLedger, AlertMessage, AlertSignal, AlertTransport,
    DebounceConfig, DeliveryReceipt, DetectionKind, DeviceFixFeed, DeviceLocationSource,
    FixSource, Frame, GeoFix, GeolocationResolver, InMemoryAlertLedger, Pipeline,
    PipelineHandle, RecognitionAdapter, RecognitionCapability, Recognizer, RecognizerRegistry,
    RetryPolicy, TransportError,
};

// -------------------- Fakes --------------------

/// Records every message and reports success.
#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<AlertMessage>>,
}

impl RecordingTransport {
    fn messages(&self) -> Vec<AlertMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl AlertTransport for RecordingTransport {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn send(&self, message: &AlertMessage) -> Result<DeliveryReceipt, TransportError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(message.clone());
        Ok(DeliveryReceipt {
            message_id: format!("msg-{}", sent.len()),
        })
    }
}

/// Fails the first `fail_first` sends, then succeeds.
struct FlakyTransport {
    calls: AtomicUsize,
    fail_first: usize,
}

impl AlertTransport for FlakyTransport {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn send(&self, _message: &AlertMessage) -> Result<DeliveryReceipt, TransportError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_first {
            return Err(TransportError::Status {
                code: 502,
                body: "bad gateway".into(),
            });
        }
        Ok(DeliveryReceipt {
            message_id: format!("msg-{}", n),
        })
    }
}

/// Blocks inside `send` until the test drops the release sender, then fails.
struct HangingTransport {
    entered: AtomicBool,
    release: Mutex<mpsc::Receiver<()>>,
}

impl AlertTransport for HangingTransport {
    fn name(&self) -> &'static str {
        "hanging"
    }

    fn send(&self, _message: &AlertMessage) -> Result<DeliveryReceipt, TransportError> {
        self.entered.store(true, Ordering::SeqCst);
        let _ = self
            .release
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(10));
        Err(TransportError::Timeout(Duration::from_secs(10)))
    }
}

/// IP lookup stand-in: answers after a fixed delay.
struct SlowIpSource {
    delay: Duration,
    calls: AtomicUsize,
}

impl LocationSource for SlowIpSource {
    fn name(&self) -> &str {
        "ip"
    }

    fn source(&self) -> FixSource {
        FixSource::Ip
    }

    fn locate(&self, timeout: Duration) -> Result<GeoFix> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay > timeout {
            std::thread::sleep(timeout);
            return Err(anyhow!("ip lookup timed out"));
        }
        std::thread::sleep(self.delay);
        Ok(GeoFix::new(10.0, 20.0, 5_000.0, FixSource::Ip))
    }
}

/// Takes `delay` per frame and recognizes nothing.
struct SlowRecognizer {
    delay: Duration,
    seen: Arc<AtomicUsize>,
}

impl Recognizer for SlowRecognizer {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn supports(&self, capability: RecognitionCapability) -> bool {
        capability == RecognitionCapability::TextRecognition
    }

    fn recognize(
        &mut self,
        _pixels: &[u8],
        _width: u32,
        _height: u32,
    ) -> Result<Vec<RecognizedItem>> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        Ok(Vec::new())
    }
}

// -------------------- Harness --------------------

fn frame(seq: u64) -> Frame {
    Frame::new(vec![0u8; 16], 4, 4, seq, now_ms())
}

fn scripted(frames: Vec<Vec<RecognizedItem>>) -> RecognitionAdapter {
    let mut registry = RecognizerRegistry::new();
    registry.register(ScriptedRecognizer::from_frames(frames));
    RecognitionAdapter::new(registry, AdapterConfig::default())
}

fn settings(queue_capacity: usize) -> PipelineSettings {
    PipelineSettings {
        workers: 2,
        queue_capacity,
        job_capacity: 16,
        geo_deadline: Duration::from_secs(8),
    }
}

fn retries(base_delay: Duration) -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay,
        max_delay: base_delay * 5,
        jitter: 0.0,
    }
}

fn start(
    adapter: RecognitionAdapter,
    trigger: AlertTrigger,
    resolver: GeolocationResolver,
    transport: Arc<dyn AlertTransport>,
    ledger: Arc<dyn AlertLedger>,
    queue_capacity: usize,
) -> PipelineHandle {
    start_with(
        adapter,
        trigger,
        transport,
        ledger,
        retries(Duration::from_millis(10)),
        resolver,
        settings(queue_capacity),
    )
}

fn start_with(
    adapter: RecognitionAdapter,
    trigger: AlertTrigger,
    transport: Arc<dyn AlertTransport>,
    ledger: Arc<dyn AlertLedger>,
    policy: RetryPolicy,
    resolver: GeolocationResolver,
    settings: PipelineSettings,
) -> PipelineHandle {
    let dispatcher = Arc::new(AlertDispatcher::new(transport, ledger, policy));
    Pipeline::start(PipelineParts {
        adapter,
        debounce: DebounceConfig::default(),
        trigger,
        resolver: Arc::new(resolver),
        dispatcher,
        settings,
    })
    .expect("start pipeline")
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}

// -------------------- Tests --------------------

#[test]
fn repeated_barcode_alerts_once_with_ip_location() {
    let transport = Arc::new(RecordingTransport::default());
    let ledger: Arc<dyn AlertLedger> = Arc::new(InMemoryAlertLedger::new());

    // No satellite fix ever arrives; the IP lookup answers after a second.
    let satellite = Arc::new(DeviceLocationSource::new(
        "satellite",
        FixSource::Satellite,
        DeviceFixFeed::new(),
        Duration::from_secs(30),
    ));
    let ip = Arc::new(SlowIpSource {
        delay: Duration::from_secs(1),
        calls: AtomicUsize::new(0),
    });
    let resolver = GeolocationResolver::new(Duration::from_secs(900))
        .with_source(satellite, Duration::from_secs(2))
        .with_source(ip.clone(), Duration::from_secs(4));

    let sighting = vec![RecognizedItem::barcode("ABC123", 0.9)];
    let handle = start(
        scripted(vec![sighting.clone(), sighting.clone(), sighting]),
        AlertTrigger::any(),
        resolver,
        transport.clone(),
        ledger.clone(),
        8,
    );
    let signals = handle.take_signals().expect("signal receiver");
    assert!(handle.take_signals().is_none());

    let started = Instant::now();
    for seq in 1..=3 {
        assert!(handle.submit_frame(frame(seq)));
        std::thread::sleep(Duration::from_millis(500));
    }

    let delivered = wait_until(Duration::from_secs(10), || {
        !ledger
            .list_by_status(AlertStatus::Sent)
            .unwrap()
            .is_empty()
    });
    assert!(delivered, "alert was not delivered");
    assert!(
        started.elapsed() < Duration::from_millis(4_500),
        "delivery took {:?}",
        started.elapsed()
    );

    let sent = ledger.list_by_status(AlertStatus::Sent).unwrap();
    assert_eq!(sent.len(), 1);
    let record = &sent[0];
    assert_eq!(record.kind, DetectionKind::Barcode);
    assert_eq!(record.content, "ABC123");
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.transport_message_id.as_deref(), Some("msg-1"));
    let fix = record.geo_fix.as_ref().expect("location attached");
    assert_eq!(fix.source, FixSource::Ip);
    assert_eq!((fix.latitude, fix.longitude), (10.0, 20.0));
    assert_eq!(ip.calls.load(Ordering::SeqCst), 1);

    let messages = transport.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].text.contains("ABC123"));
    assert_eq!(messages[0].coordinates, Some((10.0, 20.0)));

    let active = handle.active_events();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].occurrence_count, 3);
    assert_eq!(active[0].alert_round, 0);

    let stats = handle.stats();
    assert_eq!(stats.frames_analyzed, 3);
    assert_eq!(stats.events_emitted, 1);
    assert_eq!(stats.jobs_dispatched, 1);

    let report = handle.shutdown(Duration::from_secs(2));
    assert!(report.drained);
    assert_eq!(report.marked_failed, 0);

    let received: Vec<AlertSignal> = signals.try_iter().collect();
    assert!(received
        .iter()
        .any(|s| matches!(s, AlertSignal::ShowOnMap(pin) if pin.label == "ABC123")));
    assert!(received.iter().any(|s| matches!(
        s,
        AlertSignal::DeliveryConfirmed { alert_id, .. } if *alert_id == record.alert_id
    )));
}

#[test]
fn shutdown_marks_in_flight_alert_failed() {
    let (release_tx, release_rx) = mpsc::channel();
    let transport = Arc::new(HangingTransport {
        entered: AtomicBool::new(false),
        release: Mutex::new(release_rx),
    });
    let ledger: Arc<dyn AlertLedger> = Arc::new(InMemoryAlertLedger::new());

    let handle = start(
        scripted(vec![vec![RecognizedItem::text("gate left open", 0.8)]]),
        AlertTrigger::any(),
        GeolocationResolver::new(Duration::from_secs(900)),
        transport.clone(),
        ledger.clone(),
        8,
    );
    let signals = handle.take_signals().expect("signal receiver");
    assert!(handle.submit_frame(frame(1)));
    assert!(wait_until(Duration::from_secs(5), || transport
        .entered
        .load(Ordering::SeqCst)));

    let report = handle.shutdown(Duration::from_millis(300));
    assert!(!report.drained);
    assert_eq!(report.marked_failed, 1);

    let failed = ledger.list_by_status(AlertStatus::Failed).unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].content, "gate left open");
    assert!(ledger
        .list_by_status(AlertStatus::Pending)
        .unwrap()
        .is_empty());
    assert!(signals
        .try_iter()
        .any(|s| matches!(s, AlertSignal::LocationUnavailable { .. })));

    // The late transport failure must not revive the record.
    drop(release_tx);
    std::thread::sleep(Duration::from_millis(200));
    let record = ledger.get(&failed[0].alert_id).unwrap().unwrap();
    assert_eq!(record.status, AlertStatus::Failed);
}

#[test]
fn shutdown_grace_lets_retry_finish() {
    let transport = Arc::new(FlakyTransport {
        calls: AtomicUsize::new(0),
        fail_first: 1,
    });
    let ledger: Arc<dyn AlertLedger> = Arc::new(InMemoryAlertLedger::new());

    let handle = start_with(
        scripted(vec![vec![RecognizedItem::text("forklift in aisle 3", 0.9)]]),
        AlertTrigger::any(),
        transport.clone(),
        ledger.clone(),
        retries(Duration::from_millis(300)),
        GeolocationResolver::new(Duration::from_secs(900)),
        settings(8),
    );
    assert!(handle.submit_frame(frame(1)));
    assert!(wait_until(Duration::from_secs(5), || transport
        .calls
        .load(Ordering::SeqCst)
        >= 1));

    // The retry is due well inside the grace period.
    let report = handle.shutdown(Duration::from_secs(3));
    assert!(report.drained);
    assert_eq!(report.marked_failed, 0);

    let sent = ledger.list_by_status(AlertStatus::Sent).unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].content, "forklift in aisle 3");
    assert_eq!(sent[0].attempt_count, 2);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn full_dispatch_backlog_drops_excess_jobs() {
    let (release_tx, release_rx) = mpsc::channel();
    let transport = Arc::new(HangingTransport {
        entered: AtomicBool::new(false),
        release: Mutex::new(release_rx),
    });
    let ledger: Arc<dyn AlertLedger> = Arc::new(InMemoryAlertLedger::new());

    let handle = start_with(
        scripted(vec![
            vec![RecognizedItem::text("door 1 open", 0.9)],
            vec![
                RecognizedItem::text("door 2 open", 0.9),
                RecognizedItem::text("door 3 open", 0.9),
                RecognizedItem::text("door 4 open", 0.9),
            ],
        ]),
        AlertTrigger::any(),
        transport.clone(),
        ledger.clone(),
        retries(Duration::from_millis(10)),
        GeolocationResolver::new(Duration::from_secs(900)),
        PipelineSettings {
            workers: 1,
            job_capacity: 1,
            ..settings(8)
        },
    );

    // The only worker is stuck delivering the first alert.
    assert!(handle.submit_frame(frame(1)));
    assert!(wait_until(Duration::from_secs(5), || transport
        .entered
        .load(Ordering::SeqCst)));

    assert!(handle.submit_frame(frame(2)));
    assert!(wait_until(Duration::from_secs(5), || handle
        .stats()
        .jobs_dropped
        == 2));

    let stats = handle.stats();
    assert_eq!(stats.events_emitted, 4);
    assert_eq!(stats.jobs_dispatched, 1);

    let report = handle.shutdown(Duration::from_millis(300));
    assert_eq!(report.marked_failed, 1);
    drop(release_tx);

    let records = ledger.list_since(0).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].content, "door 1 open");
}

#[test]
fn non_qualifying_events_are_not_dispatched() {
    let transport = Arc::new(RecordingTransport::default());
    let ledger: Arc<dyn AlertLedger> = Arc::new(InMemoryAlertLedger::new());

    let handle = start(
        scripted(vec![vec![
            RecognizedItem::text("NO PARKING", 0.9),
            RecognizedItem::barcode("XYZ-1", 0.9),
        ]]),
        AlertTrigger::new(vec![DetectionKind::Barcode], vec!["abc".into()]),
        GeolocationResolver::new(Duration::from_secs(900)),
        transport.clone(),
        ledger.clone(),
        8,
    );
    assert!(handle.submit_frame(frame(1)));
    assert!(wait_until(Duration::from_secs(5), || handle
        .stats()
        .events_emitted
        == 2));
    std::thread::sleep(Duration::from_millis(200));

    let stats = handle.stats();
    assert_eq!(stats.events_filtered, 2);
    assert_eq!(stats.jobs_dispatched, 0);
    assert!(transport.messages().is_empty());
    assert!(ledger.list_since(0).unwrap().is_empty());
    handle.shutdown(Duration::from_secs(2));
}

#[test]
fn slow_recognition_drops_oldest_frames() {
    let seen = Arc::new(AtomicUsize::new(0));
    let mut registry = RecognizerRegistry::new();
    registry.register(SlowRecognizer {
        delay: Duration::from_millis(200),
        seen: seen.clone(),
    });
    let handle = start(
        RecognitionAdapter::new(registry, AdapterConfig::default()),
        AlertTrigger::any(),
        GeolocationResolver::new(Duration::from_secs(900)),
        Arc::new(RecordingTransport::default()),
        Arc::new(InMemoryAlertLedger::new()),
        2,
    );

    for seq in 1..=10 {
        assert!(handle.submit_frame(frame(seq)));
    }
    let queue = handle.queue_stats();
    assert_eq!(queue.pushed, 10);
    assert!(queue.dropped >= 7, "dropped only {}", queue.dropped);

    let dispatcher = handle.dispatcher().clone();
    assert!(!handle.is_shutting_down());
    let report = handle.shutdown(Duration::from_secs(2));
    assert!(report.drained);
    assert!(seen.load(Ordering::SeqCst) <= 3);
    assert!(dispatcher.shutdown_signal().is_triggered());
}
