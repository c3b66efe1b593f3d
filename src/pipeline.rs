//! Lane wiring.
//!
//! - Acquisition (caller): `PipelineHandle::submit_frame`, never blocks.
//! - Recognition/debounce: one thread. Owns the debouncer; pops frames, analyzes,
//!   debounces, sweeps, filters through the trigger and queues dispatch jobs.
//! - Dispatch: `workers` threads sharing one bounded job channel. Each job resolves a
//!   location within the geolocation deadline, then dispatches. When the channel is
//!   full the recognition lane drops the job and counts it.
//!
//! Shutdown triggers the shared signal and closes the frame queue. Queued jobs are
//! skipped, while cycles already running (including retries in backoff) may finish
//! within `grace`. After that, leftover Pending records are marked Failed.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::debounce::{AlertTrigger, DebounceConfig, EventDebouncer};
use crate::dispatch::{AlertDispatcher, AlertSignal};
use crate::frame::{Frame, FrameQueue, QueueStats, DEFAULT_QUEUE_CAPACITY};
use crate::geo::GeolocationResolver;
use crate::ledger::AlertLedger;
use crate::recognize::RecognitionAdapter;
use crate::sync::ShutdownSignal;
use crate::{now_ms, DetectionEvent};

pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_GEO_DEADLINE: Duration = Duration::from_secs(8);
pub const DEFAULT_JOB_CAPACITY: usize = 64;
const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Dispatch jobs waiting for a free worker; extra jobs are dropped.
    pub job_capacity: usize,
    /// Overall budget for one location resolution.
    pub geo_deadline: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            job_capacity: DEFAULT_JOB_CAPACITY,
            geo_deadline: DEFAULT_GEO_DEADLINE,
        }
    }
}

pub struct PipelineParts {
    pub adapter: RecognitionAdapter,
    pub debounce: DebounceConfig,
    pub trigger: AlertTrigger,
    pub resolver: Arc<GeolocationResolver>,
    pub dispatcher: Arc<AlertDispatcher>,
    pub settings: PipelineSettings,
}

#[derive(Debug, Default)]
struct Counters {
    frames_analyzed: AtomicU64,
    detections: AtomicU64,
    events_emitted: AtomicU64,
    events_filtered: AtomicU64,
    jobs_dispatched: AtomicU64,
    jobs_skipped: AtomicU64,
    jobs_dropped: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_analyzed: u64,
    pub detections: u64,
    pub events_emitted: u64,
    pub events_filtered: u64,
    pub jobs_dispatched: u64,
    pub jobs_skipped: u64,
    /// Jobs refused because the dispatch channel was full.
    pub jobs_dropped: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Frames still queued when acquisition stopped.
    pub frames_discarded: usize,
    /// Dispatch jobs dropped without an attempt.
    pub jobs_skipped: u64,
    /// Pending records marked Failed after the grace period.
    pub marked_failed: usize,
    /// All lane threads exited within the grace period.
    pub drained: bool,
}

struct DispatchJob {
    event: DetectionEvent,
}

/// Sends one unit on drop, so the shutdown path learns a lane exited even on panic.
struct ExitNotice(Sender<()>);

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

pub struct Pipeline;

impl Pipeline {
    pub fn start(parts: PipelineParts) -> Result<PipelineHandle> {
        let PipelineParts {
            adapter,
            debounce,
            trigger,
            resolver,
            dispatcher,
            settings,
        } = parts;

        let shutdown = dispatcher.shutdown_signal().clone();
        let queue = Arc::new(FrameQueue::new(settings.queue_capacity));
        let counters = Arc::new(Counters::default());
        let active = Arc::new(Mutex::new(Vec::new()));
        let (signal_tx, signal_rx) = mpsc::channel();
        dispatcher.set_signals(signal_tx);

        let (job_tx, job_rx) = mpsc::sync_channel::<DispatchJob>(settings.job_capacity.max(1));
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (exit_tx, exit_rx) = mpsc::channel();

        adapter.warm_up();

        let mut threads = Vec::new();
        let recognition = RecognitionLane {
            adapter,
            debouncer: EventDebouncer::new(debounce),
            trigger,
            queue: queue.clone(),
            jobs: job_tx,
            shutdown: shutdown.clone(),
            counters: counters.clone(),
            active: active.clone(),
        };
        let notice = ExitNotice(exit_tx.clone());
        threads.push(
            std::thread::Builder::new()
                .name("guard-recognition".into())
                .spawn(move || {
                    let _notice = notice;
                    recognition.run();
                })
                .context("spawn recognition lane")?,
        );

        let workers = settings.workers.max(1);
        for idx in 0..workers {
            let worker = DispatchWorker {
                jobs: job_rx.clone(),
                resolver: resolver.clone(),
                dispatcher: dispatcher.clone(),
                shutdown: shutdown.clone(),
                counters: counters.clone(),
                geo_deadline: settings.geo_deadline,
            };
            let notice = ExitNotice(exit_tx.clone());
            threads.push(
                std::thread::Builder::new()
                    .name(format!("guard-dispatch-{}", idx))
                    .spawn(move || {
                        let _notice = notice;
                        worker.run();
                    })
                    .with_context(|| format!("spawn dispatch worker {}", idx))?,
            );
        }

        log::info!(
            "pipeline started: {} dispatch workers, queue capacity {}, job capacity {}",
            workers,
            queue.capacity(),
            settings.job_capacity.max(1)
        );

        Ok(PipelineHandle {
            queue,
            shutdown,
            dispatcher,
            counters,
            active,
            signals: Mutex::new(Some(signal_rx)),
            threads,
            exits: exit_rx,
        })
    }
}

// -------------------- Recognition lane --------------------

struct RecognitionLane {
    adapter: RecognitionAdapter,
    debouncer: EventDebouncer,
    trigger: AlertTrigger,
    queue: Arc<FrameQueue>,
    jobs: SyncSender<DispatchJob>,
    shutdown: ShutdownSignal,
    counters: Arc<Counters>,
    active: Arc<Mutex<Vec<DetectionEvent>>>,
}

impl RecognitionLane {
    fn run(mut self) {
        // Debouncer clock: timestamp of the newest frame, advanced by wall time since.
        let mut clock: Option<(u64, Instant)> = None;

        while !self.shutdown.is_triggered() {
            match self.queue.pop_timeout(IDLE_POLL) {
                Some(frame) => {
                    let at = clock.map_or(frame.captured_at_ms, |(ts, _)| {
                        ts.max(frame.captured_at_ms)
                    });
                    clock = Some((at, Instant::now()));
                    self.process(frame, at);
                }
                None if self.queue.is_closed() => break,
                None => {}
            }

            let now = clock.map_or_else(now_ms, |(ts, since)| {
                ts + since.elapsed().as_millis() as u64
            });
            for expired in self.debouncer.sweep(now) {
                log::debug!(
                    "event {} expired ({} sightings, {} alert rounds)",
                    expired.id,
                    expired.occurrence_count,
                    expired.alert_round + 1
                );
            }
            *self.active.lock().unwrap_or_else(PoisonError::into_inner) = self.debouncer.active();
        }
        log::debug!("recognition lane stopped");
    }

    fn process(&mut self, frame: Frame, at_ms: u64) {
        let batch = self.adapter.analyze(&frame);
        self.counters.frames_analyzed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .detections
            .fetch_add(batch.len() as u64, Ordering::Relaxed);

        for event in self.debouncer.observe(&batch, at_ms) {
            self.counters.events_emitted.fetch_add(1, Ordering::Relaxed);
            if !self.trigger.qualifies(&event) {
                self.counters.events_filtered.fetch_add(1, Ordering::Relaxed);
                log::debug!("event {} not alertable", event.id);
                continue;
            }
            log::info!(
                "event {} ({}) round {} queued for dispatch",
                event.id,
                event.kind,
                event.alert_round
            );
            match self.jobs.try_send(DispatchJob { event }) {
                Ok(()) => {}
                Err(TrySendError::Full(job)) => {
                    self.counters.jobs_dropped.fetch_add(1, Ordering::Relaxed);
                    log::error!(
                        "dispatch backlog full; dropping event {} round {}",
                        job.event.id,
                        job.event.alert_round
                    );
                }
                Err(TrySendError::Disconnected(_)) => {
                    log::warn!("dispatch lane gone; dropping event");
                }
            }
        }
    }
}

// -------------------- Dispatch lane --------------------

struct DispatchWorker {
    jobs: Arc<Mutex<Receiver<DispatchJob>>>,
    resolver: Arc<GeolocationResolver>,
    dispatcher: Arc<AlertDispatcher>,
    shutdown: ShutdownSignal,
    counters: Arc<Counters>,
    geo_deadline: Duration,
}

impl DispatchWorker {
    fn run(self) {
        loop {
            let job = {
                let rx = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
                rx.recv_timeout(IDLE_POLL)
            };
            match job {
                Ok(job) => self.handle(job),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if self.shutdown.is_triggered() {
                        break;
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn handle(&self, job: DispatchJob) {
        let event = job.event;
        if self.shutdown.is_triggered() {
            self.counters.jobs_skipped.fetch_add(1, Ordering::Relaxed);
            log::warn!("event {} skipped: shutting down", event.id);
            return;
        }

        let fix = match self.resolver.resolve(self.geo_deadline) {
            Ok(fix) => Some(fix),
            Err(e) => {
                log::warn!("event {}: {}", event.id, e);
                None
            }
        };

        self.counters.jobs_dispatched.fetch_add(1, Ordering::Relaxed);
        match self.dispatcher.dispatch(&event, fix) {
            Ok(record) => log::debug!(
                "alert {} finished as {} after {} attempts",
                record.alert_id,
                record.status,
                record.attempt_count
            ),
            Err(e) => log::error!("event {} dispatch error: {}", event.id, e),
        }
    }
}

// -------------------- Handle --------------------

pub struct PipelineHandle {
    queue: Arc<FrameQueue>,
    shutdown: ShutdownSignal,
    dispatcher: Arc<AlertDispatcher>,
    counters: Arc<Counters>,
    active: Arc<Mutex<Vec<DetectionEvent>>>,
    signals: Mutex<Option<Receiver<AlertSignal>>>,
    threads: Vec<JoinHandle<()>>,
    exits: Receiver<()>,
}

impl PipelineHandle {
    /// Hand a frame to the recognition lane. Never blocks; evicts the oldest queued
    /// frame when full. Returns false once shutdown has begun.
    pub fn submit_frame(&self, frame: Frame) -> bool {
        self.queue.push(frame).is_some()
    }

    /// Take the signal receiver. Only the first caller gets it.
    pub fn take_signals(&self) -> Option<Receiver<AlertSignal>> {
        self.signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn dispatcher(&self) -> &Arc<AlertDispatcher> {
        &self.dispatcher
    }

    pub fn ledger(&self) -> &Arc<dyn AlertLedger> {
        self.dispatcher.ledger()
    }

    /// Active events as of the last recognition pass, most recent first.
    pub fn active_events(&self) -> Vec<DetectionEvent> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            frames_analyzed: c.frames_analyzed.load(Ordering::Relaxed),
            detections: c.detections.load(Ordering::Relaxed),
            events_emitted: c.events_emitted.load(Ordering::Relaxed),
            events_filtered: c.events_filtered.load(Ordering::Relaxed),
            jobs_dispatched: c.jobs_dispatched.load(Ordering::Relaxed),
            jobs_skipped: c.jobs_skipped.load(Ordering::Relaxed),
            jobs_dropped: c.jobs_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_triggered()
    }

    pub fn shutdown(self, grace: Duration) -> ShutdownReport {
        log::info!("pipeline shutting down (grace {:?})", grace);
        self.shutdown.trigger();
        let frames_discarded = self.queue.close();

        let expected = self.threads.len();
        let deadline = Instant::now() + grace;
        let mut exited = 0;
        while exited < expected {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.exits.recv_timeout(remaining) {
                Ok(()) => exited += 1,
                Err(_) => break,
            }
        }
        let drained = exited == expected;
        if drained {
            for thread in self.threads {
                let _ = thread.join();
            }
        } else {
            log::warn!(
                "{} of {} lane threads still busy after grace period",
                expected - exited,
                expected
            );
        }

        let marked_failed = match self.dispatcher.fail_pending() {
            Ok(n) => n,
            Err(e) => {
                log::error!("failed to mark pending alerts: {}", e);
                0
            }
        };

        let report = ShutdownReport {
            frames_discarded,
            jobs_skipped: self.counters.jobs_skipped.load(Ordering::Relaxed),
            marked_failed,
            drained,
        };
        log::info!("pipeline stopped: {:?}", report);
        report
    }
}
