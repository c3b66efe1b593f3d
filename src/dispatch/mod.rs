//! Alert dispatcher.
//!
//! Owns the AlertRecord state machine:
//!
//! ```text
//!   (none | Failed | Exhausted) --dispatch/resend--> Pending
//!   Sent --dispatch of a later alert round--> Pending
//!   Pending --send ok--> Sent
//!   Pending --send err, attempts < max--> Pending (after backoff)
//!   Pending --send err, attempts == max--> Exhausted
//!   Pending --fail_pending--> Failed
//! ```
//!
//! Each detection event owns exactly one record, keyed by its event id, so at most one
//! record per event is Pending or Sent. A re-alert reuses that record for a new attempt
//! cycle. The check-and-claim step and every status write run under a per-alert-id
//! lock; delivery itself runs unlocked, so slow transports never block dispatches for
//! other alerts.
//!
//! Shutdown stops new cycles but lets retries already in backoff continue.
//! `fail_pending` ends them.

mod message;

pub use message::{AlertMessage, DEFAULT_MAP_LINK_BASE};

use rand::Rng;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};
use crate::ledger::{AlertLedger, AlertRecord, AlertStatus};
use crate::sync::{KeyedLocks, ShutdownSignal};
use crate::transport::AlertTransport;
use crate::{now_ms, DetectionEvent, EventId, GeoFix, MapPin};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

// -------------------- Retry policy --------------------

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total delivery attempts per cycle, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Random extra delay as a fraction of the computed delay (0.0 = none).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt number `attempt` (1-based): `min(base * 2^(attempt-1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..self.jitter.min(1.0));
        delay.mul_f64(1.0 + extra).min(self.max_delay)
    }
}

// -------------------- Signals --------------------

/// Notifications for the operator-facing layer.
#[derive(Clone, Debug, PartialEq)]
pub enum AlertSignal {
    DeliveryConfirmed {
        alert_id: String,
        event_id: EventId,
        message_id: String,
    },
    DeliveryFailed {
        alert_id: String,
        attempts: u32,
        last_error: String,
    },
    LocationUnavailable {
        alert_id: String,
    },
    ShowOnMap(MapPin),
}

// -------------------- Dispatcher --------------------

enum Claim {
    /// A live record already covers this round; return it untouched.
    Existing(AlertRecord),
    /// This caller owns a fresh Pending cycle.
    Claimed(AlertRecord),
}

pub struct AlertDispatcher {
    transport: Arc<dyn AlertTransport>,
    ledger: Arc<dyn AlertLedger>,
    policy: RetryPolicy,
    map_link_base: Option<String>,
    shutdown: ShutdownSignal,
    /// Ends backoff waits early; set by `fail_pending`.
    abort: ShutdownSignal,
    locks: KeyedLocks,
    signals: Mutex<Option<Sender<AlertSignal>>>,
}

impl AlertDispatcher {
    pub fn new(
        transport: Arc<dyn AlertTransport>,
        ledger: Arc<dyn AlertLedger>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            ledger,
            policy,
            map_link_base: Some(DEFAULT_MAP_LINK_BASE.to_string()),
            shutdown: ShutdownSignal::new(),
            abort: ShutdownSignal::new(),
            locks: KeyedLocks::new(),
            signals: Mutex::new(None),
        }
    }

    /// Base for map links in messages; `None` disables the link.
    pub fn with_map_link_base(mut self, base: Option<String>) -> Self {
        self.map_link_base = base;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_signals(self, tx: Sender<AlertSignal>) -> Self {
        self.set_signals(tx);
        self
    }

    /// Route signals to `tx`, replacing any previous receiver.
    pub fn set_signals(&self, tx: Sender<AlertSignal>) {
        *self.signals.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    pub fn ledger(&self) -> &Arc<dyn AlertLedger> {
        &self.ledger
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    fn signal(&self, signal: AlertSignal) {
        let guard = self.signals.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            // Receiver gone means nobody is listening; not an error.
            let _ = tx.send(signal);
        }
    }

    /// Deliver one emission of an event. Idempotent per event and round.
    ///
    /// Returns the existing record untouched when it is Pending, or Sent for the same or
    /// a later round. Otherwise runs a full attempt cycle on the event's record and
    /// returns the final state (Sent, Exhausted, or Failed on shutdown). Only ledger
    /// failures are errors.
    pub fn dispatch(
        &self,
        event: &DetectionEvent,
        geo_fix: Option<GeoFix>,
    ) -> PipelineResult<AlertRecord> {
        let alert_id = event.alert_id();
        let claim = self.locks.with_key(&alert_id, || -> PipelineResult<Claim> {
            let previous = self.ledger.get(&alert_id)?;
            if let Some(existing) = &previous {
                let realert =
                    existing.status == AlertStatus::Sent && event.alert_round > existing.round;
                if existing.status.is_live() && !realert {
                    return Ok(Claim::Existing(existing.clone()));
                }
            }
            if self.shutdown.is_triggered() {
                return Err(PipelineError::ShuttingDown);
            }
            let now = now_ms();
            let mut record = AlertRecord::pending(event, geo_fix, now);
            if let Some(previous) = previous {
                record.round = record.round.max(previous.round);
                record.created_at_ms = previous.created_at_ms;
                record.resend_count = previous.resend_count;
            }
            self.ledger.upsert(&record)?;
            Ok(Claim::Claimed(record))
        })?;

        match claim {
            Claim::Existing(record) => {
                log::debug!(
                    "alert {} already {}; not dispatching again",
                    record.alert_id,
                    record.status
                );
                Ok(record)
            }
            Claim::Claimed(record) => {
                log::info!(
                    "alert {} round {} claimed ({} sightings)",
                    record.alert_id,
                    record.round,
                    event.occurrence_count
                );
                self.run_cycle(record)
            }
        }
    }

    /// Operator-triggered re-send of a Failed or Exhausted record.
    pub fn resend(&self, alert_id: &str) -> PipelineResult<AlertRecord> {
        let record = self.locks.with_key(alert_id, || -> PipelineResult<AlertRecord> {
            let mut record = self
                .ledger
                .get(alert_id)?
                .ok_or_else(|| PipelineError::UnknownAlert(alert_id.to_string()))?;
            if !record.status.is_resendable() {
                return Err(PipelineError::NotResendable {
                    alert_id: alert_id.to_string(),
                    status: record.status.to_string(),
                });
            }
            if self.shutdown.is_triggered() {
                return Err(PipelineError::ShuttingDown);
            }
            record.status = AlertStatus::Pending;
            record.attempt_count = 0;
            record.resend_count += 1;
            record.last_error = None;
            record.updated_at_ms = now_ms();
            self.ledger.upsert(&record)?;
            Ok(record)
        })?;
        log::info!(
            "alert {} re-send #{} requested",
            record.alert_id,
            record.resend_count
        );
        self.run_cycle(record)
    }

    /// Mark every Pending record Failed and wake cycles sleeping in backoff, which then
    /// stop without another attempt. Returns how many records were marked.
    pub fn fail_pending(&self) -> PipelineResult<usize> {
        let marked = self.mark_pending_failed();
        self.abort.trigger();
        marked
    }

    fn mark_pending_failed(&self) -> PipelineResult<usize> {
        let mut marked = 0;
        for pending in self.ledger.list_by_status(AlertStatus::Pending)? {
            let changed = self
                .locks
                .with_key(&pending.alert_id, || -> PipelineResult<bool> {
                    let Some(mut current) = self.ledger.get(&pending.alert_id)? else {
                        return Ok(false);
                    };
                    if current.status != AlertStatus::Pending {
                        return Ok(false);
                    }
                    current.status = AlertStatus::Failed;
                    current.last_error = Some(
                        current
                            .last_error
                            .take()
                            .unwrap_or_else(|| "unresolved at shutdown".to_string()),
                    );
                    current.updated_at_ms = now_ms();
                    self.ledger.upsert(&current)?;
                    Ok(true)
                })?;
            if changed {
                log::warn!("alert {} marked failed at shutdown", pending.alert_id);
                marked += 1;
            }
        }
        Ok(marked)
    }

    /// Store a status change. Returns false when the cycle was finalized elsewhere
    /// (shutdown marked it Failed) and must stop; a late success still wins.
    fn persist(&self, record: &AlertRecord) -> PipelineResult<bool> {
        self.locks.with_key(&record.alert_id, || -> PipelineResult<bool> {
            if record.status == AlertStatus::Pending {
                if let Some(current) = self.ledger.get(&record.alert_id)? {
                    if current.status == AlertStatus::Failed {
                        return Ok(false);
                    }
                }
            }
            self.ledger.upsert(record)?;
            Ok(true)
        })
    }

    fn run_cycle(&self, mut record: AlertRecord) -> PipelineResult<AlertRecord> {
        let message = AlertMessage::from_record(&record, self.map_link_base.as_deref());
        match &record.geo_fix {
            Some(fix) => self.signal(AlertSignal::ShowOnMap(MapPin::from_fix(
                fix,
                record.content.clone(),
            ))),
            None => {
                log::warn!("alert {} has no location", record.alert_id);
                self.signal(AlertSignal::LocationUnavailable {
                    alert_id: record.alert_id.clone(),
                });
            }
        }

        let max_attempts = self.policy.max_attempts.max(1);
        loop {
            record.attempt_count += 1;
            let attempt_at = now_ms();
            record.last_attempt_at_ms = Some(attempt_at);
            record.updated_at_ms = attempt_at;

            match self.transport.send(&message) {
                Ok(receipt) => {
                    record.status = AlertStatus::Sent;
                    record.transport_message_id = Some(receipt.message_id.clone());
                    record.last_error = None;
                    self.persist(&record)?;
                    log::info!(
                        "alert {} delivered via {} on attempt {} (message {})",
                        record.alert_id,
                        self.transport.name(),
                        record.attempt_count,
                        receipt.message_id
                    );
                    self.signal(AlertSignal::DeliveryConfirmed {
                        alert_id: record.alert_id.clone(),
                        event_id: record.event_id.clone(),
                        message_id: receipt.message_id,
                    });
                    return Ok(record);
                }
                Err(e) => {
                    log::warn!(
                        "alert {} attempt {}/{} via {} failed: {}",
                        record.alert_id,
                        record.attempt_count,
                        max_attempts,
                        self.transport.name(),
                        e
                    );
                    record.last_error = Some(e.to_string());
                }
            }

            if record.attempt_count >= max_attempts {
                record.status = AlertStatus::Exhausted;
                self.persist(&record)?;
                let failure = PipelineError::DeliveryFailed {
                    alert_id: record.alert_id.clone(),
                    attempts: record.attempt_count,
                    last_error: record.last_error.clone().unwrap_or_default(),
                };
                log::error!("{}", failure);
                self.signal(AlertSignal::DeliveryFailed {
                    alert_id: record.alert_id.clone(),
                    attempts: record.attempt_count,
                    last_error: record.last_error.clone().unwrap_or_default(),
                });
                return Ok(record);
            }

            if !self.persist(&record)? {
                return self.finish_failed(record);
            }
            let delay = self.policy.backoff(record.attempt_count);
            if self.abort.wait_timeout(delay) {
                log::warn!(
                    "alert {} abandoned in backoff after {} attempts",
                    record.alert_id,
                    record.attempt_count
                );
                return self.finish_failed(record);
            }
        }
    }

    fn finish_failed(&self, mut record: AlertRecord) -> PipelineResult<AlertRecord> {
        record.status = AlertStatus::Failed;
        record.updated_at_ms = now_ms();
        self.persist(&record)?;
        self.signal(AlertSignal::DeliveryFailed {
            alert_id: record.alert_id.clone(),
            attempts: record.attempt_count,
            last_error: record
                .last_error
                .clone()
                .unwrap_or_else(|| "interrupted by shutdown".to_string()),
        });
        Ok(record)
    }
}
