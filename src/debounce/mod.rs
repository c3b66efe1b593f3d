//! Event debouncer.
//!
//! Folds per-frame `RawDetection`s into `DetectionEvent`s. Each content key moves
//! through `New -> Active -> Expired`:
//!
//! - `New -> Active`: the first sighting creates an instance. It is emitted as soon as
//!   it has `min_occurrences` sightings and no emission for the same content happened
//!   within the cool-down window.
//! - `Active -> Active`: further sightings within the inactivity timeout update
//!   `last_seen_ms`/`occurrence_count`. An emitted instance is re-emitted (next alert
//!   round) only after `realert_threshold` more sightings AND `rearm_interval` since its
//!   last emission.
//! - `Active -> Expired`: no sighting for longer than the inactivity timeout. A later
//!   sighting starts a fresh instance with a fresh id.
//!
//! Time is always passed in, so the state machine is deterministic under test.

mod trigger;

pub use trigger::AlertTrigger;

use std::collections::HashMap;
use std::time::Duration;

use crate::{ContentKey, DetectionEvent, EventId, RawDetection};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REARM_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_REALERT_THRESHOLD: u64 = 30;
pub const DEFAULT_MIN_OCCURRENCES: u64 = 1;

#[derive(Clone, Debug)]
pub struct DebounceConfig {
    /// Minimum spacing between two emissions for the same content.
    pub cooldown: Duration,
    /// Idle time after which an active instance expires.
    pub inactivity_timeout: Duration,
    /// Minimum time between an emission and a re-alert of the same instance.
    pub rearm_interval: Duration,
    /// Sightings since the last emission required to re-alert.
    pub realert_threshold: u64,
    /// Sightings required before an instance is first emitted.
    pub min_occurrences: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            rearm_interval: DEFAULT_REARM_INTERVAL,
            realert_threshold: DEFAULT_REALERT_THRESHOLD,
            min_occurrences: DEFAULT_MIN_OCCURRENCES,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventPhase {
    /// Seen, not yet emitted (waiting on `min_occurrences` or the cool-down).
    New,
    /// Emitted at least once and still being sighted.
    Active,
}

#[derive(Clone, Debug)]
struct TrackedEvent {
    event: DetectionEvent,
    phase: EventPhase,
    /// Occurrence count at the last emission.
    emitted_at_count: u64,
    /// Time of the last emission, if any.
    emitted_at_ms: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DebounceStats {
    pub sightings: u64,
    pub created: u64,
    pub emitted: u64,
    pub realerts: u64,
    pub expired: u64,
}

/// Debouncer state. Owned by the recognition lane; not shared across threads.
pub struct EventDebouncer {
    config: DebounceConfig,
    active: HashMap<ContentKey, TrackedEvent>,
    /// Last emission time per content key, kept past expiry for the cool-down.
    last_emitted: HashMap<ContentKey, u64>,
    stats: DebounceStats,
}

impl EventDebouncer {
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            config,
            active: HashMap::new(),
            last_emitted: HashMap::new(),
            stats: DebounceStats::default(),
        }
    }

    pub fn config(&self) -> &DebounceConfig {
        &self.config
    }

    /// Fold one frame's detections in. Returns the events to emit downstream.
    ///
    /// The batch is expected to be collapsed already (one entry per content key); any
    /// leftover collisions are merged here with the same kind precedence.
    pub fn observe(&mut self, batch: &[RawDetection], now_ms: u64) -> Vec<DetectionEvent> {
        let mut emitted: Vec<DetectionEvent> = Vec::new();
        let mut seen_in_batch: HashMap<ContentKey, usize> = HashMap::new();

        for detection in batch {
            let key = detection.key();
            if let Some(&pos) = seen_in_batch.get(&key) {
                // Same content twice in one frame counts as one sighting.
                if let Some(tracked) = self.active.get_mut(&key) {
                    if detection.kind.precedence() > tracked.event.kind.precedence() {
                        tracked.event.kind = detection.kind;
                    }
                }
                if let Some(out) = emitted.get_mut(pos) {
                    if out.key == key && detection.kind.precedence() > out.kind.precedence() {
                        out.kind = detection.kind;
                    }
                }
                continue;
            }
            if let Some(event) = self.sight(key.clone(), detection, now_ms) {
                seen_in_batch.insert(key, emitted.len());
                emitted.push(event);
            } else {
                seen_in_batch.insert(key, usize::MAX);
            }
        }
        emitted
    }

    fn sight(
        &mut self,
        key: ContentKey,
        detection: &RawDetection,
        now_ms: u64,
    ) -> Option<DetectionEvent> {
        self.stats.sightings += 1;
        let inactivity_ms = self.config.inactivity_timeout.as_millis() as u64;

        let expired = self
            .active
            .get(&key)
            .is_some_and(|t| now_ms.saturating_sub(t.event.last_seen_ms) > inactivity_ms);
        if expired {
            if let Some(old) = self.active.remove(&key) {
                self.stats.expired += 1;
                log::debug!(
                    "event {} expired after {} sightings",
                    old.event.id,
                    old.event.occurrence_count
                );
            }
        }

        let tracked = match self.active.entry(key.clone()) {
            std::collections::hash_map::Entry::Occupied(entry) => {
                let tracked = entry.into_mut();
                tracked.event.last_seen_ms = now_ms.max(tracked.event.last_seen_ms);
                tracked.event.occurrence_count += 1;
                if detection.kind.precedence() > tracked.event.kind.precedence() {
                    tracked.event.kind = detection.kind;
                }
                tracked
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                self.stats.created += 1;
                let event = DetectionEvent {
                    id: EventId::derive(&key, now_ms),
                    key: key.clone(),
                    kind: detection.kind,
                    content: detection.content.clone(),
                    first_seen_ms: now_ms,
                    last_seen_ms: now_ms,
                    occurrence_count: 1,
                    alert_round: 0,
                };
                log::debug!("event {} created for {} content", event.id, event.kind);
                entry.insert(TrackedEvent {
                    event,
                    phase: EventPhase::New,
                    emitted_at_count: 0,
                    emitted_at_ms: None,
                })
            }
        };

        let cooldown_ms = self.config.cooldown.as_millis() as u64;
        match tracked.phase {
            EventPhase::New => {
                if tracked.event.occurrence_count < self.config.min_occurrences {
                    return None;
                }
                let cooled = self
                    .last_emitted
                    .get(&key)
                    .map_or(true, |&at| now_ms.saturating_sub(at) >= cooldown_ms);
                if !cooled {
                    return None;
                }
                tracked.phase = EventPhase::Active;
            }
            EventPhase::Active => {
                let since_count = tracked
                    .event
                    .occurrence_count
                    .saturating_sub(tracked.emitted_at_count);
                let since_ms = tracked
                    .emitted_at_ms
                    .map_or(u64::MAX, |at| now_ms.saturating_sub(at));
                let rearm_ms = self.config.rearm_interval.as_millis() as u64;
                if since_count < self.config.realert_threshold.max(1) || since_ms < rearm_ms {
                    return None;
                }
                tracked.event.alert_round += 1;
                self.stats.realerts += 1;
            }
        }

        tracked.emitted_at_count = tracked.event.occurrence_count;
        tracked.emitted_at_ms = Some(now_ms);
        self.last_emitted.insert(key, now_ms);
        self.stats.emitted += 1;
        Some(tracked.event.clone())
    }

    /// Expire idle instances and prune cool-down tombstones. Returns expired events.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<DetectionEvent> {
        let inactivity_ms = self.config.inactivity_timeout.as_millis() as u64;
        let cooldown_ms = self.config.cooldown.as_millis() as u64;

        let expired_keys: Vec<ContentKey> = self
            .active
            .iter()
            .filter(|(_, t)| now_ms.saturating_sub(t.event.last_seen_ms) > inactivity_ms)
            .map(|(k, _)| k.clone())
            .collect();

        let mut expired = Vec::with_capacity(expired_keys.len());
        for key in expired_keys {
            if let Some(tracked) = self.active.remove(&key) {
                self.stats.expired += 1;
                expired.push(tracked.event);
            }
        }

        let active = &self.active;
        self.last_emitted.retain(|key, &mut at| {
            active.contains_key(key) || now_ms.saturating_sub(at) < cooldown_ms
        });
        expired
    }

    /// Current event for a content key, if active.
    pub fn get(&self, key: &ContentKey) -> Option<&DetectionEvent> {
        self.active.get(key).map(|t| &t.event)
    }

    pub fn phase(&self, key: &ContentKey) -> Option<EventPhase> {
        self.active.get(key).map(|t| t.phase)
    }

    /// Snapshot of active events, most recently seen first.
    pub fn active(&self) -> Vec<DetectionEvent> {
        let mut events: Vec<DetectionEvent> =
            self.active.values().map(|t| t.event.clone()).collect();
        events.sort_by(|a, b| b.last_seen_ms.cmp(&a.last_seen_ms));
        events
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn stats(&self) -> DebounceStats {
        self.stats
    }
}
