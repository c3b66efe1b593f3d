use anyhow::{anyhow, Result};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::{now_ms, FixSource, GeoFix};

use super::LocationSource;

/// Push cell the platform location service writes fixes into.
#[derive(Clone, Default)]
pub struct DeviceFixFeed {
    inner: Arc<(Mutex<Option<GeoFix>>, Condvar)>,
}

impl DeviceFixFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, fix: GeoFix) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = Some(fix);
        cvar.notify_all();
    }

    pub fn latest(&self) -> Option<GeoFix> {
        let (lock, _) = &*self.inner;
        lock.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Wait until the feed holds a fix no older than `max_age`.
    fn wait_fresh(&self, max_age: Duration, timeout: Duration) -> Option<GeoFix> {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let max_age_ms = max_age.as_millis() as u64;
        let mut slot = lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(fix) = slot.as_ref() {
                if fix.age_ms(now_ms()) <= max_age_ms {
                    return Some(fix.clone());
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = cvar
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
    }
}

/// Satellite or network positioning, fed by the platform through a `DeviceFixFeed`.
pub struct DeviceLocationSource {
    name: String,
    kind: FixSource,
    feed: DeviceFixFeed,
    max_fix_age: Duration,
}

impl DeviceLocationSource {
    pub fn new(
        name: impl Into<String>,
        kind: FixSource,
        feed: DeviceFixFeed,
        max_fix_age: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            feed,
            max_fix_age,
        }
    }

    pub fn feed(&self) -> &DeviceFixFeed {
        &self.feed
    }
}

impl LocationSource for DeviceLocationSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> FixSource {
        self.kind
    }

    fn locate(&self, timeout: Duration) -> Result<GeoFix> {
        let mut fix = self
            .feed
            .wait_fresh(self.max_fix_age, timeout)
            .ok_or_else(|| anyhow!("no fresh {} fix within {:?}", self.kind, timeout))?;
        fix.source = self.kind;
        Ok(fix)
    }
}
