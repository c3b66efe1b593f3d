//! Geolocation fallback chain.
//!
//! Sources are tried in order (typically satellite, network, IP lookup), each bounded by
//! its own timeout and by what is left of the overall deadline. When every source fails
//! the last known good fix is used if it is not too old.

mod device;
mod ip;

pub use device::{DeviceFixFeed, DeviceLocationSource};
pub use ip::{parse_ipinfo, IpLocationSource, DEFAULT_IP_LOOKUP_URL, IP_FIX_ACCURACY_M};

use anyhow::Result;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{PipelineError, PipelineResult};
use crate::{now_ms, FixSource, GeoFix};

pub const DEFAULT_STALENESS_CEILING: Duration = Duration::from_secs(15 * 60);

pub trait LocationSource: Send + Sync {
    fn name(&self) -> &str;

    /// Kind of fix this source produces.
    fn source(&self) -> FixSource;

    /// Produce a fix within `timeout`. May block up to `timeout`.
    fn locate(&self, timeout: Duration) -> Result<GeoFix>;
}

struct SourceSlot {
    source: Arc<dyn LocationSource>,
    timeout: Duration,
}

pub struct GeolocationResolver {
    sources: Vec<SourceSlot>,
    staleness_ceiling: Duration,
    last_known: Mutex<Option<GeoFix>>,
}

impl GeolocationResolver {
    pub fn new(staleness_ceiling: Duration) -> Self {
        Self {
            sources: Vec::new(),
            staleness_ceiling,
            last_known: Mutex::new(None),
        }
    }

    /// Append a source to the chain with its own timeout.
    pub fn with_source(mut self, source: Arc<dyn LocationSource>, timeout: Duration) -> Self {
        self.sources.push(SourceSlot { source, timeout });
        self
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources
            .iter()
            .map(|s| s.source.name().to_string())
            .collect()
    }

    pub fn last_known(&self) -> Option<GeoFix> {
        self.last_known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Seed or refresh the last-known cache.
    pub fn remember(&self, fix: &GeoFix) {
        if !fix.is_valid() || fix.source == FixSource::LastKnown {
            return;
        }
        let mut cache = self
            .last_known
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let newer = cache
            .as_ref()
            .map_or(true, |cached| fix.resolved_at_ms >= cached.resolved_at_ms);
        if newer {
            *cache = Some(fix.clone());
        }
    }

    /// Resolve a fix within `deadline`. Never blocks past the deadline.
    pub fn resolve(&self, deadline: Duration) -> PipelineResult<GeoFix> {
        let started = Instant::now();
        let mut failures = Vec::new();

        for slot in &self.sources {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                failures.push(format!("{}: deadline reached", slot.source.name()));
                break;
            }
            let budget = slot.timeout.min(remaining);
            match locate_bounded(slot.source.clone(), budget) {
                Ok(fix) => {
                    log::debug!(
                        "location from {} ({:.5},{:.5} ±{:.0}m) in {:?}",
                        slot.source.name(),
                        fix.latitude,
                        fix.longitude,
                        fix.accuracy_m,
                        started.elapsed()
                    );
                    self.remember(&fix);
                    return Ok(fix);
                }
                Err(reason) => {
                    log::debug!("location source {} failed: {}", slot.source.name(), reason);
                    failures.push(format!("{}: {}", slot.source.name(), reason));
                }
            }
        }

        if let Some(cached) = self.last_known() {
            let age = cached.age_ms(now_ms());
            if age <= self.staleness_ceiling.as_millis() as u64 {
                log::info!("using last known location ({} ms old)", age);
                return Ok(GeoFix {
                    source: FixSource::LastKnown,
                    ..cached
                });
            }
            failures.push(format!("last known fix too old ({} ms)", age));
        }

        Err(PipelineError::LocationUnavailable(if failures.is_empty() {
            "no location sources configured".to_string()
        } else {
            failures.join("; ")
        }))
    }
}

/// Run `locate` on its own thread and stop waiting after `budget`.
///
/// A source that overruns is abandoned; its thread finishes in the background and the
/// late result is discarded.
fn locate_bounded(source: Arc<dyn LocationSource>, budget: Duration) -> Result<GeoFix, String> {
    let (tx, rx) = mpsc::channel();
    let thread_name = format!("geo-{}", source.name());
    std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let _ = tx.send(source.locate(budget));
        })
        .map_err(|e| format!("spawn failed: {}", e))?;

    match rx.recv_timeout(budget) {
        Ok(Ok(fix)) if fix.is_valid() => Ok(fix),
        Ok(Ok(fix)) => Err(format!(
            "invalid coordinates ({}, {})",
            fix.latitude, fix.longitude
        )),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(format!("timed out after {:?}", budget)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err("source thread panicked".to_string()),
    }
}
