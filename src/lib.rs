//! Guard Pipeline
//!
//! This crate implements the detection-to-alert core of a camera safety assistant.
//!
//! # Architecture
//!
//! Frames flow through three lanes:
//!
//! 1. **Acquisition** (external): the platform camera pushes frames into a bounded
//!    newest-N queue. Old frames are dropped under backpressure.
//! 2. **Recognition/debounce**: one thread runs the recognizer on each frame and folds
//!    raw detections into debounced `DetectionEvent`s.
//! 3. **Dispatch**: a fixed worker pool resolves a location for each alertable event
//!    and delivers the alert through the messaging transport, recording every attempt
//!    in the alert ledger.
//!
//! # Module Structure
//!
//! - `frame`: Frames and the bounded frame queue
//! - `ingest`: Synthetic frame source for the daemon and tests
//! - `recognize`: Recognizer backends and the recognition adapter
//! - `debounce`: Event debouncer and alert trigger policy
//! - `geo`: Location sources and the fallback resolver
//! - `dispatch`: Alert dispatcher (retry, backoff, idempotence)
//! - `ledger`: Alert record stores
//! - `transport`: Messaging transport (Telegram Bot API)
//! - `pipeline`: Lane wiring, worker pool, shutdown
//! - Core types: detections, events, fixes, time helpers

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod debounce;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod geo;
pub mod ingest;
pub mod ledger;
pub mod pipeline;
pub mod recognize;
pub mod sync;
pub mod transport;

pub use config::GuardConfig;
pub use debounce::{AlertTrigger, DebounceConfig, EventDebouncer};
pub use dispatch::{AlertDispatcher, AlertMessage, AlertSignal, RetryPolicy};
pub use error::{PipelineError, TransportError};
pub use frame::{Frame, FrameQueue};
pub use geo::{
    DeviceFixFeed, DeviceLocationSource, GeolocationResolver, IpLocationSource, LocationSource,
};
pub use ingest::{SyntheticConfig, SyntheticSource};
pub use ledger::{AlertLedger, InMemoryAlertLedger, SqliteAlertLedger};
pub use pipeline::{Pipeline, PipelineHandle, ShutdownReport};
pub use recognize::{
    RecognitionAdapter, RecognitionCapability, RecognizedItem, Recognizer, RecognizerRegistry,
};
pub use transport::{AlertTransport, DeliveryReceipt, TelegramConfig, TelegramTransport};

// -------------------- Time --------------------

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// -------------------- Detections --------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DetectionKind {
    Text,
    Barcode,
}

impl DetectionKind {
    /// Precedence when two detections in one frame collide on content.
    /// Barcodes are the stronger signal.
    pub fn precedence(self) -> u8 {
        match self {
            DetectionKind::Barcode => 1,
            DetectionKind::Text => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DetectionKind::Text => "text",
            DetectionKind::Barcode => "barcode",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Some(DetectionKind::Text),
            "barcode" => Some(DetectionKind::Barcode),
            _ => None,
        }
    }
}

impl fmt::Display for DetectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recognized item from one frame. Discarded after debouncing.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub content: String,
    pub kind: DetectionKind,
    pub confidence: f32,
    pub timestamp_ms: u64,
}

impl RawDetection {
    pub fn key(&self) -> ContentKey {
        ContentKey::of(&self.content)
    }
}

/// Stable hash of normalized content. Identical content collides regardless of kind.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ContentKey(String);

impl ContentKey {
    pub fn of(content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"guard:content:v1");
        hasher.update(content.as_bytes());
        let digest = hasher.finalize();
        ContentKey(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one detection instance. A new instance after expiry gets a new id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn derive(key: &ContentKey, first_seen_ms: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"guard:event:v1");
        hasher.update(key.as_str().as_bytes());
        hasher.update(first_seen_ms.to_le_bytes());
        let digest = hasher.finalize();
        EventId(hex::encode(&digest[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A debounced occurrence of recognized content.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DetectionEvent {
    pub id: EventId,
    pub key: ContentKey,
    pub kind: DetectionKind,
    pub content: String,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub occurrence_count: u64,
    /// 0 for the first emission, incremented on each re-alert.
    pub alert_round: u32,
}

impl DetectionEvent {
    /// Ledger key. Every round of one event shares the same record.
    pub fn alert_id(&self) -> String {
        self.id.to_string()
    }
}

// -------------------- Locations --------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FixSource {
    Satellite,
    Network,
    Ip,
    LastKnown,
}

impl FixSource {
    pub fn as_str(self) -> &'static str {
        match self {
            FixSource::Satellite => "satellite",
            FixSource::Network => "network",
            FixSource::Ip => "ip",
            FixSource::LastKnown => "last_known",
        }
    }
}

impl fmt::Display for FixSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GeoFix {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f64,
    pub source: FixSource,
    pub resolved_at_ms: u64,
    /// Human-readable place, when the source knows one (e.g. "Hanoi, VN").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
}

impl GeoFix {
    pub fn new(latitude: f64, longitude: f64, accuracy_m: f64, source: FixSource) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_m,
            source,
            resolved_at_ms: now_ms(),
            locality: None,
        }
    }

    pub fn with_locality(mut self, locality: impl Into<String>) -> Self {
        self.locality = Some(locality.into());
        self
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.resolved_at_ms)
    }
}

/// Data handed to the external map widget. The core renders nothing itself.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MapPin {
    pub latitude: f64,
    pub longitude: f64,
    pub label: String,
}

impl MapPin {
    pub fn from_fix(fix: &GeoFix, label: impl Into<String>) -> Self {
        Self {
            latitude: fix.latitude,
            longitude: fix.longitude,
            label: label.into(),
        }
    }
}
