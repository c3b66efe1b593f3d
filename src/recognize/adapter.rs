use std::collections::HashMap;

use crate::error::PipelineError;
use crate::frame::Frame;
use crate::{ContentKey, DetectionKind, RawDetection};

use super::backend::RecognitionCapability;
use super::registry::RecognizerRegistry;
use super::result::RecognizedItem;

pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.4;
pub const DEFAULT_MIN_TEXT_LEN: usize = 1;
pub const DEFAULT_MAX_TEXT_LEN: usize = 600;

#[derive(Clone, Debug)]
pub struct AdapterConfig {
    /// Items below this confidence are dropped.
    pub min_confidence: f32,
    /// Text items shorter than this (in chars, after normalization) are dropped.
    pub min_text_len: usize,
    /// Text items longer than this are truncated.
    pub max_text_len: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            min_text_len: DEFAULT_MIN_TEXT_LEN,
            max_text_len: DEFAULT_MAX_TEXT_LEN,
        }
    }
}

/// Uniform `analyze(frame) -> set of RawDetection` over the registered recognizers.
///
/// Never fails. Unreadable frames and recognizer errors produce no detections.
pub struct RecognitionAdapter {
    registry: RecognizerRegistry,
    config: AdapterConfig,
}

impl RecognitionAdapter {
    pub fn new(registry: RecognizerRegistry, config: AdapterConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Warm up the backends frames will run on. Failures are logged, not fatal.
    pub fn warm_up(&self) {
        for capability in RecognitionCapability::ALL {
            match self.registry.serving(capability) {
                Some(name) => log::info!("{:?} served by {}", capability, name),
                None => log::warn!("no recognizer registered for {:?}", capability),
            }
        }
        for backend in self.registry.frame_backends() {
            let Ok(mut guard) = backend.lock() else {
                log::warn!("recognizer lock poisoned during warm-up");
                continue;
            };
            if let Err(e) = guard.warm_up() {
                log::warn!("recognizer {} warm-up failed: {}", guard.name(), e);
            }
        }
    }

    pub fn analyze(&self, frame: &Frame) -> Vec<RawDetection> {
        if !frame.is_readable() {
            log::debug!(
                "skipping unreadable frame seq={} ({}x{})",
                frame.seq,
                frame.width,
                frame.height
            );
            return Vec::new();
        }

        let mut items = Vec::new();
        for backend in self.registry.frame_backends() {
            let mut guard = match backend.lock() {
                Ok(guard) => guard,
                Err(_) => {
                    log::warn!("recognizer lock poisoned; skipping frame seq={}", frame.seq);
                    continue;
                }
            };
            match frame.run_recognizer(&mut **guard) {
                Ok(found) => items.extend(found),
                Err(e) => {
                    let failure = PipelineError::RecognitionFailure {
                        frame_seq: frame.seq,
                        reason: format!("{}: {:#}", guard.name(), e),
                    };
                    log::warn!("{}", failure);
                }
            }
        }

        self.collapse(items, frame.captured_at_ms)
    }

    /// Normalize, filter, and merge items that collide on content.
    pub fn collapse(&self, items: Vec<RecognizedItem>, timestamp_ms: u64) -> Vec<RawDetection> {
        let mut out: Vec<RawDetection> = Vec::new();
        let mut index: HashMap<ContentKey, usize> = HashMap::new();

        for item in items {
            if !item.confidence.is_finite() || item.confidence < self.config.min_confidence {
                continue;
            }
            let Some(content) = self.normalize(&item.text, item.kind) else {
                continue;
            };
            let key = ContentKey::of(&content);
            match index.get(&key) {
                Some(&pos) => {
                    let existing = &mut out[pos];
                    if item.kind.precedence() > existing.kind.precedence() {
                        existing.kind = item.kind;
                    }
                    existing.confidence = existing.confidence.max(item.confidence);
                }
                None => {
                    index.insert(key, out.len());
                    out.push(RawDetection {
                        content,
                        kind: item.kind,
                        confidence: item.confidence,
                        timestamp_ms,
                    });
                }
            }
        }
        out
    }

    fn normalize(&self, raw: &str, kind: DetectionKind) -> Option<String> {
        let content = match kind {
            DetectionKind::Barcode => raw.trim().to_string(),
            DetectionKind::Text => {
                let collapsed = normalize_content(raw);
                if collapsed.chars().count() < self.config.min_text_len {
                    return None;
                }
                truncate_chars(&collapsed, self.config.max_text_len)
            }
        };
        if content.is_empty() {
            None
        } else {
            Some(content)
        }
    }
}

/// Trim and collapse runs of whitespace (including line breaks) to single spaces.
pub fn normalize_content(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(value: &str, max: usize) -> String {
    if max == 0 || value.chars().count() <= max {
        return value.to_string();
    }
    let mut out: String = value.chars().take(max).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognize::{RecognitionCapability, Recognizer, ScriptedRecognizer};
    use anyhow::{anyhow, Result};

    fn adapter_with(frames: Vec<Vec<RecognizedItem>>) -> RecognitionAdapter {
        let mut registry = RecognizerRegistry::new();
        registry.register(ScriptedRecognizer::from_frames(frames));
        RecognitionAdapter::new(registry, AdapterConfig::default())
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(vec![0u8; 4], 2, 2, seq, 1_000 + seq)
    }

    #[test]
    fn barcode_wins_collision_in_same_frame() {
        let adapter = adapter_with(vec![vec![
            RecognizedItem::text("ABC123", 0.6),
            RecognizedItem::barcode("ABC123", 0.9),
        ]]);
        let out = adapter.analyze(&frame(1));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, DetectionKind::Barcode);
        assert_eq!(out[0].confidence, 0.9);
        assert_eq!(out[0].timestamp_ms, 1_001);
    }

    #[test]
    fn drops_low_confidence_and_empty_items() {
        let adapter = adapter_with(vec![vec![
            RecognizedItem::text("faint", 0.1),
            RecognizedItem::text("   ", 0.9),
            RecognizedItem::text("STOP", f32::NAN),
            RecognizedItem::text("  Wet\n floor ", 0.8),
        ]]);
        let out = adapter.analyze(&frame(1));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content, "Wet floor");
    }

    #[test]
    fn truncates_long_text() {
        let mut registry = RecognizerRegistry::new();
        registry.register(ScriptedRecognizer::from_frames(vec![vec![RecognizedItem::text(
            "x".repeat(20),
            1.0,
        )]]));
        let adapter = RecognitionAdapter::new(
            registry,
            AdapterConfig {
                max_text_len: 5,
                ..AdapterConfig::default()
            },
        );
        let out = adapter.analyze(&frame(1));
        assert_eq!(out[0].content, "xxxxx...");
    }

    #[test]
    fn unreadable_frame_yields_nothing() {
        let adapter = adapter_with(vec![vec![RecognizedItem::text("exit", 1.0)]]);
        let broken = Frame::new(Vec::new(), 0, 0, 9, 0);
        assert!(adapter.analyze(&broken).is_empty());
    }

    struct FailingRecognizer;

    impl Recognizer for FailingRecognizer {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn supports(&self, _capability: RecognitionCapability) -> bool {
            true
        }

        fn recognize(&mut self, _: &[u8], _: u32, _: u32) -> Result<Vec<RecognizedItem>> {
            Err(anyhow!("model crashed"))
        }
    }

    #[test]
    fn recognizer_failure_yields_nothing() {
        let mut registry = RecognizerRegistry::new();
        registry.register(FailingRecognizer);
        let adapter = RecognitionAdapter::new(registry, AdapterConfig::default());
        assert!(adapter.analyze(&frame(1)).is_empty());
    }

    #[test]
    fn empty_registry_yields_nothing() {
        let adapter = RecognitionAdapter::new(RecognizerRegistry::new(), AdapterConfig::default());
        assert!(adapter.analyze(&frame(1)).is_empty());
    }
}
