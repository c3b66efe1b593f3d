use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::Path;

use crate::recognize::backend::{RecognitionCapability, Recognizer};
use crate::recognize::result::{RecognizedItem, Region};
use crate::DetectionKind;

/// One scripted recognition pass: either the items "seen" in a frame or a failure.
#[derive(Clone, Debug, Deserialize)]
pub struct ScriptStep {
    #[serde(default)]
    pub items: Vec<ScriptItem>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ScriptItem {
    pub text: String,
    #[serde(default = "default_kind")]
    pub kind: DetectionKind,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default)]
    pub region: Option<Region>,
}

fn default_kind() -> DetectionKind {
    DetectionKind::Text
}

fn default_confidence() -> f32 {
    1.0
}

/// Replays a fixed sequence of recognition results, one step per frame.
///
/// Used by the daemon's replay mode (JSON-lines script) and by tests. Frames beyond
/// the end of the script recognize nothing, unless the script loops.
pub struct ScriptedRecognizer {
    steps: VecDeque<ScriptStep>,
    original: Vec<ScriptStep>,
    looping: bool,
}

impl ScriptedRecognizer {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: steps.iter().cloned().collect(),
            original: steps,
            looping: false,
        }
    }

    /// Build from per-frame item lists.
    pub fn from_frames(frames: Vec<Vec<RecognizedItem>>) -> Self {
        let steps = frames
            .into_iter()
            .map(|items| ScriptStep {
                items: items
                    .into_iter()
                    .map(|item| ScriptItem {
                        text: item.text,
                        kind: item.kind,
                        confidence: item.confidence,
                        region: item.region,
                    })
                    .collect(),
                error: None,
            })
            .collect();
        Self::new(steps)
    }

    /// Load a JSON-lines script. Blank lines and lines starting with `#` are skipped.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read recognition script {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid recognition script {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut steps = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let step: ScriptStep = serde_json::from_str(line)
                .map_err(|e| anyhow!("line {}: {}", idx + 1, e))?;
            steps.push(step);
        }
        Ok(Self::new(steps))
    }

    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn remaining(&self) -> usize {
        self.steps.len()
    }
}

impl Recognizer for ScriptedRecognizer {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn supports(&self, capability: RecognitionCapability) -> bool {
        matches!(
            capability,
            RecognitionCapability::TextRecognition | RecognitionCapability::BarcodeScanning
        )
    }

    fn recognize(
        &mut self,
        _pixels: &[u8],
        _width: u32,
        _height: u32,
    ) -> Result<Vec<RecognizedItem>> {
        if self.steps.is_empty() && self.looping {
            self.steps = self.original.iter().cloned().collect();
        }
        let Some(step) = self.steps.pop_front() else {
            return Ok(Vec::new());
        };
        if let Some(error) = step.error {
            return Err(anyhow!(error));
        }
        Ok(step
            .items
            .into_iter()
            .map(|item| RecognizedItem {
                text: item.text,
                kind: item.kind,
                confidence: item.confidence,
                region: item.region,
            })
            .collect())
    }
}
