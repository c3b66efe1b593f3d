use serde::Deserialize;

use crate::DetectionKind;

/// Output of an external recognizer for one item in one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct RecognizedItem {
    /// Recognized text, or decoded barcode payload.
    pub text: String,
    pub kind: DetectionKind,
    pub confidence: f32,
    pub region: Option<Region>,
}

impl RecognizedItem {
    pub fn text(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            kind: DetectionKind::Text,
            confidence,
            region: None,
        }
    }

    pub fn barcode(code: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: code.into(),
            kind: DetectionKind::Barcode,
            confidence,
            region: None,
        }
    }

}

/// Bounding region, normalized 0..1 coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct Region {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}
