use anyhow::Result;

use crate::recognize::backend::{RecognitionCapability, Recognizer};
use crate::recognize::result::RecognizedItem;

/// Stub backend. Recognizes nothing; useful when no on-device recognizer is wired.
#[derive(Default)]
pub struct StubRecognizer;

impl StubRecognizer {
    pub fn new() -> Self {
        Self
    }
}

impl Recognizer for StubRecognizer {
    fn name(&self) -> &'static str {
        "stub"
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
        Ok(Vec::new())
    }
}
