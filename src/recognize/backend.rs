use anyhow::Result;

use super::result::RecognizedItem;

/// Recognition capabilities a backend may offer.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecognitionCapability {
    TextRecognition,
    BarcodeScanning,
}

impl RecognitionCapability {
    pub const ALL: [RecognitionCapability; 2] = [
        RecognitionCapability::TextRecognition,
        RecognitionCapability::BarcodeScanning,
    ];
}

/// Recognizer backend trait.
///
/// Wraps an on-device text or barcode recognizer. The call is synchronous and runs on
/// the recognition lane; implementations that are callback-driven underneath must
/// block until their result is ready.
///
/// Implementations must treat the pixel slice as read-only and ephemeral.
pub trait Recognizer: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Returns true when the backend supports a capability.
    fn supports(&self, capability: RecognitionCapability) -> bool;

    /// Run recognition on a frame.
    fn recognize(&mut self, pixels: &[u8], width: u32, height: u32)
        -> Result<Vec<RecognizedItem>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
