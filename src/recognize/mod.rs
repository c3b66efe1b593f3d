//! Recognition: backends behind a uniform trait, and the adapter that turns a frame
//! into a set of `RawDetection`s.

mod adapter;
mod backend;
pub mod backends;
mod registry;
mod result;

pub use adapter::{
    normalize_content, AdapterConfig, RecognitionAdapter, DEFAULT_MAX_TEXT_LEN,
    DEFAULT_MIN_CONFIDENCE, DEFAULT_MIN_TEXT_LEN,
};
pub use backend::{RecognitionCapability, Recognizer};
pub use backends::{ScriptedRecognizer, StubRecognizer};
pub use registry::RecognizerRegistry;
pub use result::{RecognizedItem, Region};
