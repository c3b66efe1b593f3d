pub mod scripted;
pub mod stub;

pub use scripted::ScriptedRecognizer;
pub use stub::StubRecognizer;
