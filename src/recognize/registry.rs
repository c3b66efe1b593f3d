use std::sync::Mutex;

use super::backend::{RecognitionCapability, Recognizer};

/// A backend plus the capabilities it reported when registered.
struct Registered {
    name: &'static str,
    capabilities: Vec<RecognitionCapability>,
    backend: Mutex<Box<dyn Recognizer>>,
}

/// Recognizer backends in registration order.
///
/// Each capability is served by the first registered backend that supports it, so a
/// backend reading both text and barcodes runs once per frame. Capabilities are read
/// once at registration; frames never lock a backend just to ask what it supports.
pub struct RecognizerRegistry {
    entries: Vec<Registered>,
}

impl RecognizerRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add a backend. Registering a name again replaces the earlier backend in place.
    pub fn register<R: Recognizer + 'static>(&mut self, backend: R) {
        let name = backend.name();
        let capabilities: Vec<RecognitionCapability> = RecognitionCapability::ALL
            .into_iter()
            .filter(|c| backend.supports(*c))
            .collect();
        if capabilities.is_empty() {
            log::warn!("recognizer {} supports no capability; not registered", name);
            return;
        }
        log::debug!("recognizer {} registered for {:?}", name, capabilities);

        let entry = Registered {
            name,
            capabilities,
            backend: Mutex::new(Box::new(backend)),
        };
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(slot) => *slot = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position_serving(&self, capability: RecognitionCapability) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.capabilities.contains(&capability))
    }

    /// Name of the backend serving `capability`, if any.
    pub fn serving(&self, capability: RecognitionCapability) -> Option<&'static str> {
        self.position_serving(capability)
            .map(|idx| self.entries[idx].name)
    }

    /// Backends to run on one frame: the server of each capability, each at most once,
    /// in capability order.
    pub(super) fn frame_backends(&self) -> Vec<&Mutex<Box<dyn Recognizer>>> {
        let mut picked: Vec<usize> = Vec::new();
        for capability in RecognitionCapability::ALL {
            if let Some(idx) = self.position_serving(capability) {
                if !picked.contains(&idx) {
                    picked.push(idx);
                }
            }
        }
        picked
            .into_iter()
            .map(|idx| &self.entries[idx].backend)
            .collect()
    }
}

impl Default for RecognizerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
