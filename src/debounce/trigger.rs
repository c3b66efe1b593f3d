use crate::{DetectionEvent, DetectionKind};

/// Decides which emitted events become alerts.
///
/// An event qualifies when its kind is allowed and, if a watchlist is configured, its
/// content contains at least one watchlist term (case-insensitive).
#[derive(Clone, Debug)]
pub struct AlertTrigger {
    kinds: Vec<DetectionKind>,
    watchlist: Vec<String>,
}

impl AlertTrigger {
    pub fn new(kinds: Vec<DetectionKind>, watchlist: Vec<String>) -> Self {
        let watchlist = watchlist
            .into_iter()
            .map(|term| term.trim().to_lowercase())
            .filter(|term| !term.is_empty())
            .collect();
        Self { kinds, watchlist }
    }

    /// Every kind, no watchlist.
    pub fn any() -> Self {
        Self::new(vec![DetectionKind::Text, DetectionKind::Barcode], Vec::new())
    }

    pub fn qualifies(&self, event: &DetectionEvent) -> bool {
        if !self.kinds.contains(&event.kind) {
            return false;
        }
        self.matched_term(&event.content).is_some() || self.watchlist.is_empty()
    }

    /// First watchlist term found in `content`.
    pub fn matched_term(&self, content: &str) -> Option<&str> {
        let haystack = content.to_lowercase();
        self.watchlist
            .iter()
            .find(|term| haystack.contains(term.as_str()))
            .map(String::as_str)
    }

    pub fn kinds(&self) -> &[DetectionKind] {
        &self.kinds
    }

    pub fn watchlist(&self) -> &[String] {
        &self.watchlist
    }
}

impl Default for AlertTrigger {
    fn default() -> Self {
        Self::any()
    }
}
