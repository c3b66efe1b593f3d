use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{PoisonError, RwLock};

use crate::error::PipelineResult;

use super::{sort_oldest_first, AlertLedger, AlertRecord, AlertStatus};

const SHARDS: usize = 16;

/// Process-local ledger. Records are spread over independently locked shards.
pub struct InMemoryAlertLedger {
    shards: Vec<RwLock<HashMap<String, AlertRecord>>>,
}

impl InMemoryAlertLedger {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, alert_id: &str) -> &RwLock<HashMap<String, AlertRecord>> {
        let mut hasher = DefaultHasher::new();
        alert_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    fn collect(&self, keep: impl Fn(&AlertRecord) -> bool) -> Vec<AlertRecord> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let map = shard.read().unwrap_or_else(PoisonError::into_inner);
            out.extend(map.values().filter(|r| keep(r)).cloned());
        }
        sort_oldest_first(&mut out);
        out
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryAlertLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertLedger for InMemoryAlertLedger {
    fn upsert(&self, record: &AlertRecord) -> PipelineResult<()> {
        let mut map = self
            .shard(&record.alert_id)
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        map.insert(record.alert_id.clone(), record.clone());
        Ok(())
    }

    fn get(&self, alert_id: &str) -> PipelineResult<Option<AlertRecord>> {
        let map = self
            .shard(alert_id)
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(alert_id).cloned())
    }

    fn list_by_status(&self, status: AlertStatus) -> PipelineResult<Vec<AlertRecord>> {
        Ok(self.collect(|r| r.status == status))
    }

    fn list_since(&self, since_ms: u64) -> PipelineResult<Vec<AlertRecord>> {
        Ok(self.collect(|r| r.created_at_ms >= since_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::tests::exercise_ledger;

    #[test]
    fn in_memory_ledger_behaves() {
        let ledger = InMemoryAlertLedger::new();
        exercise_ledger(&ledger);
        assert_eq!(ledger.len(), 3);
    }
}
