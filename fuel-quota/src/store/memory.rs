use async_trait::async_trait;
use fuel_plans::ResourceKey;
use parking_lot::Mutex;
use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::keys::{MonthBucket, StationId};
use crate::store::{UsageKey, UsageStore};

/// Process-local counter store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<UsageKey, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn increment(&self, key: &UsageKey) -> Result<u64, StoreError> {
        let mut records = self.records.lock();
        let count = records.entry(key.clone()).or_insert(0);
        *count = count
            .checked_add(1)
            .ok_or_else(|| StoreError::Corrupt(format!("counter overflow for {key:?}")))?;
        Ok(*count)
    }

    async fn count(&self, key: &UsageKey) -> Result<u64, StoreError> {
        Ok(self.records.lock().get(key).copied().unwrap_or(0))
    }

    async fn history(&self, station: StationId, resource: &ResourceKey) -> Result<Vec<(MonthBucket, u64)>, StoreError> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|(key, _)| key.station == station && &key.resource == resource)
            .map(|(key, count)| (key.month, *count))
            .collect())
    }

    async fn prune_before(&self, month: MonthBucket) -> Result<u64, StoreError> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|key, _| key.month >= month);
        Ok((before - records.len()) as u64)
    }
}
