use super::{CheckpointRecord, CheckpointStore, record_not_found, snapshot_not_found};
use crate::core::{Payload, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Map-backed checkpoint store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    active: Mutex<HashMap<String, CheckpointRecord>>,
    archived: Mutex<Vec<CheckpointRecord>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn archived(&self) -> Result<Vec<CheckpointRecord>> {
        Ok(self.archived.lock()?.clone())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get_last_completed(&self, unit_id: &str) -> Result<u32> {
        let active = self.active.lock()?;
        Ok(active
            .get(unit_id)
            .map(|record| record.last_completed)
            .unwrap_or(0))
    }

    async fn record_completed(&self, unit_id: &str, ordinal: u32) -> Result<()> {
        let mut active = self.active.lock()?;
        active
            .entry(unit_id.to_string())
            .or_insert_with(|| CheckpointRecord::new(unit_id))
            .advance_to(ordinal);
        Ok(())
    }

    async fn save_snapshot(&self, unit_id: &str, key: &str, payload: &Payload) -> Result<()> {
        let mut active = self.active.lock()?;
        active
            .entry(unit_id.to_string())
            .or_insert_with(|| CheckpointRecord::new(unit_id))
            .put_snapshot(key, payload.clone());
        Ok(())
    }

    async fn load_snapshot(&self, unit_id: &str, key: &str) -> Result<Payload> {
        let active = self.active.lock()?;
        active
            .get(unit_id)
            .and_then(|record| record.snapshots.get(key))
            .cloned()
            .ok_or_else(|| snapshot_not_found(unit_id, key))
    }

    async fn archive(&self, unit_id: &str) -> Result<()> {
        let record = self
            .active
            .lock()?
            .remove(unit_id)
            .ok_or_else(|| record_not_found(unit_id))?;
        self.archived.lock()?.push(record);
        Ok(())
    }

    async fn load_record(&self, unit_id: &str) -> Result<Option<CheckpointRecord>> {
        Ok(self.active.lock()?.get(unit_id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<String>> {
        let mut units = self.active.lock()?.keys().cloned().collect::<Vec<_>>();
        units.sort();
        Ok(units)
    }
}
