//! Durable per-unit progress records.
//!
//! A checkpoint holds the highest step ordinal a unit has completed plus any
//! configuration snapshots captured along the way. The store is the only
//! component that mutates persisted records; everything else goes through the
//! [`CheckpointStore`] trait.

mod file;
mod memory;

pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;

use crate::core::{MigrateError, Payload, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CHECKPOINT_FORMAT_VERSION: u16 = 1;

/// Persisted progress for one migration unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub format_version: u16,
    pub unit_id: String,
    pub last_completed: u32,
    #[serde(default)]
    pub snapshots: BTreeMap<String, Payload>,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn new(unit_id: impl Into<String>) -> Self {
        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            unit_id: unit_id.into(),
            last_completed: 0,
            snapshots: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Advances the cursor. Returns false if `ordinal` would move it backwards
    /// or leave it unchanged.
    fn advance_to(&mut self, ordinal: u32) -> bool {
        if ordinal <= self.last_completed {
            return false;
        }
        self.last_completed = ordinal;
        self.updated_at = Utc::now();
        true
    }

    fn put_snapshot(&mut self, key: &str, payload: Payload) {
        self.snapshots.insert(key.to_string(), payload);
        self.updated_at = Utc::now();
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Highest completed ordinal, or 0 when the unit has no checkpoint.
    async fn get_last_completed(&self, unit_id: &str) -> Result<u32>;

    /// Durably records `ordinal` as completed.
    ///
    /// Ordinals at or below the current value leave the record untouched.
    async fn record_completed(&self, unit_id: &str, ordinal: u32) -> Result<()>;

    async fn save_snapshot(&self, unit_id: &str, key: &str, payload: &Payload) -> Result<()>;

    /// Fails with [`MigrateError::NotFound`] when no snapshot exists under `key`.
    async fn load_snapshot(&self, unit_id: &str, key: &str) -> Result<Payload>;

    /// Moves the unit's record out of the active namespace without deleting it.
    async fn archive(&self, unit_id: &str) -> Result<()>;

    async fn load_record(&self, unit_id: &str) -> Result<Option<CheckpointRecord>>;

    /// Unit ids that currently have an active record.
    async fn list_active(&self) -> Result<Vec<String>>;
}

fn snapshot_not_found(unit_id: &str, key: &str) -> MigrateError {
    MigrateError::NotFound(format!("snapshot '{}' for unit '{}'", key, unit_id))
}

fn record_not_found(unit_id: &str) -> MigrateError {
    MigrateError::NotFound(format!("active checkpoint for unit '{}'", unit_id))
}

/// Escapes a unit id into a name that is safe as a single path component.
///
/// ASCII alphanumerics, `-` and `_` pass through; every other byte becomes `%XX`.
/// `.` is escaped too so that ids like `..` never alias directory entries.
pub fn encode_unit_key(unit_id: &str) -> String {
    let mut out = String::with_capacity(unit_id.len());
    for byte in unit_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Reverses [`encode_unit_key`]. Returns `None` for malformed input.
pub fn decode_unit_key(key: &str) -> Option<String> {
    let bytes = key.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = key.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
