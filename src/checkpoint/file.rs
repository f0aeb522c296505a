use super::{
    CHECKPOINT_FORMAT_VERSION, CheckpointRecord, CheckpointStore, decode_unit_key,
    encode_unit_key, record_not_found, snapshot_not_found,
};
use crate::core::{MigrateError, Payload, Result};
use crate::engine::policy::CheckpointDurability;
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{Level, event};
use uuid::Uuid;

const ACTIVE_DIR: &str = "active";
const ARCHIVE_DIR: &str = "archive";
const RECORD_EXTENSION: &str = "json";

/// Checkpoint store backed by one JSON file per unit.
///
/// ```text
/// <root>/active/<unit-key>.json
/// <root>/archive/<unit-key>.<utc-timestamp>.<uuid>.json
/// ```
///
/// Every write goes to a sibling temp file that is renamed over the record,
/// so a reader sees either the previous record or the new one. Units never
/// share a file, which keeps concurrent workers for different units apart.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root_dir: PathBuf,
    durability: CheckpointDurability,
}

impl FileCheckpointStore {
    pub async fn open(root_dir: impl AsRef<Path>, durability: CheckpointDurability) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        for dir in [root_dir.join(ACTIVE_DIR), root_dir.join(ARCHIVE_DIR)] {
            fs::create_dir_all(&dir).await.map_err(|err| {
                MigrateError::Persistence(format!(
                    "Failed to create checkpoint directory '{}': {}",
                    dir.display(),
                    err
                ))
            })?;
        }
        Ok(Self {
            root_dir,
            durability,
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn active_dir(&self) -> PathBuf {
        self.root_dir.join(ACTIVE_DIR)
    }

    fn archive_dir(&self) -> PathBuf {
        self.root_dir.join(ARCHIVE_DIR)
    }

    fn record_path(&self, unit_id: &str) -> PathBuf {
        self.active_dir()
            .join(format!("{}.{}", encode_unit_key(unit_id), RECORD_EXTENSION))
    }

    /// Paths of archived records for `unit_id`, oldest first.
    pub async fn archived_records(&self, unit_id: &str) -> Result<Vec<PathBuf>> {
        let prefix = format!("{}.", encode_unit_key(unit_id));
        let mut entries = fs::read_dir(self.archive_dir())
            .await
            .map_err(|err| MigrateError::Persistence(err.to_string()))?;
        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| MigrateError::Persistence(err.to_string()))?
        {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&prefix) {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    async fn read_record(&self, unit_id: &str) -> Result<Option<CheckpointRecord>> {
        let path = self.record_path(unit_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(MigrateError::Persistence(format!(
                    "Failed to read checkpoint '{}': {}",
                    path.display(),
                    err
                )));
            }
        };

        let record = serde_json::from_slice::<CheckpointRecord>(&bytes).map_err(|err| {
            MigrateError::Persistence(format!("parse checkpoint '{}': {}", path.display(), err))
        })?;
        if record.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(MigrateError::Persistence(format!(
                "Unsupported checkpoint format version {} in '{}'",
                record.format_version,
                path.display()
            )));
        }
        if record.unit_id != unit_id {
            return Err(MigrateError::Persistence(format!(
                "Checkpoint '{}' belongs to unit '{}', expected '{}'",
                path.display(),
                record.unit_id,
                unit_id
            )));
        }
        Ok(Some(record))
    }

    /// Writes the record to a temp file and atomically renames it into place.
    async fn write_record(&self, record: &CheckpointRecord) -> Result<()> {
        let path = self.record_path(&record.unit_id);
        let tmp_path = path.with_extension("tmp");

        let json = serde_json::to_vec_pretty(record)
            .map_err(|err| MigrateError::Persistence(format!("serialize checkpoint: {}", err)))?;

        let mut file = fs::File::create(&tmp_path).await.map_err(|err| {
            MigrateError::Persistence(format!(
                "Failed to create temp file '{}': {}",
                tmp_path.display(),
                err
            ))
        })?;
        file.write_all(&json)
            .await
            .map_err(|err| MigrateError::Persistence(err.to_string()))?;
        file.flush()
            .await
            .map_err(|err| MigrateError::Persistence(err.to_string()))?;
        if self.durability == CheckpointDurability::Strict {
            file.sync_all()
                .await
                .map_err(|err| MigrateError::Persistence(err.to_string()))?;
        }
        drop(file);

        fs::rename(&tmp_path, &path).await.map_err(|err| {
            MigrateError::Persistence(format!(
                "Failed to rename temp file '{}' -> '{}': {}",
                tmp_path.display(),
                path.display(),
                err
            ))
        })?;

        if self.durability == CheckpointDurability::Strict {
            self.sync_dir(&self.active_dir()).await?;
        }
        Ok(())
    }

    #[cfg(unix)]
    async fn sync_dir(&self, dir: &Path) -> Result<()> {
        let handle = fs::File::open(dir)
            .await
            .map_err(|err| MigrateError::Persistence(err.to_string()))?;
        handle
            .sync_all()
            .await
            .map_err(|err| MigrateError::Persistence(err.to_string()))
    }

    #[cfg(not(unix))]
    async fn sync_dir(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get_last_completed(&self, unit_id: &str) -> Result<u32> {
        Ok(self
            .read_record(unit_id)
            .await?
            .map(|record| record.last_completed)
            .unwrap_or(0))
    }

    async fn record_completed(&self, unit_id: &str, ordinal: u32) -> Result<()> {
        let mut record = self
            .read_record(unit_id)
            .await?
            .unwrap_or_else(|| CheckpointRecord::new(unit_id));
        if !record.advance_to(ordinal) {
            return Ok(());
        }
        self.write_record(&record).await?;
        event!(Level::DEBUG, unit = %unit_id, ordinal, "checkpoint recorded");
        Ok(())
    }

    async fn save_snapshot(&self, unit_id: &str, key: &str, payload: &Payload) -> Result<()> {
        let mut record = self
            .read_record(unit_id)
            .await?
            .unwrap_or_else(|| CheckpointRecord::new(unit_id));
        record.put_snapshot(key, payload.clone());
        self.write_record(&record).await
    }

    async fn load_snapshot(&self, unit_id: &str, key: &str) -> Result<Payload> {
        self.read_record(unit_id)
            .await?
            .and_then(|mut record| record.snapshots.remove(key))
            .ok_or_else(|| snapshot_not_found(unit_id, key))
    }

    async fn archive(&self, unit_id: &str) -> Result<()> {
        let path = self.record_path(unit_id);
        match fs::metadata(&path).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(record_not_found(unit_id));
            }
            Err(err) => {
                return Err(MigrateError::Persistence(format!(
                    "Failed to inspect checkpoint '{}': {}",
                    path.display(),
                    err
                )));
            }
        }

        // The random suffix keeps two archives of one unit within the same
        // microsecond from replacing each other.
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
        let archived = self.archive_dir().join(format!(
            "{}.{}.{}.{}",
            encode_unit_key(unit_id),
            stamp,
            Uuid::new_v4().simple(),
            RECORD_EXTENSION
        ));
        fs::rename(&path, &archived).await.map_err(|err| {
            MigrateError::Persistence(format!(
                "Failed to archive checkpoint '{}' -> '{}': {}",
                path.display(),
                archived.display(),
                err
            ))
        })?;
        if self.durability == CheckpointDurability::Strict {
            self.sync_dir(&self.archive_dir()).await?;
            self.sync_dir(&self.active_dir()).await?;
        }
        event!(
            Level::INFO,
            unit = %unit_id,
            path = %archived.display(),
            "checkpoint archived"
        );
        Ok(())
    }

    async fn load_record(&self, unit_id: &str) -> Result<Option<CheckpointRecord>> {
        self.read_record(unit_id).await
    }

    async fn list_active(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(self.active_dir())
            .await
            .map_err(|err| MigrateError::Persistence(err.to_string()))?;
        let mut units = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| MigrateError::Persistence(err.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match decode_unit_key(stem) {
                Some(unit_id) => units.push(unit_id),
                None => event!(
                    Level::WARN,
                    path = %path.display(),
                    "skipping checkpoint file with undecodable name"
                ),
            }
        }
        units.sort();
        Ok(units)
    }
}
