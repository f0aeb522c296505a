//! Two-stage bucket relocation built on the migration engine.
//!
//! `prepare` can run while the source bucket is still taking writes: it backs
//! up the bucket configuration, creates a temporary bucket and copies
//! everything into it. `finalize` is the cut-over: it catches up on late
//! writes, verifies the copy, deletes and recreates the source with the new
//! target configuration, copies the data back, restores the configuration and
//! removes the temporary bucket.

mod steps;

use crate::core::{MigrateError, Result};
use crate::engine::MigrationPlan;
use crate::interface::ConfigAspect;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use steps::{
    BackupMetadata, CopyBack, CopyToTemp, CreateTempBucket, DeleteSource, DeleteTemp,
    RecreateSource, RestoreMetadata, VerifyTempCopy,
};

pub const PREPARE_STAGE: &str = "prepare";
pub const FINALIZE_STAGE: &str = "finalize";

/// Longest bucket name the storage service accepts.
pub const MAX_BUCKET_NAME_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelocationOptions {
    /// Appended to the source name to form the temporary bucket name.
    pub temp_suffix: String,
    /// Configuration carried over from the old bucket to the new one.
    pub aspects: Vec<ConfigAspect>,
    pub max_bucket_name_len: usize,
}

impl Default for RelocationOptions {
    fn default() -> Self {
        Self {
            temp_suffix: "-relocate".to_string(),
            aspects: ConfigAspect::ALL.to_vec(),
            max_bucket_name_len: MAX_BUCKET_NAME_LEN,
        }
    }
}

impl RelocationOptions {
    pub fn temp_bucket_name(&self, bucket: &str) -> Result<String> {
        let name = format!("{}{}", bucket, self.temp_suffix);
        if name.len() > self.max_bucket_name_len {
            return Err(MigrateError::Configuration(format!(
                "temporary bucket name '{}' is {} characters long, limit is {}",
                name,
                name.len(),
                self.max_bucket_name_len
            )));
        }
        Ok(name)
    }

    fn validate(&self) -> Result<()> {
        if self.temp_suffix.is_empty() {
            return Err(MigrateError::Configuration(
                "temp_suffix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builds the relocation workflow as a [`MigrationPlan`].
pub struct RelocationPlan;

impl RelocationPlan {
    pub fn build(options: RelocationOptions) -> Result<MigrationPlan> {
        options.validate()?;
        let options = Arc::new(options);

        let versioning = options
            .aspects
            .iter()
            .copied()
            .filter(|aspect| *aspect == ConfigAspect::Versioning)
            .collect::<Vec<_>>();
        let remaining = options
            .aspects
            .iter()
            .copied()
            .filter(|aspect| *aspect != ConfigAspect::Versioning)
            .collect::<Vec<_>>();

        MigrationPlan::builder()
            .stage(PREPARE_STAGE)
            .step(
                "backup_metadata",
                BackupMetadata {
                    options: options.clone(),
                },
            )
            .step(
                "create_temp_bucket",
                CreateTempBucket {
                    options: options.clone(),
                },
            )
            .step(
                "copy_to_temp",
                CopyToTemp {
                    options: options.clone(),
                    catch_up: false,
                },
            )
            .stage(FINALIZE_STAGE)
            .step(
                "sync_to_temp",
                CopyToTemp {
                    options: options.clone(),
                    catch_up: true,
                },
            )
            .step(
                "verify_temp_copy",
                VerifyTempCopy {
                    options: options.clone(),
                },
            )
            .step("delete_source", DeleteSource)
            .step("recreate_source", RecreateSource)
            .step(
                "restore_versioning",
                RestoreMetadata {
                    aspects: versioning,
                },
            )
            .step(
                "copy_back",
                CopyBack {
                    options: options.clone(),
                },
            )
            .step("restore_metadata", RestoreMetadata { aspects: remaining })
            .step("delete_temp", DeleteTemp { options })
            .build()
    }
}
