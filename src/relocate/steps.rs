use super::RelocationOptions;
use crate::core::{MigrateError, Payload, Result, StorageError};
use crate::engine::{StepAction, StepContext};
use crate::interface::{ConfigAspect, CopyMode, ObjectEntry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Level, event};

fn versioning_enabled(payload: &Payload) -> bool {
    match payload {
        Payload::Bool(enabled) => *enabled,
        Payload::Object(fields) => fields
            .get("enabled")
            .and_then(Payload::as_bool)
            .unwrap_or(false),
        _ => false,
    }
}

/// Whether the backed-up source configuration had versioning on.
///
/// A unit relocated without a versioning snapshot is treated as unversioned.
async fn source_versioned(ctx: &StepContext) -> Result<bool> {
    match ctx.load_snapshot(ConfigAspect::Versioning.as_str()).await {
        Ok(payload) => Ok(versioning_enabled(&payload)),
        Err(MigrateError::NotFound(_)) => Ok(false),
        Err(err) => Err(err),
    }
}

pub(super) struct BackupMetadata {
    pub options: Arc<RelocationOptions>,
}

#[async_trait]
impl StepAction for BackupMetadata {
    async fn run(&self, ctx: &StepContext) -> Result<()> {
        for aspect in &self.options.aspects {
            let payload = ctx.storage.get_config(ctx.unit_id(), *aspect).await?;
            ctx.save_snapshot(aspect.as_str(), &payload).await?;
        }
        event!(Level::DEBUG, aspects = self.options.aspects.len(), "metadata backed up");
        Ok(())
    }
}

pub(super) struct CreateTempBucket {
    pub options: Arc<RelocationOptions>,
}

#[async_trait]
impl StepAction for CreateTempBucket {
    async fn run(&self, ctx: &StepContext) -> Result<()> {
        let temp = self.options.temp_bucket_name(ctx.unit_id())?;
        if !ctx.storage.bucket_exists(&temp).await? {
            match ctx.storage.create_bucket(&temp, &ctx.unit.target).await {
                Ok(()) | Err(StorageError::AlreadyExists(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        if source_versioned(ctx).await? {
            ctx.storage
                .set_config(&temp, ConfigAspect::Versioning, &Payload::Bool(true))
                .await?;
        }
        Ok(())
    }
}

/// Copies source → temp. Used for the bulk copy and the final catch-up sync.
///
/// The catch-up re-copies objects overwritten since the bulk copy; in a
/// versioned bucket the overwrite is a new generation and `AllVersions` picks
/// it up.
pub(super) struct CopyToTemp {
    pub options: Arc<RelocationOptions>,
    pub catch_up: bool,
}

#[async_trait]
impl StepAction for CopyToTemp {
    async fn run(&self, ctx: &StepContext) -> Result<()> {
        let temp = self.options.temp_bucket_name(ctx.unit_id())?;
        let mode = match (self.catch_up, source_versioned(ctx).await?) {
            (_, true) => CopyMode::AllVersions,
            (false, false) => CopyMode::LatestOnly,
            (true, false) => CopyMode::Sync,
        };
        ctx.storage
            .copy_all_objects(ctx.unit_id(), &temp, mode)
            .await?;
        Ok(())
    }
}

/// Every object in the source must have arrived in the temp bucket unchanged.
pub(super) struct VerifyTempCopy {
    pub options: Arc<RelocationOptions>,
}

#[async_trait]
impl StepAction for VerifyTempCopy {
    async fn run(&self, ctx: &StepContext) -> Result<()> {
        let temp = self.options.temp_bucket_name(ctx.unit_id())?;
        let versioned = source_versioned(ctx).await?;
        let source = ctx.storage.list_objects(ctx.unit_id(), versioned).await?;
        let copied = ctx.storage.list_objects(&temp, versioned).await?;

        let missing = missing_or_changed(&source, &copied);
        if !missing.is_empty() {
            return Err(StorageError::PartialFailure(missing).into());
        }
        event!(Level::DEBUG, objects = source.len(), "temp copy verified");
        Ok(())
    }
}

/// Names of `source` entries without a matching entry in `copied`.
///
/// Copies get new generation numbers, so each source entry is paired with any
/// unused copied entry of the same name and content.
fn missing_or_changed(source: &[ObjectEntry], copied: &[ObjectEntry]) -> Vec<String> {
    let mut available: HashMap<&str, Vec<&ObjectEntry>> = HashMap::new();
    for entry in copied {
        available.entry(entry.name.as_str()).or_default().push(entry);
    }
    let mut missing = Vec::new();
    for entry in source {
        let candidates = available.entry(entry.name.as_str()).or_default();
        match candidates.iter().position(|copy| entry.matches(copy)) {
            Some(index) => {
                candidates.swap_remove(index);
            }
            None => missing.push(entry.name.clone()),
        }
    }
    missing.sort();
    missing.dedup();
    missing
}

pub(super) struct DeleteSource;

#[async_trait]
impl StepAction for DeleteSource {
    async fn run(&self, ctx: &StepContext) -> Result<()> {
        match ctx.storage.delete_bucket_recursive(ctx.unit_id()).await {
            Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

pub(super) struct RecreateSource;

#[async_trait]
impl StepAction for RecreateSource {
    async fn run(&self, ctx: &StepContext) -> Result<()> {
        if ctx.storage.bucket_exists(ctx.unit_id()).await? {
            return Ok(());
        }
        match ctx
            .storage
            .create_bucket(ctx.unit_id(), &ctx.unit.target)
            .await
        {
            Ok(()) | Err(StorageError::AlreadyExists(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Replays backed-up configuration onto the recreated source.
pub(super) struct RestoreMetadata {
    pub aspects: Vec<ConfigAspect>,
}

#[async_trait]
impl StepAction for RestoreMetadata {
    async fn run(&self, ctx: &StepContext) -> Result<()> {
        for aspect in &self.aspects {
            let payload = ctx.load_snapshot(aspect.as_str()).await?;
            ctx.storage
                .set_config(ctx.unit_id(), *aspect, &payload)
                .await?;
        }
        Ok(())
    }
}

pub(super) struct CopyBack {
    pub options: Arc<RelocationOptions>,
}

#[async_trait]
impl StepAction for CopyBack {
    async fn run(&self, ctx: &StepContext) -> Result<()> {
        let temp = self.options.temp_bucket_name(ctx.unit_id())?;
        let mode = if source_versioned(ctx).await? {
            CopyMode::AllVersions
        } else {
            CopyMode::Sync
        };
        ctx.storage
            .copy_all_objects(&temp, ctx.unit_id(), mode)
            .await?;
        Ok(())
    }
}

pub(super) struct DeleteTemp {
    pub options: Arc<RelocationOptions>,
}

#[async_trait]
impl StepAction for DeleteTemp {
    async fn run(&self, ctx: &StepContext) -> Result<()> {
        let temp = self.options.temp_bucket_name(ctx.unit_id())?;
        match ctx.storage.delete_bucket_recursive(&temp).await {
            Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
