// ============================================================================
// bucketmove library
// ============================================================================

pub mod checkpoint;
pub mod core;
pub mod engine;
pub mod interface;
pub mod relocate;

// Re-export main types for convenience
pub use checkpoint::{CheckpointRecord, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use crate::core::{FailureKind, MigrateError, MigrationUnit, Payload, Result, StorageError, TargetConfig};
pub use engine::{
    CheckpointDurability, FnAction, MigrationOrchestrator, MigrationPlan, MigrationPolicy,
    MigrationReport, RetryPolicy, Stage, StageController, Step, StepAction, StepContext,
    StepExecutor, StepFailure, StepOutcome, UnitOutcome,
};
pub use interface::{ConfigAspect, CopyMode, ObjectEntry, StorageClient, StorageResult};
pub use relocate::{FINALIZE_STAGE, PREPARE_STAGE, RelocationOptions, RelocationPlan};
