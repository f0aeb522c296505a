//! Step execution, stage sequencing and batch orchestration.

pub mod controller;
pub mod executor;
pub mod orchestrator;
pub mod plan;
pub mod policy;
pub mod report;

pub use controller::{StageController, UnitOutcome};
pub use executor::{StepExecutor, StepFailure, StepOutcome};
pub use orchestrator::{DISPATCH_STEP, MigrationOrchestrator};
pub use plan::{FnAction, MigrationPlan, MigrationPlanBuilder, Stage, Step, StepAction, StepContext};
pub use policy::{CheckpointDurability, ConcurrencyPolicy, MigrationPolicy, RetryPolicy};
pub use report::MigrationReport;
