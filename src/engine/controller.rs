use super::executor::{StepExecutor, StepFailure, StepOutcome};
use super::plan::MigrationPlan;
use crate::core::{FailureKind, MigrationUnit, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// Terminal state of one unit after an advance request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UnitOutcome {
    Completed,
    /// Stopped by cancellation before `step` could run to completion.
    Blocked { step: String, ordinal: u32 },
    Failed {
        step: String,
        ordinal: u32,
        failure: StepFailure,
    },
}

impl UnitOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Blocked { .. } => "blocked",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Drives a unit through the plan's steps in ordinal order.
#[derive(Clone)]
pub struct StageController {
    plan: Arc<MigrationPlan>,
    executor: StepExecutor,
}

impl StageController {
    pub fn new(plan: Arc<MigrationPlan>, executor: StepExecutor) -> Self {
        Self { plan, executor }
    }

    pub fn plan(&self) -> &Arc<MigrationPlan> {
        &self.plan
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    /// Runs every incomplete step of the stages up to and including `target_stage`.
    ///
    /// Where to resume is decided only by the checkpoint store: steps at or below
    /// the recorded ordinal are skipped, and the first failure stops the unit.
    /// An unknown or malformed target stage is returned as `Err`.
    pub async fn advance_unit_to_stage(
        &self,
        unit: &Arc<MigrationUnit>,
        target_stage: &str,
    ) -> Result<UnitOutcome> {
        let steps = self.plan.steps_through(target_stage)?;
        let span = info_span!("migration.unit", unit = %unit.id(), target_stage = %target_stage);

        async {
            let cancel = self.executor.cancellation_token();
            for step in steps {
                if cancel.is_cancelled() && !self.is_checkpointed(unit, step.ordinal).await {
                    event!(Level::INFO, step = %step.name, "unit paused on cancellation");
                    return Ok(UnitOutcome::Blocked {
                        step: step.name.clone(),
                        ordinal: step.ordinal,
                    });
                }

                match self.executor.run(unit, step).await {
                    StepOutcome::Success | StepOutcome::Skipped => {}
                    StepOutcome::Failed(failure) if failure.kind == FailureKind::Cancelled => {
                        return Ok(UnitOutcome::Blocked {
                            step: step.name.clone(),
                            ordinal: step.ordinal,
                        });
                    }
                    StepOutcome::Failed(failure) => {
                        event!(
                            Level::WARN,
                            step = %step.name,
                            ordinal = step.ordinal,
                            reason = %failure.reason,
                            "unit stopped at failed step"
                        );
                        return Ok(UnitOutcome::Failed {
                            step: step.name.clone(),
                            ordinal: step.ordinal,
                            failure,
                        });
                    }
                }
            }
            event!(Level::INFO, "unit reached target stage");
            Ok(UnitOutcome::Completed)
        }
        .instrument(span)
        .await
    }

    /// A read failure counts as "not checkpointed" so the unit stops where it is.
    async fn is_checkpointed(&self, unit: &MigrationUnit, ordinal: u32) -> bool {
        self.executor
            .checkpoints()
            .get_last_completed(unit.id())
            .await
            .map(|last| ordinal <= last)
            .unwrap_or(false)
    }
}
