use super::controller::{StageController, UnitOutcome};
use super::executor::{StepExecutor, StepFailure};
use super::plan::MigrationPlan;
use super::policy::MigrationPolicy;
use super::report::MigrationReport;
use crate::checkpoint::CheckpointStore;
use crate::core::{FailureKind, MigrateError, MigrationUnit, Result};
use crate::interface::StorageClient;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

/// Step name used in results for failures that happen before any step runs.
pub const DISPATCH_STEP: &str = "dispatch";

/// Fans independent units out over the stage controller.
pub struct MigrationOrchestrator {
    controller: StageController,
    policy: MigrationPolicy,
    inflight: Arc<Mutex<HashSet<String>>>,
}

impl MigrationOrchestrator {
    pub fn new(
        plan: MigrationPlan,
        checkpoints: Arc<dyn CheckpointStore>,
        storage: Arc<dyn StorageClient>,
        policy: MigrationPolicy,
    ) -> Result<Self> {
        policy.validate()?;
        plan.validate()?;
        let executor = StepExecutor::new(checkpoints, storage, policy.retry.clone())
            .with_step_timeout(policy.step_timeout());
        Ok(Self {
            controller: StageController::new(Arc::new(plan), executor),
            policy,
            inflight: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn plan(&self) -> &MigrationPlan {
        self.controller.plan()
    }

    pub fn policy(&self) -> &MigrationPolicy {
        &self.policy
    }

    pub fn controller(&self) -> &StageController {
        &self.controller
    }

    /// Token that stops new steps from being dispatched once cancelled.
    ///
    /// Steps already talking to storage run to completion (or their timeout),
    /// so checkpoints stay consistent. Cancellation is permanent for this
    /// orchestrator.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.controller.executor().cancellation_token().clone()
    }

    /// [`migrate_all`](Self::migrate_all) with the policy's concurrency limit.
    pub async fn migrate(
        &self,
        units: Vec<MigrationUnit>,
        target_stage: &str,
    ) -> Result<MigrationReport> {
        let limit = self.policy.concurrency.max_inflight_units;
        self.migrate_all(units, target_stage, limit).await
    }

    /// Advances every unit to `target_stage`, at most `concurrency_limit` at a time.
    ///
    /// Per-unit failures never abort the batch; they are reported in the returned
    /// map. `Err` is reserved for caller mistakes detected before anything runs:
    /// a zero limit, duplicate unit ids, or an unknown target stage.
    pub async fn migrate_all(
        &self,
        units: Vec<MigrationUnit>,
        target_stage: &str,
        concurrency_limit: usize,
    ) -> Result<MigrationReport> {
        if concurrency_limit == 0 {
            return Err(MigrateError::Configuration(
                "concurrency limit must be at least 1".to_string(),
            ));
        }
        self.controller.plan().steps_through(target_stage)?;
        let mut seen = HashSet::new();
        for unit in &units {
            if !seen.insert(unit.id()) {
                return Err(MigrateError::Configuration(format!(
                    "unit '{}' submitted more than once",
                    unit.id()
                )));
            }
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let archive_after = self.policy.archive_on_completion
            && self.controller.plan().final_stage() == Some(target_stage);
        let permits = Arc::new(Semaphore::new(concurrency_limit));
        event!(
            Level::INFO,
            run_id = %run_id,
            units = units.len(),
            target_stage = %target_stage,
            concurrency_limit,
            "migration run started"
        );

        let mut handles = Vec::with_capacity(units.len());
        for unit in units {
            let unit = Arc::new(unit);
            let worker = UnitWorker {
                controller: self.controller.clone(),
                inflight: self.inflight.clone(),
                permits: permits.clone(),
                target_stage: target_stage.to_string(),
                archive_after,
            };
            let span = info_span!("migration.run", run_id = %run_id);
            let handle = tokio::spawn(worker.run(unit.clone()).instrument(span));
            handles.push((unit.id().to_string(), handle));
        }

        let mut results = BTreeMap::new();
        for (unit_id, handle) in handles {
            let outcome = handle.await.unwrap_or_else(|err| {
                event!(Level::ERROR, unit = %unit_id, error = %err, "unit worker aborted");
                dispatch_failure(FailureKind::Permanent, format!("worker task aborted: {}", err))
            });
            results.insert(unit_id, outcome);
        }

        let report = MigrationReport {
            run_id,
            target_stage: target_stage.to_string(),
            started_at,
            finished_at: Utc::now(),
            results,
        };
        event!(
            Level::INFO,
            run_id = %run_id,
            completed = report.completed().len(),
            blocked = report.blocked().len(),
            failed = report.failed().len(),
            "migration run finished"
        );
        Ok(report)
    }
}

fn dispatch_failure(kind: FailureKind, reason: String) -> UnitOutcome {
    UnitOutcome::Failed {
        step: DISPATCH_STEP.to_string(),
        ordinal: 0,
        failure: StepFailure::new(kind, reason, 0),
    }
}

struct UnitWorker {
    controller: StageController,
    inflight: Arc<Mutex<HashSet<String>>>,
    permits: Arc<Semaphore>,
    target_stage: String,
    archive_after: bool,
}

impl UnitWorker {
    async fn run(self, unit: Arc<MigrationUnit>) -> UnitOutcome {
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return dispatch_failure(
                    FailureKind::Configuration,
                    "concurrency semaphore closed".to_string(),
                );
            }
        };

        let _claim = match InflightClaim::acquire(&self.inflight, unit.id()) {
            Ok(Some(claim)) => claim,
            Ok(None) => {
                event!(Level::WARN, unit = %unit.id(), "unit already being migrated");
                return dispatch_failure(
                    FailureKind::Configuration,
                    format!("unit '{}' is already in flight", unit.id()),
                );
            }
            Err(err) => return dispatch_failure(err.failure_kind(), err.to_string()),
        };

        let outcome = match self
            .controller
            .advance_unit_to_stage(&unit, &self.target_stage)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => return dispatch_failure(err.failure_kind(), err.to_string()),
        };

        if outcome.is_completed() && self.archive_after {
            let checkpoints = self.controller.executor().checkpoints();
            if let Err(err) = checkpoints.archive(unit.id()).await {
                event!(
                    Level::WARN,
                    unit = %unit.id(),
                    error = %err,
                    "completed unit could not be archived; next run will retry"
                );
            }
        }
        outcome
    }
}

/// Marks a unit as in flight until dropped.
struct InflightClaim {
    inflight: Arc<Mutex<HashSet<String>>>,
    unit_id: String,
}

impl InflightClaim {
    fn acquire(inflight: &Arc<Mutex<HashSet<String>>>, unit_id: &str) -> Result<Option<Self>> {
        if !inflight.lock()?.insert(unit_id.to_string()) {
            return Ok(None);
        }
        Ok(Some(Self {
            inflight: inflight.clone(),
            unit_id: unit_id.to_string(),
        }))
    }
}

impl Drop for InflightClaim {
    fn drop(&mut self) {
        if let Ok(mut inflight) = self.inflight.lock() {
            inflight.remove(&self.unit_id);
        }
    }
}
