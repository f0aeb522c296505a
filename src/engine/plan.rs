use crate::checkpoint::CheckpointStore;
use crate::core::{MigrateError, MigrationUnit, Payload, Result};
use crate::interface::StorageClient;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Everything a step action may touch while it runs.
///
/// Cheap to clone; actions that spawn work can move a clone into it.
#[derive(Clone)]
pub struct StepContext {
    pub unit: Arc<MigrationUnit>,
    pub storage: Arc<dyn StorageClient>,
    checkpoints: Arc<dyn CheckpointStore>,
    pub step_name: String,
    pub ordinal: u32,
    pub attempt: u32,
}

impl StepContext {
    pub(crate) fn new(
        unit: Arc<MigrationUnit>,
        storage: Arc<dyn StorageClient>,
        checkpoints: Arc<dyn CheckpointStore>,
        step: &Step,
        attempt: u32,
    ) -> Self {
        Self {
            unit,
            storage,
            checkpoints,
            step_name: step.name.clone(),
            ordinal: step.ordinal,
            attempt,
        }
    }

    pub fn unit_id(&self) -> &str {
        self.unit.id()
    }

    /// Stores a payload for a later step of the same unit.
    pub async fn save_snapshot(&self, key: &str, payload: &Payload) -> Result<()> {
        self.checkpoints
            .save_snapshot(self.unit.id(), key, payload)
            .await
    }

    pub async fn load_snapshot(&self, key: &str) -> Result<Payload> {
        self.checkpoints.load_snapshot(self.unit.id(), key).await
    }
}

/// The side effect of a step.
///
/// Actions run at least once: an action that already succeeded may run again
/// after a crash or a failed checkpoint write, and must then leave the same end
/// state.
#[async_trait]
pub trait StepAction: Send + Sync {
    async fn run(&self, ctx: &StepContext) -> Result<()>;
}

type ActionFn = dyn Fn(StepContext) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// Adapts a closure into a [`StepAction`].
pub struct FnAction(Box<ActionFn>);

impl FnAction {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(StepContext) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        Self(Box::new(f))
    }
}

#[async_trait]
impl StepAction for FnAction {
    async fn run(&self, ctx: &StepContext) -> Result<()> {
        (self.0)(ctx.clone()).await
    }
}

#[derive(Clone)]
pub struct Step {
    pub name: String,
    pub ordinal: u32,
    pub action: Arc<dyn StepAction>,
}

impl Step {
    pub fn new(name: impl Into<String>, ordinal: u32, action: Arc<dyn StepAction>) -> Self {
        Self {
            name: name.into(),
            ordinal,
            action,
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("ordinal", &self.ordinal)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub steps: Vec<Step>,
}

impl Stage {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }
}

/// Ordered stages, each an ordered run of steps.
#[derive(Debug, Clone, Default)]
pub struct MigrationPlan {
    stages: Vec<Stage>,
}

impl MigrationPlan {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn builder() -> MigrationPlanBuilder {
        MigrationPlanBuilder::default()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn final_stage(&self) -> Option<&str> {
        self.stages.last().map(|stage| stage.name.as_str())
    }

    pub fn total_steps(&self) -> usize {
        self.stages.iter().map(|stage| stage.steps.len()).sum()
    }

    /// Steps of every stage up to and including `target_stage`, in execution order.
    ///
    /// Fails with a configuration error when the stage is unknown, a stage name
    /// repeats, or the ordinals are not exactly `1..=n` in order.
    pub fn steps_through(&self, target_stage: &str) -> Result<Vec<&Step>> {
        let target_index = self
            .stages
            .iter()
            .position(|stage| stage.name == target_stage)
            .ok_or_else(|| {
                MigrateError::Configuration(format!("unknown stage '{}'", target_stage))
            })?;

        let mut seen = HashSet::new();
        for stage in &self.stages[..=target_index] {
            if !seen.insert(stage.name.as_str()) {
                return Err(MigrateError::Configuration(format!(
                    "stage '{}' is defined more than once",
                    stage.name
                )));
            }
            if stage.steps.is_empty() {
                return Err(MigrateError::Configuration(format!(
                    "stage '{}' has no steps",
                    stage.name
                )));
            }
        }

        let steps = self.stages[..=target_index]
            .iter()
            .flat_map(|stage| stage.steps.iter())
            .collect::<Vec<_>>();
        for (index, step) in steps.iter().enumerate() {
            let expected = index as u32 + 1;
            if step.ordinal != expected {
                return Err(MigrateError::Configuration(format!(
                    "steps through stage '{}' are not contiguous from ordinal 1: step '{}' has ordinal {}, expected {}",
                    target_stage, step.name, step.ordinal, expected
                )));
            }
        }
        Ok(steps)
    }

    /// Checks every stage of the plan.
    pub fn validate(&self) -> Result<()> {
        match self.final_stage() {
            Some(last) => self.steps_through(last).map(|_| ()),
            None => Err(MigrateError::Configuration("plan has no stages".to_string())),
        }
    }
}

/// Builds a plan with ordinals assigned in declaration order.
#[derive(Default)]
pub struct MigrationPlanBuilder {
    stages: Vec<Stage>,
    next_ordinal: u32,
    orphan_step: Option<String>,
}

impl MigrationPlanBuilder {
    pub fn stage(mut self, name: impl Into<String>) -> Self {
        self.stages.push(Stage::new(name, Vec::new()));
        self
    }

    /// Appends a step to the most recently declared stage.
    pub fn step(mut self, name: impl Into<String>, action: impl StepAction + 'static) -> Self {
        let name = name.into();
        let Some(stage) = self.stages.last_mut() else {
            self.orphan_step.get_or_insert(name);
            return self;
        };
        self.next_ordinal += 1;
        stage
            .steps
            .push(Step::new(name, self.next_ordinal, Arc::new(action)));
        self
    }

    pub fn build(self) -> Result<MigrationPlan> {
        if let Some(step) = self.orphan_step {
            return Err(MigrateError::Configuration(format!(
                "step '{}' declared before any stage",
                step
            )));
        }
        let plan = MigrationPlan::new(self.stages);
        plan.validate()?;
        Ok(plan)
    }
}
