use super::plan::{Step, StepContext};
use super::policy::RetryPolicy;
use crate::checkpoint::CheckpointStore;
use crate::core::{FailureKind, MigrateError, MigrationUnit};
use crate::interface::StorageClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, event, info_span};

/// Why a step did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub reason: String,
    /// Attempts made before giving up. Zero when the action never ran.
    pub attempts: u32,
}

impl StepFailure {
    pub fn new(kind: FailureKind, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            kind,
            reason: reason.into(),
            attempts,
        }
    }

    fn from_error(err: &MigrateError, attempts: u32) -> Self {
        Self::new(err.failure_kind(), err.to_string(), attempts)
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} after {} attempt(s))", self.reason, self.kind, self.attempts)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    /// The checkpoint already covers this step; nothing was called.
    Skipped,
    Failed(StepFailure),
}

/// Runs single steps under the retry policy and records them on success.
#[derive(Clone)]
pub struct StepExecutor {
    checkpoints: Arc<dyn CheckpointStore>,
    storage: Arc<dyn StorageClient>,
    retry: RetryPolicy,
    step_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl StepExecutor {
    pub fn new(
        checkpoints: Arc<dyn CheckpointStore>,
        storage: Arc<dyn StorageClient>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            checkpoints,
            storage,
            retry,
            step_timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_step_timeout(mut self, step_timeout: Option<Duration>) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Runs `step` for `unit` unless the checkpoint says it is already done.
    ///
    /// The checkpoint is written only after the action succeeds. A failed write
    /// turns an otherwise successful step into a `Persistence` failure.
    pub async fn run(&self, unit: &Arc<MigrationUnit>, step: &Step) -> StepOutcome {
        let span = info_span!(
            "migration.step",
            unit = %unit.id(),
            step = %step.name,
            ordinal = step.ordinal
        );
        self.run_inner(unit, step).instrument(span).await
    }

    async fn run_inner(&self, unit: &Arc<MigrationUnit>, step: &Step) -> StepOutcome {
        let last_completed = match self.checkpoints.get_last_completed(unit.id()).await {
            Ok(last) => last,
            Err(err) => {
                event!(Level::ERROR, error = %err, "checkpoint read failed");
                return StepOutcome::Failed(StepFailure::from_error(&err, 0));
            }
        };

        if step.ordinal <= last_completed {
            event!(Level::DEBUG, last_completed, "step already checkpointed");
            return StepOutcome::Skipped;
        }
        if step.ordinal > last_completed.saturating_add(1) {
            let reason = format!(
                "step ordinal {} would skip incomplete ordinals after {}",
                step.ordinal, last_completed
            );
            event!(Level::ERROR, last_completed, "step dispatched out of order");
            return StepOutcome::Failed(StepFailure::new(FailureKind::Configuration, reason, 0));
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let ctx = StepContext::new(
                unit.clone(),
                self.storage.clone(),
                self.checkpoints.clone(),
                step,
                attempt,
            );

            let err = match self.attempt_action(step, &ctx).await {
                Ok(()) => return self.record_success(unit, step, attempt).await,
                Err(err) => err,
            };

            if !err.is_retryable() {
                event!(
                    Level::ERROR,
                    attempt,
                    error = %err,
                    kind = %err.failure_kind(),
                    "step failed"
                );
                return StepOutcome::Failed(StepFailure::from_error(&err, attempt));
            }
            if attempt >= max_attempts {
                event!(
                    Level::ERROR,
                    attempt,
                    error = %err,
                    "step failed after max retries"
                );
                return StepOutcome::Failed(StepFailure::new(
                    FailureKind::Transient,
                    format!("retries exhausted: {}", err),
                    attempt,
                ));
            }

            let delay = self.retry.backoff(attempt);
            event!(
                Level::WARN,
                attempt,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "step failed, retrying"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    event!(Level::INFO, attempt, "retry abandoned on cancellation");
                    return StepOutcome::Failed(StepFailure::new(
                        FailureKind::Cancelled,
                        format!("cancelled while backing off: {}", err),
                        attempt,
                    ));
                }
                _ = sleep(delay) => {}
            }
        }
    }

    async fn attempt_action(&self, step: &Step, ctx: &StepContext) -> crate::core::Result<()> {
        match self.step_timeout {
            Some(limit) => timeout(limit, step.action.run(ctx))
                .await
                .map_err(|_| {
                    MigrateError::Timeout(format!(
                        "step '{}' exceeded {}ms",
                        step.name,
                        limit.as_millis()
                    ))
                })?,
            None => step.action.run(ctx).await,
        }
    }

    async fn record_success(
        &self,
        unit: &Arc<MigrationUnit>,
        step: &Step,
        attempt: u32,
    ) -> StepOutcome {
        match self
            .checkpoints
            .record_completed(unit.id(), step.ordinal)
            .await
        {
            Ok(()) => {
                event!(Level::INFO, attempt, "step completed");
                StepOutcome::Success
            }
            Err(err) => {
                event!(
                    Level::ERROR,
                    attempt,
                    error = %err,
                    "step action succeeded but its checkpoint was not recorded"
                );
                StepOutcome::Failed(StepFailure::new(
                    FailureKind::Persistence,
                    format!("action succeeded but checkpoint write failed: {}", err),
                    attempt,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::core::{StorageError, TargetConfig};
    use crate::engine::plan::{FnAction, StepAction};
    use crate::interface::{ConfigAspect, CopyMode, ObjectEntry, StorageResult};
    use crate::core::Payload;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NullStorage;

    #[async_trait]
    impl StorageClient for NullStorage {
        async fn bucket_exists(&self, _bucket: &str) -> StorageResult<bool> {
            Ok(false)
        }
        async fn create_bucket(&self, _bucket: &str, _config: &TargetConfig) -> StorageResult<()> {
            Ok(())
        }
        async fn delete_bucket_recursive(&self, _bucket: &str) -> StorageResult<()> {
            Ok(())
        }
        async fn copy_all_objects(&self, _src: &str, _dst: &str, _mode: CopyMode) -> StorageResult<()> {
            Ok(())
        }
        async fn get_config(&self, _bucket: &str, _aspect: ConfigAspect) -> StorageResult<Payload> {
            Ok(Payload::Null)
        }
        async fn set_config(&self, _bucket: &str, _aspect: ConfigAspect, _payload: &Payload) -> StorageResult<()> {
            Ok(())
        }
        async fn list_objects(&self, _bucket: &str, _include_versions: bool) -> StorageResult<Vec<ObjectEntry>> {
            Ok(Vec::new())
        }
    }

    fn counting_step(ordinal: u32, calls: Arc<AtomicU32>, fail_first: u32, err: StorageError) -> Step {
        let action = FnAction::new(move |_ctx| {
            let calls = calls.clone();
            let err = err.clone();
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < fail_first {
                    Err(MigrateError::Storage(err))
                } else {
                    Ok(())
                }
            })
        });
        Step::new(format!("step-{}", ordinal), ordinal, Arc::new(action) as Arc<dyn StepAction>)
    }

    fn executor(store: Arc<MemoryCheckpointStore>, attempts: u32) -> StepExecutor {
        StepExecutor::new(store, Arc::new(NullStorage), RetryPolicy::with_max_attempts(attempts))
    }

    fn unit() -> Arc<MigrationUnit> {
        Arc::new(MigrationUnit::new("bucket-a", TargetConfig::default()))
    }

    #[tokio::test]
    async fn test_success_records_checkpoint() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let step = counting_step(1, calls.clone(), 0, StorageError::Transient("x".into()));

        let outcome = executor(store.clone(), 3).run(&unit(), &step).await;
        assert_eq!(outcome, StepOutcome::Success);
        assert_eq!(store.get_last_completed("bucket-a").await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_checkpointed_step_is_skipped_without_calling_action() {
        let store = Arc::new(MemoryCheckpointStore::new());
        store.record_completed("bucket-a", 2).await.unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let step = counting_step(2, calls.clone(), 0, StorageError::Transient("x".into()));

        let outcome = executor(store, 3).run(&unit(), &step).await;
        assert_eq!(outcome, StepOutcome::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let step = counting_step(1, calls.clone(), 2, StorageError::NotEmpty("b".into()));

        let outcome = executor(store, 5).run(&unit(), &step).await;
        assert_eq!(outcome, StepOutcome::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhaust_to_transient_failure() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let step = counting_step(1, calls.clone(), u32::MAX, StorageError::Transient("503".into()));

        let outcome = executor(store.clone(), 3).run(&unit(), &step).await;
        match outcome {
            StepOutcome::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::Transient);
                assert_eq!(failure.attempts, 3);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.get_last_completed("bucket-a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let step = counting_step(1, calls.clone(), u32::MAX, StorageError::AccessDenied("b".into()));

        let outcome = executor(store, 5).run(&unit(), &step).await;
        assert!(matches!(
            outcome,
            StepOutcome::Failed(StepFailure { kind: FailureKind::Permanent, attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_step_is_refused() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let step = counting_step(3, calls.clone(), 0, StorageError::Transient("x".into()));

        let outcome = executor(store, 1).run(&unit(), &step).await;
        assert!(matches!(
            outcome,
            StepOutcome::Failed(StepFailure { kind: FailureKind::Configuration, attempts: 0, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let action = FnAction::new(move |_ctx| {
            let counter = counter.clone();
            Box::pin(async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    sleep(Duration::from_secs(60)).await;
                }
                Ok(())
            })
        });
        let step = Step::new("slow", 1, Arc::new(action));

        let outcome = executor(store, 3)
            .with_step_timeout(Some(Duration::from_millis(20)))
            .run(&unit(), &step)
            .await;
        assert_eq!(outcome, StepOutcome::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retrying() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let step = counting_step(1, calls.clone(), u32::MAX, StorageError::Transient("503".into()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let retry = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
            jitter: false,
        };
        let outcome = StepExecutor::new(store, Arc::new(NullStorage), retry)
            .with_cancellation(cancel)
            .run(&unit(), &step)
            .await;
        assert!(matches!(
            outcome,
            StepOutcome::Failed(StepFailure { kind: FailureKind::Cancelled, attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
