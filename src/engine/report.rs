use super::controller::UnitOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Per-unit results of one `migrate_all` run.
///
/// Always holds an entry for every submitted unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub run_id: Uuid,
    pub target_stage: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: BTreeMap<String, UnitOutcome>,
}

impl MigrationReport {
    pub fn is_success(&self) -> bool {
        self.results.values().all(UnitOutcome::is_completed)
    }

    pub fn get(&self, unit_id: &str) -> Option<&UnitOutcome> {
        self.results.get(unit_id)
    }

    pub fn completed(&self) -> Vec<&str> {
        self.units_where(|outcome| matches!(outcome, UnitOutcome::Completed))
    }

    pub fn blocked(&self) -> Vec<&str> {
        self.units_where(|outcome| matches!(outcome, UnitOutcome::Blocked { .. }))
    }

    pub fn failed(&self) -> Vec<&str> {
        self.units_where(|outcome| matches!(outcome, UnitOutcome::Failed { .. }))
    }

    fn units_where(&self, pred: impl Fn(&UnitOutcome) -> bool) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, outcome)| pred(outcome))
            .map(|(unit, _)| unit.as_str())
            .collect()
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Migration run {} to stage '{}': {} completed, {} blocked, {} failed",
            self.run_id,
            self.target_stage,
            self.completed().len(),
            self.blocked().len(),
            self.failed().len()
        )?;
        let width = self.results.keys().map(String::len).max().unwrap_or(0);
        for (unit, outcome) in &self.results {
            match outcome {
                UnitOutcome::Completed => {
                    writeln!(f, "  {:<width$}  {}", unit, outcome.label(), width = width)?;
                }
                UnitOutcome::Blocked { step, ordinal } => {
                    writeln!(
                        f,
                        "  {:<width$}  {}  at step {} '{}'",
                        unit,
                        outcome.label(),
                        ordinal,
                        step,
                        width = width
                    )?;
                }
                UnitOutcome::Failed {
                    step,
                    ordinal,
                    failure,
                } => {
                    writeln!(
                        f,
                        "  {:<width$}  {}  at step {} '{}': {}",
                        unit,
                        outcome.label(),
                        ordinal,
                        step,
                        failure,
                        width = width
                    )?;
                }
            }
        }
        Ok(())
    }
}
