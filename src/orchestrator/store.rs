//! Per-unit outcome storage with DashMap
//!
//! Unit workers record their final outcome concurrently; the report reads a
//! sorted snapshot once every worker has finished.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::query::ProcessingUnit;

/// Final state of one ProcessingUnit
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome {
    /// Every task succeeded; `degraded` lists tasks that used a fallback
    Completed { degraded: Vec<String> },
    /// A required input was missing
    Skipped { reason: String },
    /// A singular input matched several records
    Ambiguous { reason: String },
    /// Planning failed (`task_id` is `None`) or a task failed
    Failed {
        task_id: Option<String>,
        reason: String,
    },
}

impl UnitOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Ambiguous { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed { degraded } if !degraded.is_empty() => "degraded",
            Self::Completed { .. } => "completed",
            Self::Skipped { .. } => "skipped",
            Self::Ambiguous { .. } => "ambiguous",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Thread-safe storage for unit outcomes
#[derive(Clone, Default)]
pub struct OutcomeStore {
    outcomes: Arc<DashMap<ProcessingUnit, UnitOutcome>>,
}

impl OutcomeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outcome; an earlier outcome for the same unit is kept
    pub fn record(&self, unit: ProcessingUnit, outcome: UnitOutcome) {
        self.outcomes.entry(unit).or_insert(outcome);
    }

    pub fn get(&self, unit: &ProcessingUnit) -> Option<UnitOutcome> {
        self.outcomes.get(unit).map(|o| o.clone())
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Outcomes ordered by unit
    pub fn snapshot(&self) -> BTreeMap<ProcessingUnit, UnitOutcome> {
        self.outcomes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(subject: &str) -> ProcessingUnit {
        ProcessingUnit::new(subject, None, None)
    }

    #[test]
    fn first_outcome_wins() {
        let store = OutcomeStore::new();
        store.record(
            unit("01"),
            UnitOutcome::Ambiguous {
                reason: "two t1w".to_string(),
            },
        );
        store.record(unit("01"), UnitOutcome::Completed { degraded: vec![] });
        assert!(store.get(&unit("01")).unwrap().is_ambiguous());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn snapshot_is_sorted_by_unit() {
        let store = OutcomeStore::new();
        for subject in ["03", "01", "02"] {
            store.record(unit(subject), UnitOutcome::Completed { degraded: vec![] });
        }
        let order: Vec<String> = store.snapshot().keys().map(|u| u.subject.clone()).collect();
        assert_eq!(order, vec!["01", "02", "03"]);
    }

    #[test]
    fn concurrent_records_from_clones() {
        let store = OutcomeStore::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store.record(unit(&format!("{i:02}")), UnitOutcome::Completed { degraded: vec![] })
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len(), 8);
    }

    #[test]
    fn degraded_completion_has_its_own_label() {
        let outcome = UnitOutcome::Completed {
            degraded: vec!["sub-01/fod".to_string()],
        };
        assert_eq!(outcome.label(), "degraded");
        assert!(outcome.is_completed());
    }
}
