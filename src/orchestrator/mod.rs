//! Orchestrator - top-level stage driver
//!
//! ```text
//! ResolvedConfig ─► EntityIndex ─► StagePlanner ─► WorkflowGraph
//!                                                      │
//!                     one worker per unit (≤ threads) ◄┘
//!                       └─► TaskRunner::execute, in dependency order
//! ```
//!
//! A failing task aborts the rest of its unit only. The `index` stage is an
//! aggregate: its failure is fatal for the whole run.

pub mod store;

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{ResolvedConfig, Stage};
use crate::descriptor::DatasetDescriptor;
use crate::error::{exit_code, DwiprocError, Result};
use crate::event_log::{EventKind, EventLog};
use crate::index::EntityIndex;
use crate::plan::{Layout, Plan, StagePlanner, Task};
use crate::query::{ProcessingUnit, SelectionIssue};
use crate::runner::{builtin, RunnerAdapter, TaskOutcome, TaskRunner};

pub use store::{OutcomeStore, UnitOutcome};

/// Per-unit outcomes of one stage invocation
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub stage: Stage,
    pub units: BTreeMap<ProcessingUnit, UnitOutcome>,
    pub duration: Duration,
}

impl StageReport {
    fn count(&self, pred: impl Fn(&UnitOutcome) -> bool) -> usize {
        self.units.values().filter(|o| pred(o)).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(UnitOutcome::is_completed)
    }

    pub fn failed(&self) -> usize {
        self.count(UnitOutcome::is_failed)
    }

    /// Skipped or ambiguous units
    pub fn skipped(&self) -> usize {
        self.units.len() - self.succeeded() - self.failed()
    }

    pub fn has_ambiguity(&self) -> bool {
        self.units.values().any(UnitOutcome::is_ambiguous)
    }

    /// 3 on any ambiguity, 1 when every attempted unit failed, else 0
    pub fn exit_code(&self) -> i32 {
        if self.has_ambiguity() {
            exit_code::AMBIGUITY
        } else if self.failed() > 0 && self.succeeded() == 0 {
            exit_code::FAILURE
        } else {
            exit_code::SUCCESS
        }
    }
}

pub struct Orchestrator {
    config: Arc<ResolvedConfig>,
    runner: Arc<dyn TaskRunner>,
    layout: Layout,
    events: EventLog,
    outcomes: OutcomeStore,
}

impl Orchestrator {
    /// Orchestrator using the configured backend
    pub fn new(config: Arc<ResolvedConfig>) -> Self {
        let layout = Layout::from_config(&config);
        let runner = Arc::new(RunnerAdapter::new(&config, &layout));
        Self {
            config,
            runner,
            layout,
            events: EventLog::new(),
            outcomes: OutcomeStore::new(),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Persisted index, or an in-memory one when the artifact is missing
    pub async fn load_index(&self) -> Result<EntityIndex> {
        if self.config.stage == Stage::Index {
            return Ok(EntityIndex::new(&self.config.input_dir, Vec::new()));
        }
        let root = self.config.input_dir.clone();
        let index_path = self.config.index_path();
        tokio::task::spawn_blocking(move || builtin::load_or_build(&root, &index_path))
            .await
            .map_err(|e| DwiprocError::IndexFailed {
                reason: e.to_string(),
            })?
    }

    /// Load the index and plan the stage
    pub async fn plan(&self) -> Result<Plan> {
        let index = self.load_index().await?;
        StagePlanner::new(&self.config, &index).plan()
    }

    /// Plan, execute and write the stage artifacts
    pub async fn run(&self) -> Result<StageReport> {
        let plan = self.plan().await?;
        let report = self.execute(&plan).await;
        self.finish(report.as_ref().ok())?;
        report
    }

    fn record_excluded(&self, plan: &Plan) {
        for issue in &plan.issues {
            let reason = issue.to_error().to_string();
            let outcome = match issue {
                SelectionIssue::Missing { .. } => {
                    warn!(unit = %issue.unit(), "{reason}; skipping");
                    UnitOutcome::Skipped { reason: reason.clone() }
                }
                SelectionIssue::Ambiguous { .. } => {
                    error!(unit = %issue.unit(), "{reason}");
                    UnitOutcome::Ambiguous { reason: reason.clone() }
                }
            };
            self.events.emit(EventKind::UnitSkipped {
                unit: Arc::from(issue.unit().prefix()),
                reason,
            });
            self.outcomes.record(issue.unit().clone(), outcome);
        }
        for failure in &plan.failures {
            self.events.emit(EventKind::UnitSkipped {
                unit: Arc::from(failure.unit.prefix()),
                reason: failure.reason.clone(),
            });
            self.outcomes.record(
                failure.unit.clone(),
                UnitOutcome::Failed {
                    task_id: None,
                    reason: failure.reason.clone(),
                },
            );
        }
    }

    /// Execute a planned stage
    ///
    /// Returns an error only for run-wide failures: preflight, or the
    /// aggregate `index` task.
    pub async fn execute(&self, plan: &Plan) -> Result<StageReport> {
        let start = Instant::now();
        self.record_excluded(plan);

        let chains: Vec<(Option<ProcessingUnit>, Vec<Task>)> = plan
            .graph
            .unit_chains()
            .into_iter()
            .map(|(unit, tasks)| (unit, tasks.into_iter().cloned().collect()))
            .collect();
        self.events.emit(EventKind::StageStarted {
            stage: plan.stage.to_string(),
            units: chains.len(),
            task_count: plan.graph.len(),
        });

        if let Err(e) = self.runner.preflight(&plan.graph).await {
            self.events.emit(EventKind::StageFailed { error: e.to_string() });
            return Err(e);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.opts.threads.max(1)));
        let mut workers = JoinSet::new();
        for (unit, tasks) in chains {
            let runner = Arc::clone(&self.runner);
            let events = self.events.clone();
            let semaphore = Arc::clone(&semaphore);
            workers.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    let reason = "worker pool closed".to_string();
                    return (unit, UnitOutcome::Failed { task_id: None, reason });
                };
                // inner task so a panicking runner still yields an outcome
                let chain_unit = unit.clone();
                let chain = tokio::spawn(async move {
                    run_chain(runner.as_ref(), &events, chain_unit.as_ref(), &tasks).await
                });
                let outcome = match chain.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(error = %e, "unit worker panicked");
                        UnitOutcome::Failed {
                            task_id: None,
                            reason: format!("unit worker panicked: {e}"),
                        }
                    }
                };
                (unit, outcome)
            });
        }

        while let Some(joined) = workers.join_next().await {
            let (unit, outcome) = match joined {
                Ok(done) => done,
                // chain panics are caught inside the worker, so this is a
                // cancelled runtime and the stage cannot be summarised
                Err(e) => {
                    self.events.emit(EventKind::StageFailed { error: e.to_string() });
                    return Err(DwiprocError::Io(e.into()));
                }
            };
            match unit {
                Some(unit) => self.outcomes.record(unit, outcome),
                // aggregate stage: failure is global
                None => {
                    if let UnitOutcome::Failed { reason, .. } = outcome {
                        self.events.emit(EventKind::StageFailed { error: reason.clone() });
                        return Err(DwiprocError::IndexFailed { reason });
                    }
                }
            }
        }

        let report = StageReport {
            stage: plan.stage,
            units: self.outcomes.snapshot(),
            duration: start.elapsed(),
        };
        self.events.emit(EventKind::StageCompleted {
            succeeded: report.succeeded(),
            skipped: report.skipped(),
            failed: report.failed(),
            total_duration_ms: report.duration.as_millis() as u64,
        });
        info!(
            stage = %report.stage,
            succeeded = report.succeeded(),
            skipped = report.skipped(),
            failed = report.failed(),
            "Stage finished"
        );
        Ok(report)
    }

    /// Event log, descriptor and working-directory cleanup
    ///
    /// The working directory is kept when `work_keep` is set or when any unit
    /// failed, so intermediates can be inspected.
    pub fn finish(&self, report: Option<&StageReport>) -> Result<()> {
        let log_path = self.events_path();
        self.events.save(&log_path)?;
        debug!(path = %log_path.display(), "Wrote event log");

        let Some(report) = report else {
            return Ok(());
        };
        if report.stage != Stage::Index && report.succeeded() > 0 {
            DatasetDescriptor::for_stage(report.stage).save(&self.config.output_dir)?;
        }
        let work_root = self.layout.work_root();
        if !self.config.opts.work_keep && report.failed() == 0 && work_root.exists() {
            fs::remove_dir_all(work_root)?;
            debug!(path = %work_root.display(), "Removed working directory");
        }
        Ok(())
    }

    pub fn events_path(&self) -> PathBuf {
        self.config
            .output_dir
            .join("logs")
            .join(format!("{}_events.json", self.config.stage))
    }
}

/// Run one unit's tasks in dependency order, stopping at the first failure
async fn run_chain(
    runner: &dyn TaskRunner,
    events: &EventLog,
    unit: Option<&ProcessingUnit>,
    tasks: &[Task],
) -> UnitOutcome {
    let start = Instant::now();
    let label: Arc<str> = match unit {
        Some(unit) => Arc::from(unit.prefix()),
        None => Arc::from("aggregate"),
    };
    events.emit(EventKind::UnitStarted {
        unit: Arc::clone(&label),
        task_count: tasks.len(),
    });
    info!(unit = %label, tasks = tasks.len(), "Processing unit");

    let mut degraded = Vec::new();
    for (pos, task) in tasks.iter().enumerate() {
        events.emit(EventKind::TaskStarted {
            task_id: Arc::clone(&task.id),
            inputs: serde_json::to_value(&task.inputs).unwrap_or_default(),
        });
        let result = runner.execute(task).await;
        let duration_ms = result.duration.as_millis() as u64;

        match result.outcome {
            TaskOutcome::Success => {
                events.emit(EventKind::TaskCompleted {
                    task_id: Arc::clone(&task.id),
                    outputs: serde_json::to_value(&result.outputs).unwrap_or_default(),
                    duration_ms,
                });
            }
            TaskOutcome::Passthrough => {
                events.emit(EventKind::TaskPassthrough {
                    task_id: Arc::clone(&task.id),
                });
            }
            TaskOutcome::Degraded { reason, substitute } => {
                warn!(task = %task.id, substitute = %substitute, "{reason}");
                degraded.push(task.id.to_string());
                events.emit(EventKind::TaskDegraded {
                    task_id: Arc::clone(&task.id),
                    reason,
                    substitute,
                    duration_ms,
                });
            }
            TaskOutcome::Failed { reason } => {
                error!(task = %task.id, "{reason}");
                events.emit(EventKind::TaskFailed {
                    task_id: Arc::clone(&task.id),
                    error: reason.clone(),
                    duration_ms,
                });
                for aborted in &tasks[pos + 1..] {
                    events.emit(EventKind::TaskAborted {
                        task_id: Arc::clone(&aborted.id),
                    });
                }
                events.emit(EventKind::UnitFailed {
                    unit: label,
                    failed_task: Arc::clone(&task.id),
                    error: reason.clone(),
                });
                return UnitOutcome::Failed {
                    task_id: Some(task.id.to_string()),
                    reason,
                };
            }
        }
    }

    events.emit(EventKind::UnitCompleted {
        unit: label,
        duration_ms: start.elapsed().as_millis() as u64,
    });
    UnitOutcome::Completed { degraded }
}
