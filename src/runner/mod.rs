//! RunnerAdapter - executes planned tasks on one backend
//!
//! ## Backends
//!
//! | Backend | Engines | Image source |
//! |---------|---------|--------------|
//! | local | - | executables on `PATH` (override = directory) |
//! | container | docker, podman | override, else canonical tag |
//! | singularity | singularity, apptainer | override (`.sif`) required |
//!
//! The backend is fixed for a whole invocation. Builtin invocations run
//! in-process regardless of backend.
//!
//! ## Outcomes
//!
//! A task either succeeds, is a passthrough, is degraded (primary failed,
//! declared fallback succeeded) or fails with the tail of the tool's stderr.

mod backend;
pub mod builtin;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::ResolvedConfig;
use crate::error::{DwiprocError, Result};
use crate::plan::{Command, Invocation, Layout, Task, TaskAction, TaskId, WorkflowGraph};
use crate::tool::Tool;

pub use backend::Backend;

/// Lines of stderr kept in a failure reason
const STDERR_TAIL: usize = 20;

/// Final state of one task
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    Passthrough,
    /// Primary invocations failed; the declared substitute succeeded
    Degraded { reason: String, substitute: String },
    Failed { reason: String },
}

impl TaskOutcome {
    pub fn is_ok(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub outcome: TaskOutcome,
    pub outputs: BTreeMap<String, PathBuf>,
    pub duration: Duration,
}

impl TaskResult {
    pub fn new(task: &Task, outcome: TaskOutcome, duration: Duration) -> Self {
        Self {
            task_id: task.id.clone(),
            outcome,
            outputs: task.outputs.clone(),
            duration,
        }
    }
}

/// Capability interface for task execution
///
/// `execute` never returns an error: tool failures are task outcomes.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Checks run once before any task executes
    async fn preflight(&self, _graph: &WorkflowGraph) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, task: &Task) -> TaskResult;
}

/// Runs tasks through the configured [`Backend`]
#[derive(Debug, Clone)]
pub struct RunnerAdapter {
    backend: Backend,
    images: BTreeMap<String, String>,
    mounts: Vec<PathBuf>,
    env: BTreeMap<String, String>,
    mrtrix_conf: PathBuf,
    b0_thresh: u32,
}

impl RunnerAdapter {
    pub fn new(config: &ResolvedConfig, layout: &Layout) -> Self {
        let opts = &config.opts;
        let mounts = layout.mounts().iter().map(|m| absolute(m)).collect();
        let mrtrix_conf = absolute(&layout.work_root().join(".mrtrix.conf"));

        let mut env = BTreeMap::new();
        env.insert("MRTRIX_NTHREADS".to_string(), opts.threads.to_string());
        env.insert("MRTRIX_RNG_SEED".to_string(), opts.seed_number.to_string());
        env.insert(
            "MRTRIX_CONFIGFILE".to_string(),
            mrtrix_conf.display().to_string(),
        );

        Self {
            backend: Backend::from_kind(opts.runner.name),
            images: opts.runner.images.clone(),
            mounts,
            env,
            mrtrix_conf,
            b0_thresh: opts.b0_thresh,
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Concrete program and arguments for one external command
    pub fn command_line(&self, cmd: &Command, cwd: &Path) -> Result<(String, Vec<String>)> {
        let image = self.backend.resolve_image(cmd.tool, &self.images)?;
        Ok(self
            .backend
            .command_line(cmd, image.as_deref(), cwd, &self.mounts, &self.env))
    }

    fn write_mrtrix_conf(&self) -> Result<()> {
        if let Some(parent) = self.mrtrix_conf.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.mrtrix_conf, format!("BZeroThreshold: {}\n", self.b0_thresh))?;
        Ok(())
    }

    async fn spawn(&self, task: &Task, cmd: &Command) -> Result<()> {
        let (program, args) = self.command_line(cmd, &task.work_dir)?;
        debug!(task = %task.id, program = %program, args = ?args, "spawning");

        let mut process = tokio::process::Command::new(&program);
        process
            .args(&args)
            .current_dir(&task.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if self.backend.is_local() {
            process.envs(&self.env);
        }

        let output = process.output().await.map_err(|e| DwiprocError::Spawn {
            program: program.clone(),
            details: e.to_string(),
        })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(DwiprocError::ToolFailed {
            task_id: task.id.to_string(),
            reason: format!("{} exited with {}\n{}", cmd.program, output.status, tail(&stderr, STDERR_TAIL)),
        })
    }

    async fn run_all(&self, task: &Task, invocations: &[Invocation]) -> Result<()> {
        for invocation in invocations {
            match invocation {
                Invocation::Exec(cmd) => self.spawn(task, cmd).await?,
                Invocation::Builtin(op) => {
                    debug!(task = %task.id, op = %op, "builtin");
                    let op = op.clone();
                    tokio::task::spawn_blocking(move || builtin::run(&op))
                        .await
                        .map_err(|e| DwiprocError::ToolFailed {
                            task_id: task.id.to_string(),
                            reason: e.to_string(),
                        })??;
                }
            }
        }
        Ok(())
    }

    fn prepare(&self, task: &Task) -> Result<()> {
        fs::create_dir_all(&task.work_dir)?;
        for path in task.outputs.values() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskRunner for RunnerAdapter {
    fn name(&self) -> &str {
        self.backend.name()
    }

    /// Resolve every image the graph needs and check the engine responds
    async fn preflight(&self, graph: &WorkflowGraph) -> Result<()> {
        let tools: Vec<Tool> = graph
            .tasks()
            .iter()
            .flat_map(|task| task.tools())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        for tool in &tools {
            let image = self.backend.resolve_image(*tool, &self.images)?;
            debug!(tool = %tool, image = ?image, "resolved tool");
        }
        if !tools.is_empty() {
            // the probe waits on a child process
            let backend = self.backend.clone();
            tokio::task::spawn_blocking(move || backend.probe())
                .await
                .map_err(|e| DwiprocError::Spawn {
                    program: self.backend.name().to_string(),
                    details: e.to_string(),
                })??;
        }
        self.write_mrtrix_conf()
    }

    #[instrument(skip_all, fields(task = %task.id))]
    async fn execute(&self, task: &Task) -> TaskResult {
        let start = Instant::now();
        if task.is_passthrough() {
            return TaskResult::new(task, TaskOutcome::Passthrough, start.elapsed());
        }
        if let Err(e) = self.prepare(task) {
            let outcome = TaskOutcome::Failed { reason: e.to_string() };
            return TaskResult::new(task, outcome, start.elapsed());
        }

        let outcome = match &task.action {
            TaskAction::Passthrough => TaskOutcome::Passthrough,
            TaskAction::Run(invocations) => match self.run_all(task, invocations).await {
                Ok(()) => TaskOutcome::Success,
                Err(e) => TaskOutcome::Failed { reason: e.to_string() },
            },
            TaskAction::RunWithFallback { primary, fallback } => {
                match self.run_all(task, primary).await {
                    Ok(()) => TaskOutcome::Success,
                    Err(primary_err) => {
                        warn!(task = %task.id, error = %primary_err, "{}", fallback.reason);
                        match self.run_all(task, &fallback.invocations).await {
                            Ok(()) => TaskOutcome::Degraded {
                                reason: fallback.reason.clone(),
                                substitute: fallback.substitute.clone(),
                            },
                            Err(e) => TaskOutcome::Failed {
                                reason: format!("{primary_err}; fallback failed: {e}"),
                            },
                        }
                    }
                }
            }
        };

        let outcome = match outcome {
            TaskOutcome::Success | TaskOutcome::Degraded { .. } => match missing_output(task) {
                Some(path) => TaskOutcome::Failed {
                    reason: format!("declared output '{}' was not produced", path.display()),
                },
                None => outcome,
            },
            other => other,
        };
        if outcome.is_ok() {
            info!(task = %task.id, elapsed = ?start.elapsed(), "task finished");
        }
        TaskResult::new(task, outcome, start.elapsed())
    }
}

fn missing_output(task: &Task) -> Option<&Path> {
    task.outputs
        .values()
        .map(PathBuf::as_path)
        .find(|path| !path.exists())
}

/// Last `n` lines of captured output
fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
