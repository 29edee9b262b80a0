//! Stage planning: selected units -> tasks -> WorkflowGraph
//!
//! A [`Task`] is one step of one unit's chain (or the single aggregate task of
//! the `index` stage). Tasks carry everything the runner needs: the tool
//! identity, concrete invocations and declared inputs/outputs. Dependency
//! edges are never declared directly; they follow from inputs whose
//! [`InputSource`] is another task.

pub mod graph;
pub mod layout;
pub mod metadata;

mod connectivity;
mod index;
mod preprocess;
mod reconstruction;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_yaml::Value;
use tracing::{debug, info, warn};

use crate::config::{ResolvedConfig, Stage};
use crate::error::{DwiprocError, Result};
use crate::index::{EntityIndex, EntityRecord};
use crate::query::{InputRequest, ProcessingUnit, Query, QueryEngine, Selection, SelectionIssue, UnitSelection};
use crate::tool::Tool;

pub use graph::WorkflowGraph;
pub use layout::Layout;

pub type TaskId = Arc<str>;

/// Fixed per-stage step names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Index,
    Denoise,
    Unring,
    Undistort,
    Biascorrect,
    Register,
    Finalize,
    Tensor,
    Fod,
    Tractography,
    Connectome,
    ExtractTract,
    SurfaceMap,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Denoise => "denoise",
            Self::Unring => "unring",
            Self::Undistort => "undistort",
            Self::Biascorrect => "biascorrect",
            Self::Register => "register",
            Self::Finalize => "finalize",
            Self::Tensor => "tensor",
            Self::Fod => "fod",
            Self::Tractography => "tractography",
            Self::Connectome => "connectome",
            Self::ExtractTract => "extract_tract",
            Self::SurfaceMap => "surface_map",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════
// Invocations
// ═══════════════════════════════════════════════════════════════

/// External command line (program + arguments) for one tool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub tool: Tool,
    pub program: String,
    pub args: Vec<String>,
}

impl Command {
    pub fn new(tool: Tool, program: impl Into<String>) -> Self {
        Self {
            tool,
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy())
    }

    pub fn paths<'a>(mut self, paths: impl IntoIterator<Item = &'a PathBuf>) -> Self {
        self.args
            .extend(paths.into_iter().map(|p| p.to_string_lossy().into_owned()));
        self
    }

    /// `flag value`
    pub fn opt(self, flag: &str, value: impl ToString) -> Self {
        self.arg(flag).arg(value.to_string())
    }

    pub fn opt_path(self, flag: &str, path: &Path) -> Self {
        self.arg(flag).path(path)
    }

    pub fn opt_some<T: ToString>(self, flag: &str, value: Option<T>) -> Self {
        match value {
            Some(value) => self.opt(flag, value),
            None => self,
        }
    }

    /// `--flag=value` (FSL style)
    pub fn set(self, flag: &str, value: impl fmt::Display) -> Self {
        self.arg(format!("{flag}={value}"))
    }

    pub fn flag_if(self, enabled: bool, flag: &str) -> Self {
        if enabled {
            self.arg(flag)
        } else {
            self
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// One gradient table of a multi-series concatenation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradientSeries {
    pub bval: PathBuf,
    pub bvec: PathBuf,
    /// Value written to the eddy index file for every volume of the series
    pub index: usize,
}

/// In-process operations
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Builtin {
    BuildIndex {
        root: PathBuf,
        index_path: PathBuf,
        overwrite: bool,
    },
    WriteText {
        path: PathBuf,
        contents: String,
    },
    Copy {
        from: PathBuf,
        to: PathBuf,
    },
    /// Horizontally concatenate bval/bvec tables, optionally writing the
    /// per-volume series index
    ConcatGradients {
        series: Vec<GradientSeries>,
        out_bval: PathBuf,
        out_bvec: PathBuf,
        out_index: Option<PathBuf>,
    },
    /// Apply the rotation block of a 4x4 affine to a bvec table
    RotateBvecs {
        bvec: PathBuf,
        matrix: PathBuf,
        out: PathBuf,
    },
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BuildIndex { root, index_path, overwrite } => write!(
                f,
                "build-index {} -> {}{}",
                root.display(),
                index_path.display(),
                if *overwrite { " (overwrite)" } else { "" }
            ),
            Self::WriteText { path, .. } => write!(f, "write {}", path.display()),
            Self::Copy { from, to } => write!(f, "copy {} -> {}", from.display(), to.display()),
            Self::ConcatGradients { series, out_bval, .. } => {
                write!(f, "concat-gradients ({} series) -> {}", series.len(), out_bval.display())
            }
            Self::RotateBvecs { bvec, out, .. } => {
                write!(f, "rotate-bvecs {} -> {}", bvec.display(), out.display())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Invocation {
    Exec(Command),
    Builtin(Builtin),
}

impl Invocation {
    pub fn tool(&self) -> Tool {
        match self {
            Self::Exec(cmd) => cmd.tool,
            Self::Builtin(_) => Tool::Builtin,
        }
    }
}

impl From<Command> for Invocation {
    fn from(cmd: Command) -> Self {
        Self::Exec(cmd)
    }
}

impl From<Builtin> for Invocation {
    fn from(op: Builtin) -> Self {
        Self::Builtin(op)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exec(cmd) => write!(f, "[{}] {cmd}", cmd.tool),
            Self::Builtin(op) => write!(f, "[builtin] {op}"),
        }
    }
}

/// Documented substitute run when the primary invocations fail
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fallback {
    pub reason: String,
    pub substitute: String,
    pub invocations: Vec<Invocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    /// Skipped step; outputs alias inputs
    Passthrough,
    Run(Vec<Invocation>),
    RunWithFallback {
        primary: Vec<Invocation>,
        fallback: Fallback,
    },
}

impl TaskAction {
    /// Every invocation the action may run, fallback included
    pub fn invocations(&self) -> Vec<&Invocation> {
        match self {
            Self::Passthrough => Vec::new(),
            Self::Run(invocations) => invocations.iter().collect(),
            Self::RunWithFallback { primary, fallback } => {
                primary.iter().chain(fallback.invocations.iter()).collect()
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Tasks
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputSource {
    Dataset,
    Task { id: TaskId },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInput {
    pub path: PathBuf,
    pub source: InputSource,
}

impl TaskInput {
    pub fn dataset(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            source: InputSource::Dataset,
        }
    }

    pub fn from_task(path: impl Into<PathBuf>, id: TaskId) -> Self {
        Self {
            path: path.into(),
            source: InputSource::Task { id },
        }
    }
}

/// Immutable unit of planned work
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: TaskId,
    /// `None` for aggregate tasks
    pub unit: Option<ProcessingUnit>,
    pub step: Step,
    pub tool: Tool,
    pub inputs: BTreeMap<String, TaskInput>,
    pub outputs: BTreeMap<String, PathBuf>,
    pub action: TaskAction,
    pub work_dir: PathBuf,
    /// Settings slice the task was planned from
    pub settings: Value,
}

impl Task {
    /// Id defaults to `<unit prefix>/<step>` (or `<step>` for aggregates)
    pub fn new(
        unit: Option<ProcessingUnit>,
        step: Step,
        tool: Tool,
        action: TaskAction,
        work_dir: PathBuf,
    ) -> Self {
        let id: TaskId = match &unit {
            Some(unit) => Arc::from(format!("{}/{}", unit.prefix(), step.as_str())),
            None => Arc::from(step.as_str()),
        };
        Self {
            id,
            unit,
            step,
            tool,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            action,
            work_dir,
            settings: Value::Null,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Arc::from(id);
        self
    }

    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self.action, TaskAction::Passthrough)
    }

    /// Upstream task ids referenced by inputs
    pub fn upstream(&self) -> BTreeSet<&str> {
        self.inputs
            .values()
            .filter_map(|input| match &input.source {
                InputSource::Task { id } => Some(id.as_ref()),
                InputSource::Dataset => None,
            })
            .collect()
    }

    /// External tools the task may dispatch
    pub fn tools(&self) -> BTreeSet<Tool> {
        self.action
            .invocations()
            .into_iter()
            .map(Invocation::tool)
            .filter(Tool::is_external)
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════
// Chain building
// ═══════════════════════════════════════════════════════════════

/// Linear per-unit chain: tracks which task currently provides each named file
pub(crate) struct ChainBuilder<'a> {
    layout: &'a Layout,
    unit: ProcessingUnit,
    tasks: Vec<Task>,
    current: BTreeMap<String, TaskInput>,
}

impl<'a> ChainBuilder<'a> {
    fn new(layout: &'a Layout, unit: ProcessingUnit) -> Self {
        Self {
            layout,
            unit,
            tasks: Vec::new(),
            current: BTreeMap::new(),
        }
    }

    /// Register a dataset file as the initial provider of `name`
    pub(crate) fn seed(&mut self, name: impl Into<String>, path: PathBuf) {
        self.current.insert(name.into(), TaskInput::dataset(path));
    }

    pub(crate) fn current(&self, name: &str) -> Option<&Path> {
        self.current.get(name).map(|input| input.path.as_path())
    }

    /// Current path of a name that the planner seeded or produced
    pub(crate) fn require(&self, name: &str) -> Result<PathBuf> {
        self.current(name)
            .map(Path::to_path_buf)
            .ok_or_else(|| DwiprocError::Planning {
                unit: self.unit.to_string(),
                reason: format!("no provider for '{name}'"),
            })
    }

    pub(crate) fn work_dir(&self, step: Step) -> PathBuf {
        self.layout.work_dir(Some(&self.unit), step)
    }

    pub(crate) fn scratch(&self, step: Step, entities: &str, suffix_ext: &str) -> PathBuf {
        self.layout.scratch(&self.unit, step, entities, suffix_ext)
    }

    pub(crate) fn output(&self, datatype: &str, entities: &str, suffix_ext: &str) -> PathBuf {
        self.layout.output(&self.unit, datatype, entities, suffix_ext)
    }

    fn inputs<S: AsRef<str>>(&self, names: &[S]) -> BTreeMap<String, TaskInput> {
        names
            .iter()
            .filter_map(|name| {
                let name = name.as_ref();
                self.current.get(name).map(|input| (name.to_string(), input.clone()))
            })
            .collect()
    }

    /// Append a task consuming `consumes` and providing `produces`
    pub(crate) fn run<S: AsRef<str>>(
        &mut self,
        step: Step,
        tool: Tool,
        consumes: &[S],
        produces: Vec<(String, PathBuf)>,
        action: TaskAction,
        settings: Value,
    ) -> TaskId {
        let mut task = Task::new(Some(self.unit.clone()), step, tool, action, self.work_dir(step))
            .with_settings(settings);
        task.inputs = self.inputs(consumes);
        for (name, path) in produces {
            self.current
                .insert(name.clone(), TaskInput::from_task(path.clone(), Arc::clone(&task.id)));
            task.outputs.insert(name, path);
        }
        let id = Arc::clone(&task.id);
        self.tasks.push(task);
        id
    }

    /// Append a skipped step: outputs alias inputs and the edge is kept
    pub(crate) fn passthrough<S: AsRef<str>>(&mut self, step: Step, carries: &[S], settings: Value) -> TaskId {
        let produces = self
            .inputs(carries)
            .into_iter()
            .map(|(name, input)| (name, input.path))
            .collect();
        debug!(unit = %self.unit, step = %step, "step skipped");
        self.run(step, Tool::Builtin, carries, produces, TaskAction::Passthrough, settings)
    }

    pub(crate) fn finish(self) -> Vec<Task> {
        self.tasks
    }
}

/// Per-unit planning inputs shared by the stage planners
pub(crate) struct UnitContext<'a> {
    pub config: &'a ResolvedConfig,
    pub index: &'a EntityIndex,
    pub layout: &'a Layout,
    pub selection: &'a UnitSelection,
}

impl<'a> UnitContext<'a> {
    pub(crate) fn unit(&self) -> &ProcessingUnit {
        &self.selection.unit
    }

    pub(crate) fn path(&self, record: &EntityRecord) -> PathBuf {
        self.index.resolve(record)
    }

    pub(crate) fn record(&self, name: &str) -> Result<&'a EntityRecord> {
        self.selection.one(name).ok_or_else(|| self.error(format!("'{name}' was not selected")))
    }

    pub(crate) fn companion(&self, name: &str, ext: &str, pos: usize) -> Result<PathBuf> {
        self.selection
            .companion(name, ext, pos)
            .map(|record| self.path(record))
            .ok_or_else(|| self.error(format!("'{name}' has no {ext} companion")))
    }

    pub(crate) fn chain(&self) -> ChainBuilder<'a> {
        ChainBuilder::new(self.layout, self.unit().clone())
    }

    pub(crate) fn error(&self, reason: impl Into<String>) -> DwiprocError {
        DwiprocError::Planning {
            unit: self.unit().to_string(),
            reason: reason.into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Stage planner
// ═══════════════════════════════════════════════════════════════

/// Primary DWI series shared by every per-unit stage
pub(crate) const DWI_QUERY: &str = "suffix = 'dwi' AND ext IN ('.nii', '.nii.gz')";

/// A unit that was selected but could not be planned
#[derive(Debug, Clone, PartialEq)]
pub struct PlanningFailure {
    pub unit: ProcessingUnit,
    pub reason: String,
}

/// Planned stage: graph plus the units left out of it
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub stage: Stage,
    pub graph: WorkflowGraph,
    pub issues: Vec<SelectionIssue>,
    pub failures: Vec<PlanningFailure>,
}

impl Plan {
    /// Units present in the graph
    pub fn units(&self) -> Vec<ProcessingUnit> {
        self.graph
            .unit_chains()
            .into_keys()
            .flatten()
            .collect()
    }

    pub fn has_ambiguity(&self) -> bool {
        self.issues.iter().any(SelectionIssue::is_ambiguity)
    }
}

/// Builds the WorkflowGraph for the active stage
///
/// Planning only reads the resolved configuration and the index, so the same
/// inputs always yield the same graph regardless of the runner backend.
pub struct StagePlanner<'a> {
    config: &'a ResolvedConfig,
    index: &'a EntityIndex,
    layout: Layout,
}

impl<'a> StagePlanner<'a> {
    pub fn new(config: &'a ResolvedConfig, index: &'a EntityIndex) -> Self {
        Self {
            config,
            index,
            layout: Layout::from_config(config),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn participant(&self) -> Result<Option<Query>> {
        self.config
            .query()
            .and_then(|q| q.participant.as_deref())
            .map(Query::parse)
            .transpose()
    }

    /// Primary and secondary input requests of the active stage
    pub fn requests(&self) -> Result<(InputRequest, Vec<InputRequest>)> {
        match self.config.stage {
            Stage::Index => Err(DwiprocError::ConfigInvalid {
                path: "index".to_string(),
                reason: "the index stage selects no inputs".to_string(),
            }),
            Stage::Preprocess => preprocess::requests(self.config),
            Stage::Reconstruction => reconstruction::requests(self.config),
            Stage::Connectivity => connectivity::requests(self.config),
        }
    }

    /// Run the stage queries over the index
    pub fn select(&self) -> Result<Selection> {
        let (primary, secondary) = self.requests()?;
        let engine = QueryEngine::new(self.index).with_participant(self.participant()?);
        Ok(engine.select(&primary, &secondary))
    }

    /// Select inputs and plan every unit
    pub fn plan(&self) -> Result<Plan> {
        if self.config.stage == Stage::Index {
            let task = index::plan(self.config, &self.layout);
            return Ok(Plan {
                stage: Stage::Index,
                graph: WorkflowGraph::from_tasks(vec![task])?,
                issues: Vec::new(),
                failures: Vec::new(),
            });
        }
        let selection = self.select()?;
        self.plan_selection(selection)
    }

    /// Plan already-selected units; a unit that fails planning is recorded
    /// and left out without affecting its siblings
    pub fn plan_selection(&self, selection: Selection) -> Result<Plan> {
        let mut tasks = Vec::new();
        let mut failures = Vec::new();

        for chosen in &selection.units {
            let ctx = UnitContext {
                config: self.config,
                index: self.index,
                layout: &self.layout,
                selection: chosen,
            };
            let planned = match self.config.stage {
                Stage::Preprocess => preprocess::plan_unit(&ctx),
                Stage::Reconstruction => reconstruction::plan_unit(&ctx),
                Stage::Connectivity => connectivity::plan_unit(&ctx),
                Stage::Index => Ok(Vec::new()),
            };
            match planned {
                Ok(unit_tasks) => {
                    debug!(unit = %chosen.unit, tasks = unit_tasks.len(), "planned unit");
                    tasks.extend(unit_tasks);
                }
                Err(e) => {
                    warn!(unit = %chosen.unit, error = %e, "Unable to plan unit");
                    failures.push(PlanningFailure {
                        unit: chosen.unit.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let graph = WorkflowGraph::from_tasks(tasks)?;
        info!(
            stage = %self.config.stage,
            units = selection.units.len() - failures.len(),
            tasks = graph.len(),
            "Planned workflow"
        );
        Ok(Plan {
            stage: self.config.stage,
            graph,
            issues: selection.issues,
            failures,
        })
    }
}

/// Names `<base>.0 .. <base>.<n-1>`
pub(crate) fn series_names(base: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{base}.{i}")).collect()
}
