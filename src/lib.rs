//! nhp-dwiproc - diffusion MRI processing for non-human primate BIDS datasets
//!
//! Pipeline per invocation:
//! config layers → [`ConfigResolver`] → [`EntityIndex`] + queries →
//! [`StagePlanner`] → [`WorkflowGraph`] → [`Orchestrator`] → [`TaskRunner`]

pub mod cli;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod event_log;
pub mod index;
pub mod orchestrator;
pub mod plan;
pub mod query;
pub mod runner;
pub mod tool;

pub use config::{ConfigResolver, Overrides, ResolvedConfig, Stage};
pub use error::{DwiprocError, FixSuggestion, Result};
pub use event_log::{Event, EventKind, EventLog};
pub use index::{EntityIndex, EntityRecord};
pub use orchestrator::{Orchestrator, StageReport, UnitOutcome};
pub use plan::{Plan, StagePlanner, Task, WorkflowGraph};
pub use query::{ProcessingUnit, Query};
pub use runner::{RunnerAdapter, TaskOutcome, TaskResult, TaskRunner};
pub use tool::Tool;
