//! Error types with fix suggestions
//!
//! Codes are grouped by the component that raises them:
//! - DWI-001..009: configuration resolution
//! - DWI-010: query compilation
//! - DWI-020..022: input selection and per-unit planning
//! - DWI-030..032: dataset index
//! - DWI-040..042: workflow graph construction
//! - DWI-050..052: runner

use std::path::PathBuf;

use thiserror::Error;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

pub type Result<T> = std::result::Result<T, DwiprocError>;

/// Process exit codes
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const CONFIGURATION: i32 = 2;
    pub const AMBIGUITY: i32 = 3;
}

#[derive(Error, Debug)]
pub enum DwiprocError {
    // ─────────────────────────────────────────────────────────────
    // Configuration errors (DWI-001 to DWI-006)
    // ─────────────────────────────────────────────────────────────
    #[error("DWI-001: Unable to parse configuration '{path}': {details}")]
    ConfigParse { path: String, details: String },

    #[error("DWI-002: Unknown configuration option '{path}'")]
    ConfigUnknownKey { path: String },

    #[error("DWI-003: Invalid value '{value}' for '{path}' (expected one of: {choices})")]
    ConfigInvalidChoice {
        path: String,
        value: String,
        choices: String,
    },

    #[error("DWI-004: Conflicting options: {reason}")]
    ConfigConflict { reason: String },

    #[error("DWI-005: Invalid value for '{path}': {reason}")]
    ConfigInvalid { path: String, reason: String },

    #[error("DWI-006: Only YAML-based configuration files are supported, got '{}'", path.display())]
    ConfigExtension { path: PathBuf },

    // ─────────────────────────────────────────────────────────────
    // Query errors (DWI-010)
    // ─────────────────────────────────────────────────────────────
    #[error("DWI-010: Invalid query '{query}' at position {position}: {details}")]
    QueryParse {
        query: String,
        position: usize,
        details: String,
    },

    // ─────────────────────────────────────────────────────────────
    // Selection errors (DWI-020 to DWI-022)
    // ─────────────────────────────────────────────────────────────
    #[error("DWI-020: Query for '{input}' matched {count} records for {unit} (expected one)")]
    SelectionAmbiguity {
        unit: String,
        input: String,
        count: usize,
    },

    #[error("DWI-021: No '{input}' record found for {unit}")]
    SelectionMissing { unit: String, input: String },

    #[error("DWI-022: Unable to plan {unit}: {reason}")]
    Planning { unit: String, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Index errors (DWI-030 to DWI-032)
    // ─────────────────────────────────────────────────────────────
    #[error("DWI-030: Unable to read index '{}': {details}", path.display())]
    IndexRead { path: PathBuf, details: String },

    #[error("DWI-031: Unable to write index '{}': {details}", path.display())]
    IndexWrite { path: PathBuf, details: String },

    #[error("DWI-032: Indexing failed: {reason}")]
    IndexFailed { reason: String },

    // ─────────────────────────────────────────────────────────────
    // Graph errors (DWI-040 to DWI-042)
    // ─────────────────────────────────────────────────────────────
    #[error("DWI-040: Cycle detected in workflow graph: {cycle}")]
    CycleDetected { cycle: String },

    #[error("DWI-041: Duplicate task '{task_id}'")]
    DuplicateTask { task_id: String },

    #[error("DWI-042: Invalid dependency {from} -> {to}: {reason}")]
    InvalidEdge {
        from: String,
        to: String,
        reason: String,
    },

    // ─────────────────────────────────────────────────────────────
    // Runner errors (DWI-050 to DWI-052)
    // ─────────────────────────────────────────────────────────────
    #[error("DWI-050: No {runner} image configured for tool '{tool}'")]
    ImageUnresolved { tool: String, runner: String },

    #[error("DWI-051: Task '{task_id}' failed: {reason}")]
    ToolFailed { task_id: String, reason: String },

    #[error("DWI-052: Unable to launch '{program}': {details}")]
    Spawn { program: String, details: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DwiprocError {
    /// Errors raised before any task runs because the invocation is invalid
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::ConfigParse { .. }
                | Self::ConfigUnknownKey { .. }
                | Self::ConfigInvalidChoice { .. }
                | Self::ConfigConflict { .. }
                | Self::ConfigInvalid { .. }
                | Self::ConfigExtension { .. }
                | Self::QueryParse { .. }
                | Self::ImageUnresolved { .. }
        )
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            e if e.is_configuration() => exit_code::CONFIGURATION,
            Self::SelectionAmbiguity { .. } => exit_code::AMBIGUITY,
            _ => exit_code::FAILURE,
        }
    }
}

impl FixSuggestion for DwiprocError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            Self::ConfigParse { .. } => Some("Check YAML syntax: indentation and quoting"),
            Self::ConfigUnknownKey { .. } => {
                Some("Remove the option or check its spelling against the documented schema")
            }
            Self::ConfigInvalidChoice { .. } => Some("Use one of the listed values"),
            Self::ConfigConflict { .. } => Some("Set only one of the conflicting options"),
            Self::ConfigInvalid { .. } => None,
            Self::ConfigExtension { .. } => Some("Rename the configuration file to .yaml or .yml"),
            Self::QueryParse { .. } => {
                Some("Use SQL-style (sub = '01' AND ses = 'A') or legacy (sub == '01' & ses == 'A') syntax")
            }
            Self::SelectionAmbiguity { .. } => {
                Some("Narrow the stage query, e.g. add a run or acq predicate")
            }
            Self::SelectionMissing { .. } => Some("Check the query and re-run the index stage"),
            Self::Planning { .. } => {
                Some("Provide the missing metadata in the JSON sidecar or via configuration")
            }
            Self::IndexRead { .. } => Some("Re-run the index stage with --overwrite"),
            Self::IndexWrite { .. } | Self::IndexFailed { .. } | Self::Io(_) => {
                Some("Check file path and permissions")
            }
            Self::CycleDetected { .. } | Self::DuplicateTask { .. } | Self::InvalidEdge { .. } => None,
            Self::ImageUnresolved { .. } => {
                Some("Map the tool to an image with --runner-images or opts.runner.images")
            }
            Self::ToolFailed { .. } => Some("Inspect the captured stderr above"),
            Self::Spawn { .. } => Some("Ensure the executable or container engine is on PATH"),
            Self::Yaml(_) => Some("Check YAML syntax: indentation and quoting"),
            Self::Json(_) => None,
        }
    }
}
