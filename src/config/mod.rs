//! Configuration: schema, layered resolution and the resolved per-stage view
//!
//! - `schema`: typed sections with compiled defaults
//! - `resolver`: defaults <- file <- CLI merging and validation

pub mod resolver;
pub mod schema;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

pub use resolver::{ConfigResolver, Overrides};
pub use schema::{
    ConfigDocument, ConnectivityConfig, GlobalOpts, IndexConfig, PreprocessConfig, QueryConfig,
    ReconstructionConfig, RunnerKind,
};

/// Pipeline stage selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Index,
    Preprocess,
    Reconstruction,
    Connectivity,
}

impl Stage {
    /// Top-level configuration key for this stage
    pub fn key(&self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Preprocess => "preprocess",
            Self::Reconstruction => "reconstruction",
            Self::Connectivity => "connectivity",
        }
    }

    /// Aggregate stages have no per-unit isolation
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Self::Index)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Typed settings for the active stage
#[derive(Debug, Clone, PartialEq)]
pub enum StageSettings {
    Index(IndexConfig),
    Preprocess(PreprocessConfig),
    Reconstruction(ReconstructionConfig),
    Connectivity(ConnectivityConfig),
}

impl StageSettings {
    pub fn query(&self) -> Option<&QueryConfig> {
        match self {
            Self::Index(_) => None,
            Self::Preprocess(cfg) => Some(&cfg.query),
            Self::Reconstruction(cfg) => Some(&cfg.query),
            Self::Connectivity(cfg) => Some(&cfg.query),
        }
    }
}

/// Immutable, stage-scoped configuration built once per invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub stage: Stage,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub opts: GlobalOpts,
    pub settings: StageSettings,
    /// Merged tree restricted to `opts` and the active stage section
    tree: Value,
}

impl ResolvedConfig {
    /// Value at a dotted path (e.g. `preprocess.denoise.skip`)
    pub fn get(&self, path: &str) -> Option<&Value> {
        resolver::lookup(&self.tree, path)
    }

    /// Owned copy of a subtree, `Null` when absent
    pub fn slice(&self, path: &str) -> Value {
        self.get(path).cloned().unwrap_or(Value::Null)
    }

    pub fn tree(&self) -> &Value {
        &self.tree
    }

    pub fn index_path(&self) -> PathBuf {
        self.opts
            .index_path
            .clone()
            .unwrap_or_else(|| self.input_dir.join(".index.json"))
    }

    pub fn query(&self) -> Option<&QueryConfig> {
        self.settings.query()
    }

    pub fn index(&self) -> Option<&IndexConfig> {
        match &self.settings {
            StageSettings::Index(cfg) => Some(cfg),
            _ => None,
        }
    }

    pub fn preprocess(&self) -> Option<&PreprocessConfig> {
        match &self.settings {
            StageSettings::Preprocess(cfg) => Some(cfg),
            _ => None,
        }
    }

    pub fn reconstruction(&self) -> Option<&ReconstructionConfig> {
        match &self.settings {
            StageSettings::Reconstruction(cfg) => Some(cfg),
            _ => None,
        }
    }

    pub fn connectivity(&self) -> Option<&ConnectivityConfig> {
        match &self.settings {
            StageSettings::Connectivity(cfg) => Some(cfg),
            _ => None,
        }
    }
}
