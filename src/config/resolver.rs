//! Layered configuration resolution
//!
//! Priority (highest first):
//! 1. Command-line overrides (dotted paths)
//! 2. Configuration file (YAML)
//! 3. Compiled defaults ([`ConfigDocument::default`])
//!
//! Merging is key-wise: a nested section in a higher layer only replaces the
//! keys it sets. Sequences and scalars are replaced whole.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use tracing::debug;

use super::schema::{ConfigDocument, ConnectivityConfig, PreprocessConfig, QueryConfig};
use super::{ResolvedConfig, Stage, StageSettings};
use crate::error::{DwiprocError, Result};
use crate::query::Query;

/// Mappings whose keys are user-defined and not checked against the schema
const FREE_FORM: &[&str] = &["opts.runner.images"];

/// Closed sets for enumerated options, checked after merging
const CHOICES: &[(&str, &[&str])] = &[
    (
        "opts.runner.name",
        &["local", "docker", "podman", "singularity", "apptainer"],
    ),
    ("preprocess.denoise.estimator", &["Exp1", "Exp2"]),
    (
        "preprocess.undistort.method",
        &["topup", "fieldmap", "eddymotion", "fugue"],
    ),
    ("preprocess.undistort.eddy.slm", &["none", "linear", "quadratic"]),
    ("preprocess.registration.metric", &["SSD", "MI", "NMI", "MAHAL"]),
    ("preprocess.registration.init", &["identity", "image-centers"]),
    ("reconstruction.tractography.method", &["wm", "act"]),
];

const PE_DIRECTIONS: &[&str] = &["i", "i-", "j", "j-", "k", "k-"];
const TOPUP_CONFIGS: &[&str] = &["b02b0", "b02b0_macaque", "b02b0_marmoset"];

/// Command-line overrides as (dotted path, value) pairs
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    entries: Vec<(String, Value)>,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, path: impl Into<String>, value: impl Into<Value>) {
        self.entries.push((path.into(), value.into()));
    }

    pub fn set_opt<T: Into<Value>>(&mut self, path: &str, value: Option<T>) {
        if let Some(value) = value {
            self.set(path, value);
        }
    }

    /// Boolean flags only override when present on the command line
    pub fn flag(&mut self, path: &str, enabled: bool) {
        if enabled {
            self.set(path, true);
        }
    }

    /// Parse a `path.to.key=<yaml>` assignment (from `--set`)
    pub fn assign(&mut self, text: &str) -> Result<()> {
        let Some((path, raw)) = text.split_once('=') else {
            return Err(DwiprocError::ConfigInvalid {
                path: text.to_string(),
                reason: "expected <path>=<value>".to_string(),
            });
        };
        let path = path.trim();
        if path.is_empty() {
            return Err(DwiprocError::ConfigInvalid {
                path: text.to_string(),
                reason: "empty option path".to_string(),
            });
        }
        let value = if raw.trim().is_empty() {
            Value::Null
        } else {
            serde_yaml::from_str(raw).map_err(|e| DwiprocError::ConfigParse {
                path: path.to_string(),
                details: e.to_string(),
            })?
        };
        self.set(path, value);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build a nested tree from the dotted paths (later entries win)
    pub fn to_tree(&self) -> Value {
        let mut tree = Value::Mapping(Mapping::new());
        for (path, value) in &self.entries {
            set_path(&mut tree, path, value.clone());
        }
        tree
    }
}

/// Merges defaults, an optional file layer and CLI overrides
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    file: Option<(String, Value)>,
    cli: Overrides,
}

impl ConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the file layer; only `.yaml` / `.yml` files are accepted
    pub fn with_file(self, path: &Path) -> Result<Self> {
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));
        if !is_yaml {
            return Err(DwiprocError::ConfigExtension {
                path: path.to_path_buf(),
            });
        }
        let text = fs::read_to_string(path).map_err(|e| DwiprocError::ConfigParse {
            path: path.display().to_string(),
            details: e.to_string(),
        })?;
        self.with_file_str(&text, &path.display().to_string())
    }

    /// Use `text` as the file layer; `origin` names it in errors
    pub fn with_file_str(mut self, text: &str, origin: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(text).map_err(|e| DwiprocError::ConfigParse {
            path: origin.to_string(),
            details: e.to_string(),
        })?;
        let value = match value {
            Value::Null => Value::Mapping(Mapping::new()),
            Value::Mapping(_) => value,
            _ => {
                return Err(DwiprocError::ConfigParse {
                    path: origin.to_string(),
                    details: "top level must be a mapping".to_string(),
                })
            }
        };
        self.file = Some((origin.to_string(), value));
        Ok(self)
    }

    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        self.cli = overrides;
        self
    }

    /// Produce the stage-scoped configuration
    pub fn resolve(
        &self,
        stage: Stage,
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Result<ResolvedConfig> {
        let mut tree = serde_yaml::to_value(ConfigDocument::default())?;
        let Value::Mapping(schema) = tree.clone() else {
            return Err(DwiprocError::ConfigInvalid {
                path: "<root>".to_string(),
                reason: "defaults must serialize to a mapping".to_string(),
            });
        };

        if let Some((origin, file)) = &self.file {
            let mut layer = file.clone();
            if let Value::Mapping(map) = &mut layer {
                check_layer(&schema, map, "")?;
            }
            debug!(origin = %origin, "merging configuration file");
            deep_merge(&mut tree, layer);
        }

        if !self.cli.is_empty() {
            let mut layer = self.cli.to_tree();
            if let Value::Mapping(map) = &mut layer {
                check_layer(&schema, map, "")?;
            }
            deep_merge(&mut tree, layer);
        }

        check_choices(&tree)?;

        let opts = section(&tree, "opts")?;
        let settings = match stage {
            Stage::Index => StageSettings::Index(section(&tree, "index")?),
            Stage::Preprocess => {
                let cfg: PreprocessConfig = section(&tree, "preprocess")?;
                validate_preprocess(&cfg)?;
                StageSettings::Preprocess(cfg)
            }
            Stage::Reconstruction => {
                StageSettings::Reconstruction(section(&tree, "reconstruction")?)
            }
            Stage::Connectivity => {
                let cfg: ConnectivityConfig = section(&tree, "connectivity")?;
                validate_connectivity(&cfg)?;
                StageSettings::Connectivity(cfg)
            }
        };
        if let Some(query) = settings.query() {
            validate_queries(stage, query)?;
        }

        let mut scoped = Mapping::new();
        for key in ["opts", stage.key()] {
            if let Some(value) = tree.get(key) {
                scoped.insert(Value::from(key), value.clone());
            }
        }

        let resolved = ResolvedConfig {
            stage,
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            opts,
            settings,
            tree: Value::Mapping(scoped),
        };
        if resolved.opts.threads == 0 {
            return Err(DwiprocError::ConfigInvalid {
                path: "opts.threads".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(resolved)
    }
}

// ═══════════════════════════════════════════════════════════════
// Tree helpers
// ═══════════════════════════════════════════════════════════════

/// Key-wise merge of `over` into `base`
pub fn deep_merge(base: &mut Value, over: Value) {
    match (base, over) {
        (Value::Mapping(base_map), Value::Mapping(over_map)) => {
            for (key, value) in over_map {
                match base_map.get_mut(&key) {
                    Some(existing) if existing.is_mapping() && value.is_mapping() => {
                        deep_merge(existing, value)
                    }
                    _ => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, over) => *base = over,
    }
}

/// Look up a dotted path
pub fn lookup<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(tree, |node, key| node.get(key))
}

/// Set a dotted path, creating intermediate mappings
pub fn set_path(tree: &mut Value, path: &str, value: Value) {
    let mut node = tree;
    let mut keys = path.split('.').peekable();
    while let Some(key) = keys.next() {
        if !node.is_mapping() {
            *node = Value::Mapping(Mapping::new());
        }
        let Value::Mapping(map) = node else { return };
        if keys.peek().is_none() {
            map.insert(Value::from(key), value);
            return;
        }
        node = map
            .entry(Value::from(key))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Reject keys absent from the schema; empty sections keep their defaults
fn check_layer(schema: &Mapping, layer: &mut Mapping, prefix: &str) -> Result<()> {
    let mut empty_sections = Vec::new();
    for (key, value) in layer.iter_mut() {
        let Some(name) = key.as_str() else {
            return Err(DwiprocError::ConfigInvalid {
                path: if prefix.is_empty() { "<root>".to_string() } else { prefix.to_string() },
                reason: format!("option names must be strings, got {key:?}"),
            });
        };
        let path = join(prefix, name);
        if FREE_FORM.contains(&path.as_str()) {
            if !(value.is_mapping() || value.is_null()) {
                return Err(DwiprocError::ConfigInvalid {
                    path,
                    reason: "expected a mapping".to_string(),
                });
            }
            continue;
        }
        match schema.get(name) {
            None => return Err(DwiprocError::ConfigUnknownKey { path }),
            Some(Value::Mapping(section)) => match value {
                Value::Mapping(inner) => check_layer(section, inner, &path)?,
                Value::Null => empty_sections.push(key.clone()),
                _ => {
                    return Err(DwiprocError::ConfigInvalid {
                        path,
                        reason: "expected a section".to_string(),
                    })
                }
            },
            Some(_) => {}
        }
    }
    for key in empty_sections {
        layer.remove(&key);
    }
    Ok(())
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

fn check_choices(tree: &Value) -> Result<()> {
    for (path, choices) in CHOICES {
        let Some(value) = lookup(tree, path) else { continue };
        if value.is_null() {
            continue;
        }
        let text = scalar_text(value);
        if !choices.contains(&text.as_str()) {
            return Err(DwiprocError::ConfigInvalidChoice {
                path: path.to_string(),
                value: text,
                choices: choices.join(", "),
            });
        }
    }
    Ok(())
}

fn section<T: DeserializeOwned>(tree: &Value, name: &str) -> Result<T> {
    let value = tree.get(name).cloned().unwrap_or(Value::Null);
    serde_yaml::from_value(value).map_err(|e| DwiprocError::ConfigInvalid {
        path: name.to_string(),
        reason: e.to_string(),
    })
}

// ═══════════════════════════════════════════════════════════════
// Semantic validation
// ═══════════════════════════════════════════════════════════════

fn validate_preprocess(cfg: &PreprocessConfig) -> Result<()> {
    if let Some(pe_dirs) = &cfg.metadata.pe_dirs {
        if pe_dirs.len() > 2 {
            return Err(DwiprocError::ConfigInvalid {
                path: "preprocess.metadata.pe_dirs".to_string(),
                reason: format!("at most 2 directions allowed, got {}", pe_dirs.len()),
            });
        }
        if let Some(bad) = pe_dirs.iter().find(|d| !PE_DIRECTIONS.contains(&d.as_str())) {
            return Err(DwiprocError::ConfigInvalidChoice {
                path: "preprocess.metadata.pe_dirs".to_string(),
                value: bad.clone(),
                choices: PE_DIRECTIONS.join(", "),
            });
        }
    }

    let topup = &cfg.undistort.topup.config;
    if !TOPUP_CONFIGS.contains(&topup.as_str()) && !Path::new(topup).is_file() {
        return Err(DwiprocError::ConfigInvalid {
            path: "preprocess.undistort.topup.config".to_string(),
            reason: format!(
                "'{topup}' is neither one of [{}] nor an existing file",
                TOPUP_CONFIGS.join(", ")
            ),
        });
    }
    Ok(())
}

fn validate_connectivity(cfg: &ConnectivityConfig) -> Result<()> {
    match (&cfg.atlas, &cfg.tract_query) {
        (Some(_), Some(_)) => Err(DwiprocError::ConfigConflict {
            reason: "connectivity.atlas and connectivity.tract_query are mutually exclusive"
                .to_string(),
        }),
        (None, None) => Err(DwiprocError::ConfigConflict {
            reason: "one of connectivity.atlas or connectivity.tract_query is required"
                .to_string(),
        }),
        (_, Some(tract)) => {
            Query::parse(tract)?;
            if let Some(surface) = &cfg.surface_query {
                Query::parse(surface)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// All queries must compile; the participant query may only select sub/ses
fn validate_queries(stage: Stage, query: &QueryConfig) -> Result<()> {
    if let Some(text) = &query.participant {
        let compiled = Query::parse(text)?;
        if let Some(other) = compiled
            .attributes()
            .into_iter()
            .find(|attr| attr != "sub" && attr != "ses")
        {
            return Err(DwiprocError::ConfigInvalid {
                path: format!("{}.query.participant", stage.key()),
                reason: format!("only 'sub' and 'ses' may be used, found '{other}'"),
            });
        }
    }
    for text in [&query.dwi, &query.t1w, &query.mask, &query.fmap]
        .into_iter()
        .flatten()
    {
        Query::parse(text)?;
    }
    Ok(())
}
