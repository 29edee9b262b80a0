//! EntityIndex - immutable table of dataset records
//!
//! Built by the `index` stage (see [`bids`]) and persisted as JSON; every
//! later stage loads it read-only and shares it between unit workers.

pub mod bids;

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DwiprocError, Result};

pub use bids::build_index;

const INDEX_VERSION: u32 = 1;

/// One indexed dataset file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub subject: String,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub run: Option<u32>,
    #[serde(default)]
    pub datatype: Option<String>,
    pub suffix: String,
    /// Full extension including the leading dot (`.nii.gz`)
    pub ext: String,
    /// Remaining BIDS key/value entities (`acq`, `dir`, `desc`, ...)
    #[serde(default)]
    pub entities: BTreeMap<String, String>,
    /// Path relative to the index root (or absolute)
    pub path: PathBuf,
    /// JSON sidecar content
    #[serde(default)]
    pub metadata: BTreeMap<String, JsonValue>,
}

impl EntityRecord {
    pub fn new(
        subject: impl Into<String>,
        suffix: impl Into<String>,
        ext: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            subject: subject.into(),
            session: None,
            run: None,
            datatype: None,
            suffix: suffix.into(),
            ext: ext.into(),
            entities: BTreeMap::new(),
            path: path.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_run(mut self, run: u32) -> Self {
        self.run = Some(run);
        self
    }

    pub fn with_datatype(mut self, datatype: impl Into<String>) -> Self {
        self.datatype = Some(datatype.into());
        self
    }

    pub fn with_entity(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entities.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn entity(&self, key: &str) -> Option<&str> {
        self.entities.get(key).map(String::as_str)
    }

    /// Attribute lookup used by query evaluation (canonical names)
    pub fn attr(&self, name: &str) -> Option<Cow<'_, str>> {
        match name {
            "sub" => Some(Cow::Borrowed(&self.subject)),
            "ses" => self.session.as_deref().map(Cow::Borrowed),
            "run" => self.run.map(|r| Cow::Owned(r.to_string())),
            "datatype" => self.datatype.as_deref().map(Cow::Borrowed),
            "suffix" => Some(Cow::Borrowed(&self.suffix)),
            "ext" => Some(Cow::Borrowed(&self.ext)),
            "path" => Some(self.path.to_string_lossy()),
            other => self
                .entities
                .get(other)
                .map(|v| Cow::Borrowed(v.as_str()))
                .or_else(|| self.metadata.get(other).and_then(json_text)),
        }
    }

    /// Path without its extension, shared by companion files
    pub fn stem_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = name.split('.').next().unwrap_or_default();
        self.path.with_file_name(stem)
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(JsonValue::as_str)
    }

    pub fn metadata_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(JsonValue::as_f64)
    }
}

fn json_text(value: &JsonValue) -> Option<Cow<'_, str>> {
    match value {
        JsonValue::String(s) => Some(Cow::Borrowed(s)),
        JsonValue::Number(n) => Some(Cow::Owned(n.to_string())),
        JsonValue::Bool(b) => Some(Cow::Owned(b.to_string())),
        JsonValue::Null => None,
        other => Some(Cow::Owned(other.to_string())),
    }
}

#[derive(Serialize, Deserialize)]
struct IndexArtifact {
    version: u32,
    root: PathBuf,
    records: Vec<EntityRecord>,
}

/// Read-only dataset index
#[derive(Debug, Clone, Default)]
pub struct EntityIndex {
    root: PathBuf,
    records: Vec<EntityRecord>,
    /// stem path -> record positions (companion lookup)
    by_stem: HashMap<PathBuf, Vec<usize>>,
}

impl EntityIndex {
    pub fn new(root: impl Into<PathBuf>, mut records: Vec<EntityRecord>) -> Self {
        records.sort_by(|a, b| a.path.cmp(&b.path));
        let mut by_stem: HashMap<PathBuf, Vec<usize>> = HashMap::new();
        for (pos, record) in records.iter().enumerate() {
            by_stem.entry(record.stem_path()).or_default().push(pos);
        }
        Self {
            root: root.into(),
            records,
            by_stem,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn records(&self) -> &[EntityRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Absolute location of a record's file
    pub fn resolve(&self, record: &EntityRecord) -> PathBuf {
        if record.path.is_absolute() {
            record.path.clone()
        } else {
            self.root.join(&record.path)
        }
    }

    /// Sibling record sharing `record`'s stem with extension `ext`
    pub fn companion(&self, record: &EntityRecord, ext: &str) -> Option<&EntityRecord> {
        self.by_stem
            .get(&record.stem_path())?
            .iter()
            .map(|&pos| &self.records[pos])
            .find(|r| r.ext == ext)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| DwiprocError::IndexRead {
            path: path.to_path_buf(),
            details: e.to_string(),
        })?;
        let artifact: IndexArtifact =
            serde_json::from_str(&text).map_err(|e| DwiprocError::IndexRead {
                path: path.to_path_buf(),
                details: e.to_string(),
            })?;
        if artifact.version != INDEX_VERSION {
            return Err(DwiprocError::IndexRead {
                path: path.to_path_buf(),
                details: format!(
                    "unsupported index version {} (expected {INDEX_VERSION})",
                    artifact.version
                ),
            });
        }
        Ok(Self::new(artifact.root, artifact.records))
    }

    /// Persist atomically (temp file + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let write_err = |e: &dyn std::fmt::Display| DwiprocError::IndexWrite {
            path: path.to_path_buf(),
            details: e.to_string(),
        };
        let artifact = IndexArtifact {
            version: INDEX_VERSION,
            root: self.root.clone(),
            records: self.records.clone(),
        };
        let json = serde_json::to_string_pretty(&artifact).map_err(|e| write_err(&e))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| write_err(&e))?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| write_err(&e))?;
        fs::rename(&tmp, path).map_err(|e| write_err(&e))?;
        Ok(())
    }
}
