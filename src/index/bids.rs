//! BIDS filename indexer
//!
//! Walks a dataset root and turns every `sub-<label>[_<key>-<value>]*_<suffix><ext>`
//! file into an [`EntityRecord`]. Non-JSON files pick up metadata from their
//! same-stem JSON sidecar.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{EntityIndex, EntityRecord};
use crate::error::{DwiprocError, Result};

/// `key-value` entity pair
static ENTITY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([a-zA-Z0-9]+)-([a-zA-Z0-9]+)$").unwrap());

/// Trailing suffix (no `-`)
static SUFFIX_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9]+$").unwrap());

const DATATYPES: &[&str] = &["anat", "dwi", "fmap", "func", "perf"];
const SKIP_DIRS: &[&str] = &["sourcedata", "code", "working", "logs"];

/// Components of a parsed BIDS filename
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedName {
    pub entities: Vec<(String, String)>,
    pub suffix: String,
    pub ext: String,
}

/// Parse a BIDS filename; `None` if it is not subject-level
pub fn parse_filename(name: &str) -> Option<ParsedName> {
    if !name.starts_with("sub-") {
        return None;
    }
    let (stem, ext) = match name.split_once('.') {
        Some((stem, rest)) => (stem, format!(".{rest}")),
        None => (name, String::new()),
    };
    let mut parts: Vec<&str> = stem.split('_').collect();
    let suffix = parts.pop()?;
    if !SUFFIX_PATTERN.is_match(suffix) || parts.is_empty() {
        return None;
    }
    let entities = parts
        .into_iter()
        .map(|part| {
            ENTITY_PATTERN
                .captures(part)
                .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        })
        .collect::<Option<Vec<_>>>()?;
    Some(ParsedName {
        entities,
        suffix: suffix.to_string(),
        ext,
    })
}

/// Build a record for `path` (relative to the dataset root)
pub fn record_from_path(rel_path: &Path) -> Option<EntityRecord> {
    let name = rel_path.file_name()?.to_str()?;
    let parsed = parse_filename(name)?;

    let mut subject = None;
    let mut record = EntityRecord::new("", parsed.suffix, parsed.ext, rel_path);
    for (key, value) in parsed.entities {
        match key.as_str() {
            "sub" => subject = Some(value),
            "ses" => record.session = Some(value),
            "run" => match value.parse::<u32>() {
                Ok(run) => record.run = Some(run),
                Err(_) => {
                    record.entities.insert(key, value);
                }
            },
            _ => {
                record.entities.insert(key, value);
            }
        }
    }
    record.subject = subject?;
    record.datatype = rel_path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .filter(|n| DATATYPES.contains(n))
        .map(str::to_string);
    Some(record)
}

fn load_sidecar(path: &Path) -> Option<BTreeMap<String, serde_json::Value>> {
    let text = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&text) {
        Ok(map) => Some(map),
        Err(e) => {
            warn!(sidecar = %path.display(), error = %e, "Ignoring unreadable sidecar");
            None
        }
    }
}

/// Walk `root` and index every subject-level file
pub fn build_index(root: &Path) -> Result<EntityIndex> {
    if !root.is_dir() {
        return Err(DwiprocError::IndexFailed {
            reason: format!("'{}' is not a directory", root.display()),
        });
    }

    let walker = WalkDir::new(root).follow_links(true).into_iter().filter_entry(|entry| {
        if entry.depth() == 0 {
            return true;
        }
        let name = entry.file_name().to_string_lossy();
        !(name.starts_with('.') || entry.file_type().is_dir() && SKIP_DIRS.contains(&name.as_ref()))
    });

    let mut records = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| DwiprocError::IndexFailed {
            reason: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel_path) = entry.path().strip_prefix(root) else { continue };
        let Some(mut record) = record_from_path(rel_path) else {
            debug!(path = %rel_path.display(), "Skipping non-BIDS file");
            continue;
        };
        if record.ext != ".json" {
            let sidecar = root.join(record.stem_path()).with_extension("json");
            if let Some(metadata) = load_sidecar(&sidecar) {
                record.metadata = metadata;
            }
        }
        records.push(record);
    }

    Ok(EntityIndex::new(root, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn parses_entities_suffix_and_extension() {
        let parsed = parse_filename("sub-001_ses-YY_dir-AP_run-1_dwi.nii.gz").unwrap();
        assert_eq!(parsed.suffix, "dwi");
        assert_eq!(parsed.ext, ".nii.gz");
        assert_eq!(parsed.entities[0], ("sub".to_string(), "001".to_string()));
        assert_eq!(parsed.entities.len(), 4);
    }

    #[test]
    fn rejects_non_subject_and_malformed_names() {
        assert!(parse_filename("dataset_description.json").is_none());
        assert!(parse_filename("sub-001_bad_entity_dwi.nii.gz").is_none());
        assert!(parse_filename("sub-001.nii.gz").is_none());
    }

    #[test]
    fn record_takes_datatype_from_parent() {
        let record =
            record_from_path(Path::new("sub-001/ses-YY/anat/sub-001_ses-YY_run-2_T1w.nii.gz"))
                .unwrap();
        assert_eq!(record.subject, "001");
        assert_eq!(record.session.as_deref(), Some("YY"));
        assert_eq!(record.run, Some(2));
        assert_eq!(record.datatype.as_deref(), Some("anat"));
        assert_eq!(record.suffix, "T1w");
    }

    #[test]
    fn build_walks_dataset_and_loads_sidecars() {
        let dir = TempDir::new().unwrap();
        let dwi_dir = dir.path().join("sub-001/dwi");
        fs::create_dir_all(&dwi_dir).unwrap();
        fs::write(dwi_dir.join("sub-001_dir-AP_dwi.nii.gz"), b"").unwrap();
        fs::write(dwi_dir.join("sub-001_dir-AP_dwi.bval"), b"0 1000").unwrap();
        fs::write(
            dwi_dir.join("sub-001_dir-AP_dwi.json"),
            r#"{"PhaseEncodingDirection": "j-"}"#,
        )
        .unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/sub-009_dwi.nii.gz"), b"").unwrap();
        fs::write(dir.path().join("README"), b"").unwrap();

        let index = build_index(dir.path()).unwrap();
        assert_eq!(index.len(), 3);

        let nifti = index
            .records()
            .iter()
            .find(|r| r.ext == ".nii.gz")
            .unwrap();
        assert_eq!(nifti.path, PathBuf::from("sub-001/dwi/sub-001_dir-AP_dwi.nii.gz"));
        assert_eq!(nifti.metadata_str("PhaseEncodingDirection"), Some("j-"));
        assert_eq!(nifti.entity("dir"), Some("AP"));
        assert!(index.companion(nifti, ".bval").is_some());
    }

    #[test]
    fn build_fails_for_missing_root() {
        let err = build_index(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, DwiprocError::IndexFailed { .. }));
    }
}
