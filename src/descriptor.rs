//! `dataset_description.json` for derivative outputs

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::Stage;
use crate::error::Result;

pub const APP_NAME: &str = "nhp-dwiproc";
pub const BIDS_VERSION: &str = "1.9.0";
const CODE_URL: &str = "https://github.com/kaitj/nhp-dwiproc";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GeneratedBy {
    pub name: String,
    pub version: String,
    #[serde(rename = "CodeURL")]
    pub code_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DatasetDescriptor {
    pub name: String,
    #[serde(rename = "BIDSVersion")]
    pub bids_version: String,
    pub dataset_type: String,
    pub generated_by: GeneratedBy,
}

impl DatasetDescriptor {
    pub fn for_stage(stage: Stage) -> Self {
        Self {
            name: format!("{APP_NAME} generated dataset - {stage} stage"),
            bids_version: BIDS_VERSION.to_string(),
            dataset_type: "derivative".to_string(),
            generated_by: GeneratedBy {
                name: APP_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                code_url: CODE_URL.to_string(),
            },
        }
    }

    /// Write into `output_dir`, returning the file path
    pub fn save(&self, output_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(output_dir)?;
        let path = output_dir.join("dataset_description.json");
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn writes_bids_derivative_descriptor() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = DatasetDescriptor::for_stage(Stage::Reconstruction)
            .save(dir.path())
            .unwrap();

        let data: Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(data["BIDSVersion"], "1.9.0");
        assert_eq!(data["DatasetType"], "derivative");
        assert_eq!(data["GeneratedBy"]["Name"], APP_NAME);
        assert_eq!(data["GeneratedBy"]["Version"], env!("CARGO_PKG_VERSION"));
        assert!(data["GeneratedBy"]["CodeURL"].as_str().unwrap().starts_with("https://"));
        assert!(data["Name"].as_str().unwrap().ends_with("reconstruction stage"));
    }
}
