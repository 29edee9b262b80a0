//! Typed configuration sections
//!
//! The serialized `Default` of [`ConfigDocument`] is the compiled schema: every
//! key the resolver accepts appears in it, including `null` defaults for
//! options that are unset unless provided.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Whole configuration document (all stages)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigDocument {
    pub opts: GlobalOpts,
    pub index: IndexConfig,
    pub preprocess: PreprocessConfig,
    pub reconstruction: ReconstructionConfig,
    pub connectivity: ConnectivityConfig,
}

// ═══════════════════════════════════════════════════════════════
// GLOBAL
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GlobalOpts {
    pub threads: usize,
    pub index_path: Option<PathBuf>,
    pub runner: RunnerConfig,
    pub graph: bool,
    pub seed_number: u64,
    pub work_dir: PathBuf,
    pub work_keep: bool,
    pub b0_thresh: u32,
}

impl Default for GlobalOpts {
    fn default() -> Self {
        Self {
            threads: 1,
            index_path: None,
            runner: RunnerConfig::default(),
            graph: false,
            seed_number: 99,
            work_dir: PathBuf::from("dwiproc_tmp"),
            work_keep: false,
            b0_thresh: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerConfig {
    pub name: RunnerKind,
    /// Canonical tool identity -> image or executable location
    pub images: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    #[default]
    Local,
    Docker,
    Podman,
    Singularity,
    Apptainer,
}

impl RunnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Docker => "docker",
            Self::Podman => "podman",
            Self::Singularity => "singularity",
            Self::Apptainer => "apptainer",
        }
    }
}

/// User-supplied query strings; `None` keeps the stage's default predicate
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueryConfig {
    pub participant: Option<String>,
    pub dwi: Option<String>,
    pub t1w: Option<String>,
    pub mask: Option<String>,
    pub fmap: Option<String>,
}

// ═══════════════════════════════════════════════════════════════
// INDEX
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexConfig {
    pub overwrite: bool,
}

// ═══════════════════════════════════════════════════════════════
// PREPROCESS
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreprocessConfig {
    pub query: QueryConfig,
    pub metadata: MetadataConfig,
    pub denoise: DenoiseConfig,
    pub unring: UnringConfig,
    pub undistort: UndistortConfig,
    pub biascorrect: BiascorrectConfig,
    pub registration: RegistrationConfig,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetadataConfig {
    /// Phase-encoding directions, one per DWI series
    pub pe_dirs: Option<Vec<String>>,
    pub echo_spacing: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DenoiseConfig {
    pub skip: bool,
    pub map: bool,
    pub estimator: DenoiseEstimator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DenoiseEstimator {
    Exp1,
    #[default]
    Exp2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UnringConfig {
    pub skip: bool,
    pub axes: Vec<u8>,
}

impl Default for UnringConfig {
    fn default() -> Self {
        Self {
            skip: false,
            axes: vec![0, 1],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UndistortConfig {
    pub method: UndistortMethod,
    pub topup: TopupConfig,
    pub eddy: EddyConfig,
    pub eddymotion: EddymotionConfig,
    pub fugue: FugueConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UndistortMethod {
    #[default]
    Topup,
    Fieldmap,
    Eddymotion,
    Fugue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TopupConfig {
    pub skip: bool,
    pub config: String,
}

impl Default for TopupConfig {
    fn default() -> Self {
        Self {
            skip: false,
            config: "b02b0_macaque".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EddyConfig {
    pub skip: bool,
    pub slm: Option<EddySlm>,
    pub cnr: bool,
    pub repol: bool,
    pub residuals: bool,
    pub shelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EddySlm {
    None,
    Linear,
    Quadratic,
}

impl EddySlm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Linear => "linear",
            Self::Quadratic => "quadratic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EddymotionConfig {
    pub iters: u32,
}

impl Default for EddymotionConfig {
    fn default() -> Self {
        Self { iters: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FugueConfig {
    /// 3D gaussian smoothing sigma (mm) applied to the fieldmap
    pub smooth: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BiascorrectConfig {
    pub skip: bool,
    pub spacing: f64,
    pub iters: u32,
    pub shrink: u32,
}

impl Default for BiascorrectConfig {
    fn default() -> Self {
        Self {
            skip: false,
            spacing: 100.0,
            iters: 1000,
            shrink: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistrationConfig {
    pub skip: bool,
    pub metric: RegistrationMetric,
    pub iters: String,
    pub init: RegistrationInit,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            skip: false,
            metric: RegistrationMetric::default(),
            iters: "50x50".to_string(),
            init: RegistrationInit::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RegistrationMetric {
    Ssd,
    Mi,
    #[default]
    Nmi,
    Mahal,
}

impl RegistrationMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ssd => "SSD",
            Self::Mi => "MI",
            Self::Nmi => "NMI",
            Self::Mahal => "MAHAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegistrationInit {
    #[default]
    Identity,
    ImageCenters,
}

// ═══════════════════════════════════════════════════════════════
// RECONSTRUCTION
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconstructionConfig {
    pub query: QueryConfig,
    pub tractography: TractographyConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TractographyConfig {
    pub skip: bool,
    pub single_shell: bool,
    pub shells: Option<Vec<u32>>,
    pub lmax: Option<Vec<u32>>,
    pub steps: Option<f64>,
    pub method: TractographyMethod,
    pub act: ActConfig,
    pub cutoff: f64,
    pub streamlines: u64,
    pub max_length: Option<f64>,
}

impl Default for TractographyConfig {
    fn default() -> Self {
        Self {
            skip: false,
            single_shell: false,
            shells: None,
            lmax: None,
            steps: None,
            method: TractographyMethod::default(),
            act: ActConfig::default(),
            cutoff: 0.1,
            streamlines: 10_000,
            max_length: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TractographyMethod {
    #[default]
    Wm,
    Act,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActConfig {
    pub backtrack: bool,
    pub no_crop_gmwmi: bool,
}

// ═══════════════════════════════════════════════════════════════
// CONNECTIVITY
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectivityConfig {
    pub query: QueryConfig,
    /// Volumetric parcellation label (`seg` entity) for connectome matrices
    pub atlas: Option<String>,
    pub radius: f64,
    /// ROI query for single-tract extraction
    pub tract_query: Option<String>,
    pub surface_query: Option<String>,
    pub voxel_size: Option<f64>,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            query: QueryConfig::default(),
            atlas: None,
            radius: 2.0,
            tract_query: None,
            surface_query: None,
            voxel_size: None,
        }
    }
}

/// Connectivity method derived from which of `atlas` / `tract_query` is set
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectivityMethod {
    Connectome { atlas: String },
    Tract { query: String },
}

impl ConnectivityConfig {
    pub fn method(&self) -> Option<ConnectivityMethod> {
        match (&self.atlas, &self.tract_query) {
            (Some(atlas), None) => Some(ConnectivityMethod::Connectome {
                atlas: atlas.clone(),
            }),
            (None, Some(query)) => Some(ConnectivityMethod::Tract {
                query: query.clone(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_serialize_every_key() {
        let value = serde_yaml::to_value(ConfigDocument::default()).unwrap();
        let undistort = &value["preprocess"]["undistort"];
        assert_eq!(undistort["method"], serde_yaml::Value::from("topup"));
        assert!(undistort["eddy"]["slm"].is_null());
        assert_eq!(value["opts"]["threads"], serde_yaml::Value::from(1));
        assert!(value["connectivity"]["atlas"].is_null());
    }

    #[test]
    fn enum_spellings_match_yaml() {
        let metric: RegistrationMetric = serde_yaml::from_str("MAHAL").unwrap();
        assert_eq!(metric, RegistrationMetric::Mahal);
        let init: RegistrationInit = serde_yaml::from_str("image-centers").unwrap();
        assert_eq!(init, RegistrationInit::ImageCenters);
        let estimator: DenoiseEstimator = serde_yaml::from_str("Exp1").unwrap();
        assert_eq!(estimator, DenoiseEstimator::Exp1);
    }

    #[test]
    fn connectivity_method_requires_exactly_one() {
        let mut cfg = ConnectivityConfig::default();
        assert_eq!(cfg.method(), None);
        cfg.atlas = Some("Markov".to_string());
        assert!(matches!(cfg.method(), Some(ConnectivityMethod::Connectome { .. })));
        cfg.tract_query = Some("label == 'cst'".to_string());
        assert_eq!(cfg.method(), None);
    }
}
