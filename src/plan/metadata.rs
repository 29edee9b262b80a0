//! Phase-encoding metadata for distortion correction
//!
//! Values come from the DWI JSON sidecar with configuration fallbacks. No
//! image header is read; the readout time is derived from sidecar fields.

use tracing::warn;

use crate::config::schema::MetadataConfig;
use crate::error::{DwiprocError, Result};
use crate::index::EntityRecord;

const DEFAULT_READOUT: f64 = 0.05;
const MIN_READOUT: f64 = 0.01;
const MAX_READOUT: f64 = 0.2;

/// Phase-encoding description of one DWI series
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseEncoding {
    /// BIDS direction (`i`, `j-`, ...)
    pub direction: String,
    pub readout_time: f64,
}

impl PhaseEncoding {
    /// Axis letter without polarity
    pub fn axis(&self) -> char {
        self.direction.chars().next().unwrap_or('j')
    }

    /// Unit vector along the phase-encoding axis, negated for `-` polarity
    pub fn vector(&self) -> [i8; 3] {
        let sign = if self.direction.ends_with('-') { -1 } else { 1 };
        match self.axis() {
            'i' => [sign, 0, 0],
            'k' => [0, 0, sign],
            _ => [0, sign, 0],
        }
    }

    /// One `acqparams` line: `x y z readout`
    pub fn acqparams_line(&self) -> String {
        let [x, y, z] = self.vector();
        format!("{x} {y} {z} {:.5}", self.readout_time)
    }
}

/// Resolve the phase-encoding direction of the `idx`-th series
pub fn phase_encoding_direction(
    record: &EntityRecord,
    idx: usize,
    cfg: &MetadataConfig,
) -> Result<String> {
    if let Some(dir) = cfg.pe_dirs.as_ref().and_then(|dirs| dirs.get(idx)) {
        warn!(path = %record.path.display(), direction = %dir, "Setting 'PhaseEncodingDirection' from configuration");
        return Ok(dir.clone());
    }
    if let Some(dir) = record.metadata_str("PhaseEncodingDirection") {
        return Ok(dir.to_string());
    }
    if let Some(axis) = record.metadata_str("PhaseEncodingAxis") {
        warn!(path = %record.path.display(), "Assuming 'PhaseEncodingDirection' from 'PhaseEncodingAxis'");
        return Ok(axis.to_string());
    }
    Err(DwiprocError::Planning {
        unit: record.path.display().to_string(),
        reason: "'PhaseEncodingDirection' not found and cannot be assumed".to_string(),
    })
}

/// Effective echo spacing in seconds, if known
pub fn echo_spacing(record: &EntityRecord, cfg: &MetadataConfig) -> Option<f64> {
    if let Some(es) = record.metadata_f64("EffectiveEchoSpacing") {
        return Some(es);
    }
    if let Some(es) = record.metadata_f64("EstimatedEffectiveEchoSpacing") {
        warn!("Assuming 'EffectiveEchoSpacing' from 'EstimatedEffectiveEchoSpacing'");
        return Some(es);
    }
    if cfg.echo_spacing.is_some() {
        warn!("Using provided echo spacing");
    }
    cfg.echo_spacing
}

/// Total readout time, kept within the range eddy accepts
pub fn readout_time(record: &EntityRecord, cfg: &MetadataConfig) -> f64 {
    let raw = record.metadata_f64("TotalReadoutTime").or_else(|| {
        let es = echo_spacing(record, cfg)?;
        let encodes = record.metadata_f64("ReconMatrixPE")?;
        Some(es * (encodes - 1.0))
    });
    let Some(mut readout) = raw.filter(|r| *r > 0.0) else {
        warn!(path = %record.path.display(), "Unable to determine readout time - using {DEFAULT_READOUT}");
        return DEFAULT_READOUT;
    };
    if readout > MAX_READOUT {
        warn!("Read-out time greater than eddy expected {MAX_READOUT} - halving");
        readout /= 2.0;
    } else if readout < MIN_READOUT {
        warn!("Read-out time less than eddy expected {MIN_READOUT} - doubling");
        readout *= 2.0;
    }
    readout
}

/// Full phase-encoding description for every series of a unit
pub fn phase_encodings(records: &[EntityRecord], cfg: &MetadataConfig) -> Result<Vec<PhaseEncoding>> {
    records
        .iter()
        .enumerate()
        .map(|(idx, record)| {
            Ok(PhaseEncoding {
                direction: phase_encoding_direction(record, idx, cfg)?,
                readout_time: readout_time(record, cfg),
            })
        })
        .collect()
}

/// Number of distinct phase-encoding directions
pub fn distinct_directions(encodings: &[PhaseEncoding]) -> usize {
    let mut distinct: Vec<&str> = encodings.iter().map(|pe| pe.direction.as_str()).collect();
    distinct.sort_unstable();
    distinct.dedup();
    distinct.len()
}

/// Eddy `--index` value per series (1-based acqparams line)
///
/// A single direction shares the first line.
pub fn eddy_indices(encodings: &[PhaseEncoding]) -> Vec<usize> {
    if distinct_directions(encodings) < 2 {
        return vec![1; encodings.len()];
    }
    (1..=encodings.len()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dwi() -> EntityRecord {
        EntityRecord::new("001", "dwi", ".nii.gz", "sub-001/dwi/sub-001_dwi.nii.gz")
    }

    #[test]
    fn direction_prefers_configuration_then_sidecar() {
        let record = dwi()
            .with_metadata("PhaseEncodingDirection", json!("j-"))
            .with_metadata("PhaseEncodingAxis", json!("j"));
        let mut cfg = MetadataConfig::default();
        assert_eq!(phase_encoding_direction(&record, 0, &cfg).unwrap(), "j-");

        cfg.pe_dirs = Some(vec!["i".to_string(), "i-".to_string()]);
        assert_eq!(phase_encoding_direction(&record, 1, &cfg).unwrap(), "i-");

        let axis_only = dwi().with_metadata("PhaseEncodingAxis", json!("j"));
        assert_eq!(
            phase_encoding_direction(&axis_only, 0, &MetadataConfig::default()).unwrap(),
            "j"
        );
    }

    #[test]
    fn missing_direction_is_a_planning_error() {
        let err = phase_encoding_direction(&dwi(), 0, &MetadataConfig::default()).unwrap_err();
        assert!(matches!(err, DwiprocError::Planning { .. }));
    }

    #[test]
    fn readout_time_fallbacks_and_clamping() {
        let cfg = MetadataConfig::default();
        let explicit = dwi().with_metadata("TotalReadoutTime", json!(0.04));
        assert_eq!(readout_time(&explicit, &cfg), 0.04);

        let derived = dwi()
            .with_metadata("EffectiveEchoSpacing", json!(0.001))
            .with_metadata("ReconMatrixPE", json!(51));
        assert!((readout_time(&derived, &cfg) - 0.05).abs() < 1e-9);

        let long = dwi().with_metadata("TotalReadoutTime", json!(0.3));
        assert!((readout_time(&long, &cfg) - 0.15).abs() < 1e-9);

        let short = dwi().with_metadata("TotalReadoutTime", json!(0.008));
        assert!((readout_time(&short, &cfg) - 0.016).abs() < 1e-9);

        assert_eq!(readout_time(&dwi(), &cfg), DEFAULT_READOUT);
    }

    #[test]
    fn acqparams_line_encodes_polarity() {
        let pe = PhaseEncoding {
            direction: "j-".to_string(),
            readout_time: 0.05,
        };
        assert_eq!(pe.acqparams_line(), "0 -1 0 0.05000");
        let pe = PhaseEncoding {
            direction: "i".to_string(),
            readout_time: 0.05,
        };
        assert_eq!(pe.vector(), [1, 0, 0]);
    }

    #[test]
    fn single_direction_uses_one_index() {
        let pe = |d: &str| PhaseEncoding {
            direction: d.to_string(),
            readout_time: 0.05,
        };
        assert_eq!(eddy_indices(&[pe("j"), pe("j")]), vec![1, 1]);
        assert_eq!(eddy_indices(&[pe("j"), pe("j-")]), vec![1, 2]);
    }
}
