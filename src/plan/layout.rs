//! Output and working-directory layout
//!
//! Every unit writes below its own `sub-XX[/ses-YY]` output directory and its
//! own `<work>/<prefix>/<step>` working directory, so concurrent units never
//! share a path.

use std::path::{Path, PathBuf};

use super::Step;
use crate::config::ResolvedConfig;
use crate::query::ProcessingUnit;

#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    input_dir: PathBuf,
    output_dir: PathBuf,
    work_root: PathBuf,
}

impl Layout {
    pub fn new(input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>, work_dir: &Path) -> Self {
        let output_dir = output_dir.into();
        // relative working directories live under the output directory
        let work_root = if work_dir.is_absolute() {
            work_dir.to_path_buf()
        } else {
            output_dir.join(work_dir)
        };
        Self {
            input_dir: input_dir.into(),
            output_dir,
            work_root,
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self::new(&config.input_dir, &config.output_dir, &config.opts.work_dir)
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    /// `<work>/<prefix>/<step>`, or `<work>/<step>` for aggregate tasks
    pub fn work_dir(&self, unit: Option<&ProcessingUnit>, step: Step) -> PathBuf {
        match unit {
            Some(unit) => self.work_root.join(unit.prefix()).join(step.as_str()),
            None => self.work_root.join(step.as_str()),
        }
    }

    /// `<output>/sub-XX[/ses-YY]/<datatype>`
    pub fn unit_dir(&self, unit: &ProcessingUnit, datatype: &str) -> PathBuf {
        self.output_dir.join(unit.dir()).join(datatype)
    }

    /// Derivative file name: `<prefix>_<entities>_<suffix_ext>`
    pub fn output(&self, unit: &ProcessingUnit, datatype: &str, entities: &str, suffix_ext: &str) -> PathBuf {
        self.unit_dir(unit, datatype)
            .join(bids_name(unit, entities, suffix_ext))
    }

    /// Intermediate file in a task working directory
    pub fn scratch(&self, unit: &ProcessingUnit, step: Step, entities: &str, suffix_ext: &str) -> PathBuf {
        self.work_dir(Some(unit), step)
            .join(bids_name(unit, entities, suffix_ext))
    }

    /// Directories a container must see
    pub fn mounts(&self) -> Vec<PathBuf> {
        let mut mounts = vec![
            self.input_dir.clone(),
            self.output_dir.clone(),
            self.work_root.clone(),
        ];
        mounts.sort();
        mounts.dedup();
        // a directory nested in another mount is already visible
        let nested: Vec<PathBuf> = mounts
            .iter()
            .filter(|m| mounts.iter().any(|other| other != *m && m.starts_with(other)))
            .cloned()
            .collect();
        mounts.retain(|m| !nested.contains(m));
        mounts
    }
}

fn bids_name(unit: &ProcessingUnit, entities: &str, suffix_ext: &str) -> String {
    if entities.is_empty() {
        format!("{}_{suffix_ext}", unit.prefix())
    } else {
        format!("{}_{entities}_{suffix_ext}", unit.prefix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> ProcessingUnit {
        ProcessingUnit::new("001", Some("YY"), Some(1))
    }

    #[test]
    fn outputs_are_partitioned_per_unit() {
        let layout = Layout::new("/data/in", "/data/out", Path::new("tmp"));
        assert_eq!(
            layout.output(&unit(), "dwi", "desc-preproc", "dwi.nii.gz"),
            PathBuf::from("/data/out/sub-001/ses-YY/dwi/sub-001_ses-YY_run-1_desc-preproc_dwi.nii.gz")
        );
        assert_eq!(
            layout.work_dir(Some(&unit()), Step::Denoise),
            PathBuf::from("/data/out/tmp/sub-001_ses-YY_run-1/denoise")
        );
        assert_eq!(layout.work_dir(None, Step::Index), PathBuf::from("/data/out/tmp/index"));
    }

    #[test]
    fn absolute_work_dir_is_kept() {
        let layout = Layout::new("/in", "/out", Path::new("/scratch/dwi"));
        assert_eq!(layout.work_root(), Path::new("/scratch/dwi"));
        assert_eq!(
            layout.mounts(),
            vec![PathBuf::from("/in"), PathBuf::from("/out"), PathBuf::from("/scratch/dwi")]
        );
    }

    #[test]
    fn nested_mounts_collapse() {
        let layout = Layout::new("/in", "/out", Path::new("work"));
        assert_eq!(layout.mounts(), vec![PathBuf::from("/in"), PathBuf::from("/out")]);
    }
}
