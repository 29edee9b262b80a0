//! Command-line surface: `<input_dir> <output_dir> <stage> [options]`
//!
//! Every stage flag maps to exactly one dotted configuration path, so the
//! CLI is just the highest-priority configuration layer.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Args, Parser, Subcommand};
use serde_yaml::{Mapping, Value};

use crate::config::{Overrides, Stage};
use crate::error::{DwiprocError, Result};

#[derive(Parser, Debug)]
#[command(name = "nhp-dwiproc")]
#[command(about = "Diffusion MRI processing for non-human primate datasets")]
#[command(version)]
pub struct Cli {
    /// BIDS dataset root
    pub input_dir: PathBuf,

    /// Derivatives output directory
    pub output_dir: PathBuf,

    #[command(subcommand)]
    pub stage: StageCommand,

    #[command(flatten)]
    pub global: GlobalArgs,
}

/// Options shared by every stage
#[derive(Args, Debug, Default)]
pub struct GlobalArgs {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Print the planned tasks and exit without executing
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// YAML configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Arbitrary override, e.g. --set preprocess.denoise.skip=true (repeatable)
    #[arg(long = "set", global = true, value_name = "PATH=VALUE")]
    pub set: Vec<String>,

    /// Number of units processed concurrently
    #[arg(long, global = true)]
    pub threads: Option<usize>,

    /// Dataset index artifact (default: <input_dir>/.index.json)
    #[arg(long, global = true, value_name = "PATH")]
    pub index_path: Option<PathBuf>,

    /// Execution backend: local, docker, podman, singularity, apptainer
    #[arg(long, global = true)]
    pub runner: Option<String>,

    /// Tool -> image mapping, inline JSON/YAML or a file path
    #[arg(long, global = true, value_name = "MAP")]
    pub runner_images: Option<String>,

    /// Print a mermaid diagram of the workflow graph
    #[arg(long, global = true)]
    pub graph: bool,

    /// Fixed seed for reproducible results
    #[arg(long, global = true)]
    pub seed_number: Option<u64>,

    /// Working directory for intermediates
    #[arg(long, global = true, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Keep the working directory after the run
    #[arg(long, global = true)]
    pub work_keep: bool,

    /// Largest b-value treated as b=0
    #[arg(long, global = true)]
    pub b0_thresh: Option<u32>,

    /// Participant query (sub/ses attributes only)
    #[arg(long, global = true, value_name = "QUERY")]
    pub participant_query: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum StageCommand {
    /// Build the dataset index
    Index(IndexArgs),
    /// Denoise, unring, undistort, bias-correct and register DWI
    Preprocess(PreprocessArgs),
    /// Tensor fitting, FOD modelling and tractography
    Reconstruction(ReconstructionArgs),
    /// Connectome matrices or tract extraction
    Connectivity(ConnectivityArgs),
}

#[derive(Args, Debug, Default)]
pub struct IndexArgs {
    /// Overwrite an existing index
    #[arg(long)]
    pub overwrite: bool,
}

#[derive(Args, Debug, Default)]
pub struct PreprocessArgs {
    #[arg(long, value_name = "QUERY")]
    pub dwi_query: Option<String>,
    #[arg(long, value_name = "QUERY")]
    pub t1w_query: Option<String>,
    #[arg(long, value_name = "QUERY")]
    pub mask_query: Option<String>,
    #[arg(long, value_name = "QUERY")]
    pub fmap_query: Option<String>,

    /// Phase-encoding direction per DWI series (i, i-, j, j-, k, k-)
    #[arg(long, num_args = 1..=2, value_name = "DIR")]
    pub pe_dirs: Option<Vec<String>>,
    /// Echo spacing used when the sidecar has none
    #[arg(long)]
    pub echo_spacing: Option<f64>,

    #[arg(long)]
    pub denoise_skip: bool,
    #[arg(long)]
    pub denoise_map: bool,
    #[arg(long, value_name = "Exp1|Exp2")]
    pub denoise_estimator: Option<String>,

    #[arg(long)]
    pub unring_skip: bool,
    #[arg(long, num_args = 1.., value_name = "AXIS")]
    pub unring_axes: Option<Vec<u8>>,

    /// topup, fieldmap, eddymotion or fugue
    #[arg(long, value_name = "METHOD")]
    pub undistort_method: Option<String>,
    #[arg(long)]
    pub topup_skip: bool,
    /// b02b0, b02b0_macaque, b02b0_marmoset or a config file
    #[arg(long, value_name = "CONFIG")]
    pub topup_config: Option<String>,
    #[arg(long)]
    pub eddy_skip: bool,
    #[arg(long, value_name = "none|linear|quadratic")]
    pub eddy_slm: Option<String>,
    #[arg(long, alias = "eddy-cnr-maps")]
    pub eddy_cnr: bool,
    #[arg(long)]
    pub eddy_repol: bool,
    #[arg(long)]
    pub eddy_residuals: bool,
    #[arg(long, alias = "eddy-data-is-shelled")]
    pub eddy_shelled: bool,
    #[arg(long)]
    pub eddymotion_iters: Option<u32>,
    #[arg(long)]
    pub fugue_smooth: Option<f64>,

    #[arg(long)]
    pub biascorrect_skip: bool,
    #[arg(long)]
    pub biascorrect_spacing: Option<f64>,
    #[arg(long)]
    pub biascorrect_iters: Option<u32>,
    #[arg(long)]
    pub biascorrect_shrink: Option<u32>,

    #[arg(long)]
    pub register_skip: bool,
    /// SSD, MI, NMI or MAHAL
    #[arg(long)]
    pub register_metric: Option<String>,
    #[arg(long, value_name = "NxN")]
    pub register_iters: Option<String>,
    /// identity or image-centers
    #[arg(long)]
    pub register_init: Option<String>,
}

#[derive(Args, Debug, Default)]
pub struct ReconstructionArgs {
    #[arg(long, value_name = "QUERY")]
    pub dwi_query: Option<String>,
    #[arg(long, value_name = "QUERY")]
    pub mask_query: Option<String>,

    #[arg(long)]
    pub tractography_skip: bool,
    /// Force the single-shell FOD model
    #[arg(long)]
    pub single_shell: bool,
    #[arg(long, num_args = 1.., value_name = "B")]
    pub shells: Option<Vec<u32>>,
    #[arg(long, num_args = 1.., value_name = "L")]
    pub lmax: Option<Vec<u32>>,
    #[arg(long)]
    pub steps: Option<f64>,
    /// wm or act
    #[arg(long)]
    pub tractography_method: Option<String>,
    #[arg(long)]
    pub act_backtrack: bool,
    #[arg(long)]
    pub act_no_crop_gmwmi: bool,
    #[arg(long)]
    pub cutoff: Option<f64>,
    #[arg(long)]
    pub streamlines: Option<u64>,
    #[arg(long)]
    pub max_length: Option<f64>,
}

#[derive(Args, Debug, Default)]
pub struct ConnectivityArgs {
    #[arg(long, value_name = "QUERY")]
    pub dwi_query: Option<String>,
    /// Parcellation label for connectome matrices
    #[arg(long, value_name = "SEG")]
    pub atlas: Option<String>,
    #[arg(long)]
    pub radius: Option<f64>,
    /// ROI query for tract extraction
    #[arg(long, value_name = "QUERY")]
    pub tract_query: Option<String>,
    #[arg(long, value_name = "QUERY")]
    pub surface_query: Option<String>,
    #[arg(long)]
    pub voxel_size: Option<f64>,
}

impl StageCommand {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Index(_) => Stage::Index,
            Self::Preprocess(_) => Stage::Preprocess,
            Self::Reconstruction(_) => Stage::Reconstruction,
            Self::Connectivity(_) => Stage::Connectivity,
        }
    }
}

impl Cli {
    /// Parse after normalising `_` separators in flag names
    pub fn parse_normalized() -> Self {
        Self::parse_from(normalize_flags(std::env::args_os()))
    }

    pub fn stage(&self) -> Stage {
        self.stage.stage()
    }

    /// Dotted-path overrides for every flag given on the command line
    pub fn overrides(&self) -> Result<Overrides> {
        let mut o = Overrides::new();
        let g = &self.global;
        o.set_opt("opts.threads", g.threads.map(|t| t as u64));
        o.set_opt("opts.index_path", g.index_path.as_deref().map(path_value));
        o.set_opt("opts.runner.name", g.runner.clone());
        o.flag("opts.graph", g.graph);
        o.set_opt("opts.seed_number", g.seed_number);
        o.set_opt("opts.work_dir", g.work_dir.as_deref().map(path_value));
        o.flag("opts.work_keep", g.work_keep);
        o.set_opt("opts.b0_thresh", g.b0_thresh);
        if let Some(images) = &g.runner_images {
            o.set("opts.runner.images", parse_image_map(images)?);
        }

        let key = self.stage().key();
        if self.stage() != Stage::Index {
            o.set_opt(&format!("{key}.query.participant"), g.participant_query.clone());
        }

        match &self.stage {
            StageCommand::Index(args) => o.flag("index.overwrite", args.overwrite),
            StageCommand::Preprocess(args) => preprocess_overrides(&mut o, args),
            StageCommand::Reconstruction(args) => reconstruction_overrides(&mut o, args),
            StageCommand::Connectivity(args) => {
                o.set_opt("connectivity.query.dwi", args.dwi_query.clone());
                o.set_opt("connectivity.atlas", args.atlas.clone());
                o.set_opt("connectivity.radius", args.radius);
                o.set_opt("connectivity.tract_query", args.tract_query.clone());
                o.set_opt("connectivity.surface_query", args.surface_query.clone());
                o.set_opt("connectivity.voxel_size", args.voxel_size);
            }
        }

        // --set is applied last so it wins over dedicated flags
        for assignment in &g.set {
            o.assign(assignment)?;
        }
        Ok(o)
    }
}

fn preprocess_overrides(o: &mut Overrides, a: &PreprocessArgs) {
    o.set_opt("preprocess.query.dwi", a.dwi_query.clone());
    o.set_opt("preprocess.query.t1w", a.t1w_query.clone());
    o.set_opt("preprocess.query.mask", a.mask_query.clone());
    o.set_opt("preprocess.query.fmap", a.fmap_query.clone());
    o.set_opt("preprocess.metadata.pe_dirs", a.pe_dirs.clone());
    o.set_opt("preprocess.metadata.echo_spacing", a.echo_spacing);

    o.flag("preprocess.denoise.skip", a.denoise_skip);
    o.flag("preprocess.denoise.map", a.denoise_map);
    o.set_opt("preprocess.denoise.estimator", a.denoise_estimator.clone());
    o.flag("preprocess.unring.skip", a.unring_skip);
    o.set_opt("preprocess.unring.axes", a.unring_axes.clone());

    o.set_opt("preprocess.undistort.method", a.undistort_method.clone());
    o.flag("preprocess.undistort.topup.skip", a.topup_skip);
    o.set_opt("preprocess.undistort.topup.config", a.topup_config.clone());
    o.flag("preprocess.undistort.eddy.skip", a.eddy_skip);
    o.set_opt("preprocess.undistort.eddy.slm", a.eddy_slm.clone());
    o.flag("preprocess.undistort.eddy.cnr", a.eddy_cnr);
    o.flag("preprocess.undistort.eddy.repol", a.eddy_repol);
    o.flag("preprocess.undistort.eddy.residuals", a.eddy_residuals);
    o.flag("preprocess.undistort.eddy.shelled", a.eddy_shelled);
    o.set_opt("preprocess.undistort.eddymotion.iters", a.eddymotion_iters);
    o.set_opt("preprocess.undistort.fugue.smooth", a.fugue_smooth);

    o.flag("preprocess.biascorrect.skip", a.biascorrect_skip);
    o.set_opt("preprocess.biascorrect.spacing", a.biascorrect_spacing);
    o.set_opt("preprocess.biascorrect.iters", a.biascorrect_iters);
    o.set_opt("preprocess.biascorrect.shrink", a.biascorrect_shrink);

    o.flag("preprocess.registration.skip", a.register_skip);
    o.set_opt("preprocess.registration.metric", a.register_metric.clone());
    o.set_opt("preprocess.registration.iters", a.register_iters.clone());
    o.set_opt("preprocess.registration.init", a.register_init.clone());
}

fn reconstruction_overrides(o: &mut Overrides, a: &ReconstructionArgs) {
    o.set_opt("reconstruction.query.dwi", a.dwi_query.clone());
    o.set_opt("reconstruction.query.mask", a.mask_query.clone());

    let t = "reconstruction.tractography";
    o.flag(&format!("{t}.skip"), a.tractography_skip);
    o.flag(&format!("{t}.single_shell"), a.single_shell);
    o.set_opt(&format!("{t}.shells"), a.shells.clone());
    o.set_opt(&format!("{t}.lmax"), a.lmax.clone());
    o.set_opt(&format!("{t}.steps"), a.steps);
    o.set_opt(&format!("{t}.method"), a.tractography_method.clone());
    o.flag(&format!("{t}.act.backtrack"), a.act_backtrack);
    o.flag(&format!("{t}.act.no_crop_gmwmi"), a.act_no_crop_gmwmi);
    o.set_opt(&format!("{t}.cutoff"), a.cutoff);
    o.set_opt(&format!("{t}.streamlines"), a.streamlines);
    o.set_opt(&format!("{t}.max_length"), a.max_length);
}

fn path_value(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Inline JSON/YAML mapping, or the path of a file holding one
fn parse_image_map(raw: &str) -> Result<Value> {
    let path = Path::new(raw);
    let text = if path.is_file() {
        fs::read_to_string(path)?
    } else {
        raw.to_string()
    };
    let parsed: BTreeMap<String, String> =
        serde_yaml::from_str(&text).map_err(|e| DwiprocError::ConfigParse {
            path: "opts.runner.images".to_string(),
            details: e.to_string(),
        })?;
    let mut map = Mapping::new();
    for (tool, image) in parsed {
        map.insert(Value::from(tool), Value::from(image));
    }
    Ok(Value::Mapping(map))
}

/// Rewrite `--some_flag[=v]` as `--some-flag[=v]`; values and everything
/// after a bare `--` are left alone
pub fn normalize_flags<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let mut rest = false;
    args.into_iter()
        .map(Into::into)
        .map(|arg| {
            if rest {
                return arg;
            }
            let Some(text) = arg.to_str() else { return arg };
            if text == "--" {
                rest = true;
                return arg;
            }
            match text.strip_prefix("--") {
                Some(flag) => {
                    let (name, value) = match flag.split_once('=') {
                        Some((name, value)) => (name, Some(value)),
                        None => (flag, None),
                    };
                    let mut out = format!("--{}", name.replace('_', "-"));
                    if let Some(value) = value {
                        out.push('=');
                        out.push_str(value);
                    }
                    OsString::from(out)
                }
                None => arg,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigResolver;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(normalize_flags(args.iter().copied())).unwrap()
    }

    #[test]
    fn underscores_in_flags_are_normalized() {
        let args = normalize_flags(["prog", "--denoise_skip", "--dwi_query=run_1 == 1", "--", "--x_y"]);
        assert_eq!(args[1], "--denoise-skip");
        assert_eq!(args[2], "--dwi-query=run_1 == 1");
        assert_eq!(args[4], "--x_y");
    }

    #[test]
    fn stage_flags_become_dotted_overrides() {
        let cli = parse(&[
            "nhp-dwiproc",
            "/in",
            "/out",
            "preprocess",
            "--denoise_skip",
            "--undistort-method",
            "fugue",
            "--pe-dirs",
            "j",
            "j-",
            "--threads",
            "3",
        ]);
        assert_eq!(cli.stage(), Stage::Preprocess);
        let config = ConfigResolver::new()
            .with_overrides(cli.overrides().unwrap())
            .resolve(cli.stage(), &cli.input_dir, &cli.output_dir)
            .unwrap();
        let cfg = config.preprocess().unwrap();
        assert!(cfg.denoise.skip);
        assert_eq!(cfg.metadata.pe_dirs, Some(vec!["j".to_string(), "j-".to_string()]));
        assert_eq!(config.opts.threads, 3);
        assert!(!cfg.unring.skip);
    }

    #[test]
    fn set_overrides_win_over_flags() {
        let cli = parse(&[
            "nhp-dwiproc",
            "/in",
            "/out",
            "reconstruction",
            "--streamlines",
            "500",
            "--set",
            "reconstruction.tractography.streamlines=9000",
        ]);
        let config = ConfigResolver::new()
            .with_overrides(cli.overrides().unwrap())
            .resolve(cli.stage(), "/in", "/out")
            .unwrap();
        assert_eq!(config.reconstruction().unwrap().tractography.streamlines, 9000);
    }

    #[test]
    fn global_flags_are_accepted_after_the_stage() {
        let cli = parse(&["nhp-dwiproc", "/in", "/out", "index", "--overwrite", "-vv", "--dry-run"]);
        assert_eq!(cli.global.verbose, 2);
        assert!(cli.global.dry_run);
        let config = ConfigResolver::new()
            .with_overrides(cli.overrides().unwrap())
            .resolve(Stage::Index, "/in", "/out")
            .unwrap();
        assert!(config.index().unwrap().overwrite);
    }

    #[test]
    fn image_map_accepts_inline_json_and_files() {
        let inline = parse_image_map(r#"{"mrtrix3": "/sif/mrtrix.sif"}"#).unwrap();
        assert_eq!(inline["mrtrix3"], Value::from("/sif/mrtrix.sif"));

        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("images.yaml");
        fs::write(&file, "fsl: /sif/fsl.sif\n").unwrap();
        let from_file = parse_image_map(file.to_str().unwrap()).unwrap();
        assert_eq!(from_file["fsl"], Value::from("/sif/fsl.sif"));

        let err = parse_image_map("[not, a, map]").unwrap_err();
        assert!(err.is_configuration());
    }
}
