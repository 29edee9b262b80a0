//! `preprocess` stage
//!
//! Per unit: denoise -> unring -> undistort -> biascorrect -> register ->
//! finalize. Denoise and unring run on every DWI series of the unit; the
//! undistort step concatenates them, so later steps see a single series.

use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::{info, warn};

use super::metadata::{self, PhaseEncoding};
use super::{
    series_names, Builtin, ChainBuilder, Command, GradientSeries, Invocation, Step, Task,
    TaskAction, UnitContext, DWI_QUERY,
};
use crate::config::schema::{DenoiseEstimator, MetadataConfig, PreprocessConfig, RegistrationInit, UndistortMethod};
use crate::config::ResolvedConfig;
use crate::error::{DwiprocError, Result};
use crate::query::{InputRequest, Query};
use crate::tool::Tool;

const T1W_QUERY: &str = "suffix = 'T1w' AND ext IN ('.nii', '.nii.gz')";
const MASK_QUERY: &str = "suffix = 'mask' AND ext IN ('.nii', '.nii.gz')";
const FMAP_EPI_QUERY: &str = "datatype = 'fmap' AND suffix = 'epi' AND ext IN ('.nii', '.nii.gz')";
const FMAP_FIELD_QUERY: &str =
    "datatype = 'fmap' AND suffix = 'fieldmap' AND ext IN ('.nii', '.nii.gz')";

/// Topup configurations shipped with FSL images, referenced by name
const NAMED_TOPUP_CONFIGS: &[&str] = &["b02b0", "b02b0_macaque", "b02b0_marmoset"];

fn settings(config: &ResolvedConfig) -> Result<&PreprocessConfig> {
    config.preprocess().ok_or_else(|| DwiprocError::ConfigInvalid {
        path: "preprocess".to_string(),
        reason: "configuration was not resolved for the preprocess stage".to_string(),
    })
}

pub(super) fn requests(config: &ResolvedConfig) -> Result<(InputRequest, Vec<InputRequest>)> {
    let cfg = settings(config)?;
    let query = &cfg.query;

    let dwi = InputRequest::many("dwi", Query::parse(DWI_QUERY)?.refine(query.dwi.as_deref())?)
        .with_companions(&[".bval", ".bvec"]);

    let mut secondary = Vec::new();
    if !cfg.registration.skip {
        secondary.push(InputRequest::one(
            "t1w",
            Query::parse(T1W_QUERY)?.refine(query.t1w.as_deref())?,
        ));
    }
    if let Some(mask) = query.mask.as_deref() {
        secondary.push(
            InputRequest::one("mask", Query::parse(MASK_QUERY)?.refine(Some(mask))?).optional(),
        );
    }
    match cfg.undistort.method {
        UndistortMethod::Fieldmap => secondary.push(
            InputRequest::many("fmap", Query::parse(FMAP_EPI_QUERY)?.refine(query.fmap.as_deref())?)
                .optional(),
        ),
        UndistortMethod::Fugue => secondary.push(
            InputRequest::one("fmap", Query::parse(FMAP_FIELD_QUERY)?.refine(query.fmap.as_deref())?)
                .optional(),
        ),
        UndistortMethod::Topup | UndistortMethod::Eddymotion => {}
    }
    Ok((dwi, secondary))
}

pub(super) fn plan_unit(ctx: &UnitContext<'_>) -> Result<Vec<Task>> {
    let cfg = settings(ctx.config)?;
    let dwis = ctx.selection.all("dwi");
    let encodings = metadata::phase_encodings(dwis, &cfg.metadata).map_err(|e| rescope(ctx, e))?;

    let mut chain = ctx.chain();
    for (i, record) in dwis.iter().enumerate() {
        chain.seed(format!("dwi.{i}"), ctx.path(record));
        chain.seed(format!("bval.{i}"), ctx.companion("dwi", ".bval", i)?);
        chain.seed(format!("bvec.{i}"), ctx.companion("dwi", ".bvec", i)?);
    }
    for (j, record) in ctx.selection.all("fmap").iter().enumerate() {
        chain.seed(format!("fmap.{j}"), ctx.path(record));
    }
    if let Some(t1w) = ctx.selection.one("t1w") {
        chain.seed("t1w", ctx.path(t1w));
    }
    if let Some(mask) = ctx.selection.one("mask") {
        chain.seed("anat_mask", ctx.path(mask));
    }

    let series = series_names("dwi", dwis.len());
    denoise(&mut chain, ctx, cfg, &series)?;
    unring(&mut chain, ctx, cfg, &series)?;
    undistort(&mut chain, ctx, cfg, &encodings)?;
    biascorrect(&mut chain, ctx, cfg)?;
    register(&mut chain, ctx, cfg)?;
    finalize(&mut chain, ctx, cfg, &encodings)?;
    Ok(chain.finish())
}

/// Metadata errors name the file; report them against the unit
fn rescope(ctx: &UnitContext<'_>, err: DwiprocError) -> DwiprocError {
    match err {
        DwiprocError::Planning { reason, .. } => ctx.error(reason),
        other => other,
    }
}

fn denoise(chain: &mut ChainBuilder<'_>, ctx: &UnitContext<'_>, cfg: &PreprocessConfig, series: &[String]) -> Result<()> {
    let settings = ctx.config.slice("preprocess.denoise");
    if cfg.denoise.skip {
        chain.passthrough(Step::Denoise, series, settings);
        return Ok(());
    }
    let estimator = match cfg.denoise.estimator {
        DenoiseEstimator::Exp1 => "Exp1",
        DenoiseEstimator::Exp2 => "Exp2",
    };

    let mut invocations: Vec<Invocation> = Vec::new();
    let mut produces = Vec::new();
    for (i, name) in series.iter().enumerate() {
        let input = chain.require(name)?;
        let output = chain.scratch(Step::Denoise, &format!("split-{i}_desc-denoise"), "dwi.nii.gz");
        let mut cmd = Command::new(Tool::Mrtrix3, "dwidenoise").opt("-estimator", estimator);
        if cfg.denoise.map {
            let noise = chain.output("dwi", &format!("split-{i}_desc-noise"), "dwimap.nii.gz");
            cmd = cmd.opt_path("-noise", &noise);
            produces.push((format!("noise.{i}"), noise));
        }
        invocations.push(cmd.path(&input).path(&output).into());
        produces.push((name.clone(), output));
    }
    chain.run(Step::Denoise, Tool::Mrtrix3, series, produces, TaskAction::Run(invocations), settings);
    Ok(())
}

fn unring(chain: &mut ChainBuilder<'_>, ctx: &UnitContext<'_>, cfg: &PreprocessConfig, series: &[String]) -> Result<()> {
    let settings = ctx.config.slice("preprocess.unring");
    if cfg.unring.skip {
        chain.passthrough(Step::Unring, series, settings);
        return Ok(());
    }
    let axes = cfg
        .unring
        .axes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let mut invocations: Vec<Invocation> = Vec::new();
    let mut produces = Vec::new();
    for (i, name) in series.iter().enumerate() {
        let input = chain.require(name)?;
        let output = chain.scratch(Step::Unring, &format!("split-{i}_desc-unring"), "dwi.nii.gz");
        invocations.push(
            Command::new(Tool::Mrtrix3, "mrdegibbs")
                .opt("-axes", &axes)
                .path(&input)
                .path(&output)
                .into(),
        );
        produces.push((name.clone(), output));
    }
    chain.run(Step::Unring, Tool::Mrtrix3, series, produces, TaskAction::Run(invocations), settings);
    Ok(())
}

/// Mean b0 of one series, appended to `invocations`
fn mean_b0(
    chain: &ChainBuilder<'_>,
    invocations: &mut Vec<Invocation>,
    label: &str,
    image: &Path,
    grad: Option<(&Path, &Path)>,
) -> PathBuf {
    let step = Step::Undistort;
    let mean = chain.scratch(step, &format!("split-{label}_desc-avg"), "b0.nii.gz");
    let source = match grad {
        Some((bvec, bval)) => {
            let b0 = chain.scratch(step, &format!("split-{label}"), "b0.nii.gz");
            invocations.push(
                Command::new(Tool::Mrtrix3, "dwiextract")
                    .arg("-bzero")
                    .arg("-fslgrad")
                    .path(bvec)
                    .path(bval)
                    .path(image)
                    .path(&b0)
                    .into(),
            );
            b0
        }
        None => image.to_path_buf(),
    };
    invocations.push(
        Command::new(Tool::Mrtrix3, "mrmath")
            .path(&source)
            .arg("mean")
            .path(&mean)
            .opt("-axis", 3)
            .into(),
    );
    mean
}

fn topup_config(name: &str) -> String {
    if NAMED_TOPUP_CONFIGS.contains(&name) {
        format!("{name}.cnf")
    } else {
        name.to_string()
    }
}

fn warp_direction(direction: &str) -> &'static str {
    match direction {
        "i" => "x",
        "i-" => "x-",
        "j-" => "y-",
        "k" => "z",
        "k-" => "z-",
        _ => "y",
    }
}

fn undistort(
    chain: &mut ChainBuilder<'_>,
    ctx: &UnitContext<'_>,
    cfg: &PreprocessConfig,
    encodings: &[PhaseEncoding],
) -> Result<()> {
    let step = Step::Undistort;
    let undistort = &cfg.undistort;
    let threads = ctx.config.opts.threads;
    let n = encodings.len();
    let work = chain.work_dir(step);
    let prefix = ctx.unit().prefix();

    let dwis = (0..n).map(|i| chain.require(&format!("dwi.{i}"))).collect::<Result<Vec<_>>>()?;
    let bvals = (0..n).map(|i| chain.require(&format!("bval.{i}"))).collect::<Result<Vec<_>>>()?;
    let bvecs = (0..n).map(|i| chain.require(&format!("bvec.{i}"))).collect::<Result<Vec<_>>>()?;
    let fmap_records = ctx.selection.all("fmap");

    let mut consumes = series_names("dwi", n);
    consumes.extend(series_names("bval", n));
    consumes.extend(series_names("bvec", n));
    consumes.extend(series_names("fmap", fmap_records.len()));

    // Concatenated series, gradients, eddy index and acquisition parameters
    let mut invocations: Vec<Invocation> = Vec::new();
    let bval = chain.scratch(step, "desc-concat", "dwi.bval");
    let bvec = chain.scratch(step, "desc-concat", "dwi.bvec");
    let index_file = chain.scratch(step, "desc-eddy", "indices.txt");
    let acqp = chain.scratch(step, "desc-concat", "phenc.txt");
    let indices = metadata::eddy_indices(encodings);
    invocations.push(
        Builtin::ConcatGradients {
            series: (0..n)
                .map(|i| GradientSeries {
                    bval: bvals[i].clone(),
                    bvec: bvecs[i].clone(),
                    index: indices[i],
                })
                .collect(),
            out_bval: bval.clone(),
            out_bvec: bvec.clone(),
            out_index: Some(index_file.clone()),
        }
        .into(),
    );
    invocations.push(
        Builtin::WriteText {
            path: acqp.clone(),
            contents: acqparams(encodings),
        }
        .into(),
    );
    let concat = if n > 1 {
        let out = chain.scratch(step, "desc-concat", "dwi.nii.gz");
        invocations.push(
            Command::new(Tool::Mrtrix3, "mrcat")
                .opt("-axis", 3)
                .paths(&dwis)
                .path(&out)
                .into(),
        );
        out
    } else {
        dwis[0].clone()
    };

    let mut tool = Tool::Mrtrix3;
    let (mut dwi_out, bvec_out) = if undistort.method == UndistortMethod::Eddymotion {
        if n > 1 {
            return Err(ctx.error("eddymotion supports a single DWI series"));
        }
        tool = Tool::Eddymotion;
        let out_dir = work.join("eddymotion");
        invocations.push(
            Command::new(Tool::Eddymotion, "eddymotion")
                .path(&concat)
                .opt_path("--bvec-file", &bvec)
                .opt_path("--bval-file", &bval)
                .opt("--models", "b0")
                .opt("--n-iter", undistort.eddymotion.iters)
                .opt("--seed", ctx.config.opts.seed_number)
                .opt("--nthreads", threads)
                .opt_path("--output-dir", &out_dir)
                .into(),
        );
        (
            out_dir.join(format!("{prefix}_desc-eddymotion_dwi.nii.gz")),
            out_dir.join(format!("{prefix}_desc-eddymotion_dwi.bvec")),
        )
    } else {
        // topup inputs: mean b0 per acquisition with its encoding
        let mut b0s: Vec<(PathBuf, PhaseEncoding)> = Vec::new();
        match undistort.method {
            UndistortMethod::Fieldmap if !fmap_records.is_empty() => {
                let b0 = mean_b0(chain, &mut invocations, "0", &dwis[0], Some((&bvecs[0], &bvals[0])));
                b0s.push((b0, encodings[0].clone()));
                for (j, record) in fmap_records.iter().enumerate() {
                    let fmap_cfg = MetadataConfig::default();
                    let encoding = PhaseEncoding {
                        direction: metadata::phase_encoding_direction(record, 0, &fmap_cfg)
                            .map_err(|e| rescope(ctx, e))?,
                        readout_time: metadata::readout_time(record, &fmap_cfg),
                    };
                    let fmap = chain.require(&format!("fmap.{j}"))?;
                    let b0 = mean_b0(chain, &mut invocations, &format!("fmap{j}"), &fmap, None);
                    b0s.push((b0, encoding));
                }
            }
            UndistortMethod::Fieldmap | UndistortMethod::Topup => {
                if undistort.method == UndistortMethod::Fieldmap {
                    warn!(unit = %ctx.unit(), "No fieldmap found - falling back to topup");
                }
                for i in 0..n {
                    let b0 = mean_b0(chain, &mut invocations, &i.to_string(), &dwis[i], Some((&bvecs[i], &bvals[i])));
                    b0s.push((b0, encodings[i].clone()));
                }
            }
            UndistortMethod::Fugue | UndistortMethod::Eddymotion => {}
        }

        let b0_encodings: Vec<PhaseEncoding> = b0s.iter().map(|(_, pe)| pe.clone()).collect();
        let topup_base = work.join(format!("{prefix}_desc-topup"));
        let run_topup = !undistort.topup.skip && metadata::distinct_directions(&b0_encodings) >= 2;
        if run_topup {
            tool = Tool::Fsl;
            let b0_paths: Vec<PathBuf> = b0s.iter().map(|(path, _)| path.clone()).collect();
            let b0_all = chain.scratch(step, "desc-topup", "b0.nii.gz");
            let topup_acqp = chain.scratch(step, "desc-topup", "phenc.txt");
            invocations.push(
                Command::new(Tool::Mrtrix3, "mrcat")
                    .opt("-axis", 3)
                    .paths(&b0_paths)
                    .path(&b0_all)
                    .into(),
            );
            invocations.push(
                Builtin::WriteText {
                    path: topup_acqp.clone(),
                    contents: acqparams(&b0_encodings),
                }
                .into(),
            );
            invocations.push(
                Command::new(Tool::Fsl, "topup")
                    .set("--imain", b0_all.display())
                    .set("--datain", topup_acqp.display())
                    .set("--config", topup_config(&undistort.topup.config))
                    .set("--out", topup_base.display())
                    .set("--iout", work.join(format!("{prefix}_desc-topup_b0s")).display())
                    .set("--fout", work.join(format!("{prefix}_desc-topup_fmap")).display())
                    .set("--nthr", threads)
                    .into(),
            );
        } else if !b0s.is_empty() && !undistort.topup.skip {
            info!(unit = %ctx.unit(), "Single phase-encoding direction - skipping topup");
        }

        if !undistort.eddy.skip {
            tool = Tool::Fsl;
            let premask = chain.scratch(step, "desc-preEddy", "mask.nii.gz");
            let eddy_base = work.join(format!("{prefix}_desc-eddy"));
            invocations.push(
                Command::new(Tool::Mrtrix3, "dwi2mask")
                    .arg("-fslgrad")
                    .path(&bvec)
                    .path(&bval)
                    .path(&concat)
                    .path(&premask)
                    .into(),
            );
            let mut eddy = Command::new(Tool::Fsl, "eddy")
                .set("--imain", concat.display())
                .set("--mask", premask.display())
                .set("--acqp", acqp.display())
                .set("--index", index_file.display())
                .set("--bvecs", bvec.display())
                .set("--bvals", bval.display())
                .set("--out", eddy_base.display());
            if run_topup {
                eddy = eddy.set("--topup", topup_base.display());
            }
            if let Some(slm) = undistort.eddy.slm {
                eddy = eddy.set("--slm", slm.as_str());
            }
            eddy = eddy
                .flag_if(undistort.eddy.cnr, "--cnr_maps")
                .flag_if(undistort.eddy.repol, "--repol")
                .flag_if(undistort.eddy.residuals, "--residuals")
                .flag_if(undistort.eddy.shelled, "--data_is_shelled")
                .set("--nthr", threads);
            invocations.push(eddy.into());
            (
                work.join(format!("{prefix}_desc-eddy.nii.gz")),
                work.join(format!("{prefix}_desc-eddy.eddy_rotated_bvecs")),
            )
        } else if run_topup {
            let out = work.join(format!("{prefix}_desc-applytopup_dwi"));
            invocations.push(
                Command::new(Tool::Fsl, "applytopup")
                    .set("--imain", concat.display())
                    .set("--datain", acqp.display())
                    .set("--inindex", 1)
                    .set("--topup", topup_base.display())
                    .set("--method", "jac")
                    .set("--out", out.display())
                    .into(),
            );
            (work.join(format!("{prefix}_desc-applytopup_dwi.nii.gz")), bvec.clone())
        } else {
            (concat.clone(), bvec.clone())
        }
    };

    if undistort.method == UndistortMethod::Fugue {
        match fmap_records.first() {
            Some(_) => {
                let echo = metadata::echo_spacing(&ctx.selection.all("dwi")[0], &cfg.metadata)
                    .ok_or_else(|| ctx.error("fugue requires an effective echo spacing"))?;
                tool = Tool::Fsl;
                let fmap = chain.require("fmap.0")?;
                let out = chain.scratch(step, "desc-fugue", "dwi.nii.gz");
                invocations.push(
                    Command::new(Tool::Fsl, "fugue")
                        .set("-i", dwi_out.display())
                        .set("--loadfmap", fmap.display())
                        .set("--dwell", echo)
                        .set("--unwarpdir", warp_direction(&encodings[0].direction))
                        .opt_some("--smooth3", undistort.fugue.smooth)
                        .set("-u", out.display())
                        .into(),
                );
                dwi_out = out;
            }
            None => warn!(unit = %ctx.unit(), "No fieldmap found - skipping fugue"),
        }
    }

    let mask = chain.scratch(step, "desc-undistort", "mask.nii.gz");
    invocations.push(
        Command::new(Tool::Mrtrix3, "dwi2mask")
            .arg("-fslgrad")
            .path(&bvec_out)
            .path(&bval)
            .path(&dwi_out)
            .path(&mask)
            .into(),
    );

    chain.run(
        step,
        tool,
        &consumes,
        vec![
            ("dwi".to_string(), dwi_out),
            ("bval".to_string(), bval),
            ("bvec".to_string(), bvec_out),
            ("mask".to_string(), mask),
        ],
        TaskAction::Run(invocations),
        ctx.config.slice("preprocess.undistort"),
    );
    Ok(())
}

fn acqparams(encodings: &[PhaseEncoding]) -> String {
    let mut out: String = encodings
        .iter()
        .map(PhaseEncoding::acqparams_line)
        .collect::<Vec<_>>()
        .join("\n");
    out.push('\n');
    out
}

fn biascorrect(chain: &mut ChainBuilder<'_>, ctx: &UnitContext<'_>, cfg: &PreprocessConfig) -> Result<()> {
    let step = Step::Biascorrect;
    let settings = ctx.config.slice("preprocess.biascorrect");
    if cfg.biascorrect.skip {
        chain.passthrough(step, &["dwi", "bval", "bvec", "mask"], settings);
        return Ok(());
    }
    let bias = &cfg.biascorrect;
    let dwi = chain.require("dwi")?;
    let bval = chain.require("bval")?;
    let bvec = chain.require("bvec")?;
    let out = chain.scratch(step, "desc-biascorrect", "dwi.nii.gz");
    let mask = chain.scratch(step, "desc-biascorrect", "mask.nii.gz");

    let invocations: Vec<Invocation> = vec![
        Command::new(Tool::Mrtrix3, "dwibiascorrect")
            .arg("ants")
            .opt("-ants.b", format!("{},3", bias.spacing))
            .opt("-ants.c", format!("{},0.0", bias.iters))
            .opt("-ants.s", bias.shrink)
            .arg("-fslgrad")
            .path(&bvec)
            .path(&bval)
            .path(&dwi)
            .path(&out)
            .into(),
        Command::new(Tool::Mrtrix3, "dwi2mask")
            .arg("-fslgrad")
            .path(&bvec)
            .path(&bval)
            .path(&out)
            .path(&mask)
            .into(),
    ];
    chain.run(
        step,
        Tool::Mrtrix3,
        &["dwi", "bval", "bvec"],
        vec![("dwi".to_string(), out), ("mask".to_string(), mask)],
        TaskAction::Run(invocations),
        settings,
    );
    Ok(())
}

fn register(chain: &mut ChainBuilder<'_>, ctx: &UnitContext<'_>, cfg: &PreprocessConfig) -> Result<()> {
    let step = Step::Register;
    let settings = ctx.config.slice("preprocess.registration");
    if cfg.registration.skip {
        chain.passthrough(step, &["dwi", "bval", "bvec", "mask"], settings);
        return Ok(());
    }
    let reg = &cfg.registration;
    let work = chain.work_dir(step);
    let dwi = chain.require("dwi")?;
    let bval = chain.require("bval")?;
    let bvec = chain.require("bvec")?;
    let mask = chain.require("mask")?;
    let t1w = chain.require("t1w")?;

    let b0 = chain.scratch(step, "", "b0.nii.gz");
    let b0_avg = chain.scratch(step, "desc-avg", "b0.nii.gz");
    let ras = work.join("from-dwi_to-T1w_method-ras_affine.txt");
    let itk = work.join("from-dwi_to-T1w_method-itk_affine.mat");
    let dwi_out = chain.scratch(step, "space-T1w", "dwi.nii.gz");
    let mask_out = chain.scratch(step, "space-T1w", "mask.nii.gz");
    let bvec_out = chain.scratch(step, "space-T1w", "dwi.bvec");
    let xfm = chain.output("anat", "from-dwi_to-T1w_mode-image_desc-registration", "xfm.mat");

    // rigid (6 dof) affine; greedy takes the metric name as given
    let init = match reg.init {
        RegistrationInit::Identity => "-ia-identity",
        RegistrationInit::ImageCenters => "-ia-image-centers",
    };
    let mut greedy = Command::new(Tool::Greedy, "greedy")
        .opt("-d", 3)
        .arg("-a")
        .opt("-dof", 6)
        .arg("-i")
        .path(&t1w)
        .path(&b0_avg)
        .opt_path("-o", &ras)
        .arg(init)
        .opt("-n", &reg.iters)
        .opt("-m", reg.metric.as_str())
        .opt("-threads", ctx.config.opts.threads);
    let mut consumes = vec!["dwi", "bval", "bvec", "mask", "t1w"];
    if let Some(anat_mask) = chain.current("anat_mask") {
        greedy = greedy.opt_path("-gm", anat_mask);
        consumes.push("anat_mask");
    }

    let invocations: Vec<Invocation> = vec![
        Command::new(Tool::Mrtrix3, "dwiextract")
            .arg("-bzero")
            .arg("-fslgrad")
            .path(&bvec)
            .path(&bval)
            .path(&dwi)
            .path(&b0)
            .into(),
        Command::new(Tool::Mrtrix3, "mrmath")
            .path(&b0)
            .arg("mean")
            .path(&b0_avg)
            .opt("-axis", 3)
            .into(),
        greedy.into(),
        Command::new(Tool::Greedy, "c3d_affine_tool")
            .path(&ras)
            .opt_path("-oitk", &itk)
            .into(),
        Command::new(Tool::Ants, "antsApplyTransforms")
            .opt("-d", 3)
            .opt("-e", 3)
            .opt_path("-i", &dwi)
            .opt_path("-r", &t1w)
            .opt_path("-t", &itk)
            .opt_path("-o", &dwi_out)
            .into(),
        Command::new(Tool::Ants, "antsApplyTransforms")
            .opt("-d", 3)
            .opt_path("-i", &mask)
            .opt_path("-r", &t1w)
            .opt_path("-t", &itk)
            .opt("-n", "NearestNeighbor")
            .opt_path("-o", &mask_out)
            .into(),
        Builtin::RotateBvecs {
            bvec: bvec.clone(),
            matrix: ras,
            out: bvec_out.clone(),
        }
        .into(),
        Builtin::Copy {
            from: itk,
            to: xfm.clone(),
        }
        .into(),
    ];
    chain.run(
        step,
        Tool::Greedy,
        &consumes,
        vec![
            ("dwi".to_string(), dwi_out),
            ("bvec".to_string(), bvec_out),
            ("mask".to_string(), mask_out),
            ("xfm".to_string(), xfm),
        ],
        TaskAction::Run(invocations),
        settings,
    );
    Ok(())
}

fn finalize(
    chain: &mut ChainBuilder<'_>,
    ctx: &UnitContext<'_>,
    cfg: &PreprocessConfig,
    encodings: &[PhaseEncoding],
) -> Result<()> {
    let step = Step::Finalize;
    let space = if cfg.registration.skip { "" } else { "space-T1w_" };
    let desc = format!("{space}desc-preproc");

    let outputs = [
        ("dwi", chain.output("dwi", &desc, "dwi.nii.gz")),
        ("bval", chain.output("dwi", &desc, "dwi.bval")),
        ("bvec", chain.output("dwi", &desc, "dwi.bvec")),
        ("mask", chain.output("dwi", &format!("{space}desc-brain"), "mask.nii.gz")),
    ];
    let sidecar = chain.output("dwi", &desc, "dwi.json");

    let mut invocations: Vec<Invocation> = Vec::new();
    for (name, to) in &outputs {
        invocations.push(
            Builtin::Copy {
                from: chain.require(name)?,
                to: to.clone(),
            }
            .into(),
        );
    }

    let steps: Vec<&str> = [
        (Step::Denoise, cfg.denoise.skip),
        (Step::Unring, cfg.unring.skip),
        (Step::Undistort, false),
        (Step::Biascorrect, cfg.biascorrect.skip),
        (Step::Register, cfg.registration.skip),
    ]
    .iter()
    .filter(|(_, skipped)| !skipped)
    .map(|(step, _)| step.as_str())
    .collect();
    let sources: Vec<String> = ctx
        .selection
        .all("dwi")
        .iter()
        .map(|r| r.path.display().to_string())
        .collect();
    let first = &encodings[0];
    let contents = serde_json::to_string_pretty(&json!({
        "Description": "Preprocessed diffusion-weighted image",
        "PhaseEncodingDirection": first.direction,
        "TotalReadoutTime": first.readout_time,
        "SkullStripped": false,
        "Sources": sources,
        "ProcessingSteps": steps,
        "UndistortionMethod": cfg.undistort.method,
    }))?;
    invocations.push(
        Builtin::WriteText {
            path: sidecar.clone(),
            contents,
        }
        .into(),
    );

    let mut produces: Vec<(String, PathBuf)> = outputs
        .into_iter()
        .map(|(name, path)| (name.to_string(), path))
        .collect();
    produces.push(("json".to_string(), sidecar));
    chain.run(
        step,
        Tool::Builtin,
        &["dwi", "bval", "bvec", "mask"],
        produces,
        TaskAction::Run(invocations),
        serde_yaml::Value::Null,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigResolver, Overrides, Stage};
    use crate::index::{EntityIndex, EntityRecord};
    use crate::plan::{InputSource, StagePlanner};

    fn dwi(subject: &str, dir: &str, pe: &str) -> Vec<EntityRecord> {
        let stem = format!("sub-{subject}/dwi/sub-{subject}_dir-{dir}_dwi");
        let nifti = EntityRecord::new(subject, "dwi", ".nii.gz", format!("{stem}.nii.gz"))
            .with_datatype("dwi")
            .with_entity("dir", dir)
            .with_metadata("PhaseEncodingDirection", json!(pe))
            .with_metadata("TotalReadoutTime", json!(0.05));
        let bval = EntityRecord::new(subject, "dwi", ".bval", format!("{stem}.bval"))
            .with_datatype("dwi")
            .with_entity("dir", dir);
        let bvec = EntityRecord::new(subject, "dwi", ".bvec", format!("{stem}.bvec"))
            .with_datatype("dwi")
            .with_entity("dir", dir);
        vec![nifti, bval, bvec]
    }

    fn t1w(subject: &str) -> EntityRecord {
        EntityRecord::new(
            subject,
            "T1w",
            ".nii.gz",
            format!("sub-{subject}/anat/sub-{subject}_T1w.nii.gz"),
        )
        .with_datatype("anat")
    }

    fn resolve(overrides: Overrides) -> ResolvedConfig {
        ConfigResolver::new()
            .with_overrides(overrides)
            .resolve(Stage::Preprocess, "/data", "/out")
            .unwrap()
    }

    fn two_direction_index() -> EntityIndex {
        let mut records = dwi("001", "AP", "j-");
        records.extend(dwi("001", "PA", "j"));
        records.push(t1w("001"));
        EntityIndex::new("/data", records)
    }

    #[test]
    fn full_chain_is_linear_and_ordered() {
        let config = resolve(Overrides::new());
        let index = two_direction_index();
        let plan = StagePlanner::new(&config, &index).plan().unwrap();

        let steps: Vec<Step> = plan.graph.topological_order().iter().map(|t| t.step).collect();
        assert_eq!(
            steps,
            vec![
                Step::Denoise,
                Step::Unring,
                Step::Undistort,
                Step::Biascorrect,
                Step::Register,
                Step::Finalize
            ]
        );
        // every non-terminal task feeds the next one
        for task in plan.graph.tasks() {
            if task.step != Step::Finalize {
                assert!(!plan.graph.get_successors(&task.id).is_empty(), "{} is dangling", task.id);
            }
        }
        assert_eq!(plan.graph.get_final_tasks().len(), 1);
    }

    #[test]
    fn two_directions_run_topup_before_eddy() {
        let config = resolve(Overrides::new());
        let index = two_direction_index();
        let plan = StagePlanner::new(&config, &index).plan().unwrap();
        let undistort = plan.graph.task("sub-001/undistort").unwrap();

        let programs: Vec<String> = undistort
            .action
            .invocations()
            .iter()
            .filter_map(|inv| match inv {
                Invocation::Exec(cmd) => Some(cmd.program.clone()),
                Invocation::Builtin(_) => None,
            })
            .collect();
        let topup = programs.iter().position(|p| p == "topup").unwrap();
        let eddy = programs.iter().position(|p| p == "eddy").unwrap();
        assert!(topup < eddy);
        assert_eq!(undistort.tool, Tool::Fsl);
    }

    #[test]
    fn single_direction_skips_topup() {
        let config = resolve(Overrides::new());
        let mut records = dwi("001", "AP", "j-");
        records.push(t1w("001"));
        let index = EntityIndex::new("/data", records);
        let plan = StagePlanner::new(&config, &index).plan().unwrap();
        let undistort = plan.graph.task("sub-001/undistort").unwrap();
        let rendered: Vec<String> = undistort.action.invocations().iter().map(|i| i.to_string()).collect();
        assert!(!rendered.iter().any(|r| r.contains("] topup ")));
        assert!(rendered.iter().any(|r| r.contains("] eddy ")));
    }

    #[test]
    fn skipped_steps_are_passthroughs_that_keep_edges() {
        let mut overrides = Overrides::new();
        overrides.flag("preprocess.denoise.skip", true);
        overrides.flag("preprocess.biascorrect.skip", true);
        let config = resolve(overrides);
        let index = two_direction_index();
        let plan = StagePlanner::new(&config, &index).plan().unwrap();

        let denoise = plan.graph.task("sub-001/denoise").unwrap();
        assert!(denoise.is_passthrough());
        assert_eq!(denoise.outputs["dwi.0"], denoise.inputs["dwi.0"].path);

        let unring = plan.graph.task("sub-001/unring").unwrap();
        assert_eq!(
            unring.inputs["dwi.0"].source,
            InputSource::Task {
                id: denoise.id.clone()
            }
        );
        assert!(plan.graph.has_path("sub-001/denoise", "sub-001/finalize"));
        assert!(plan.graph.task("sub-001/biascorrect").unwrap().is_passthrough());
    }

    #[test]
    fn missing_dwi_skips_unit() {
        let config = resolve(Overrides::new());
        let mut records = dwi("001", "AP", "j-");
        records.push(t1w("001"));
        records.push(t1w("002"));
        let index = EntityIndex::new("/data", records);
        let plan = StagePlanner::new(&config, &index).plan().unwrap();
        let units: Vec<String> = plan.units().iter().map(ToString::to_string).collect();
        assert_eq!(units, vec!["sub-001"]);
    }

    #[test]
    fn missing_phase_encoding_fails_only_that_unit() {
        let config = resolve(Overrides::new());
        let mut records = dwi("001", "AP", "j-");
        records.push(t1w("001"));
        let mut broken = dwi("002", "AP", "j-");
        broken[0].metadata.clear();
        records.extend(broken);
        records.push(t1w("002"));
        let index = EntityIndex::new("/data", records);

        let plan = StagePlanner::new(&config, &index).plan().unwrap();
        assert_eq!(plan.units().len(), 1);
        assert_eq!(plan.failures.len(), 1);
        assert_eq!(plan.failures[0].unit.subject, "002");
        assert!(plan.failures[0].reason.contains("PhaseEncodingDirection"));
    }

    #[test]
    fn fieldmap_method_without_fieldmap_falls_back_to_topup() {
        let mut overrides = Overrides::new();
        overrides.set("preprocess.undistort.method", "fieldmap");
        let config = resolve(overrides);
        let index = two_direction_index();
        let plan = StagePlanner::new(&config, &index).plan().unwrap();
        assert_eq!(plan.units().len(), 1);
        let undistort = plan.graph.task("sub-001/undistort").unwrap();
        assert!(undistort
            .action
            .invocations()
            .iter()
            .any(|i| i.to_string().contains("] topup ")));
    }

    #[test]
    fn fugue_without_fieldmap_is_omitted() {
        let mut overrides = Overrides::new();
        overrides.set("preprocess.undistort.method", "fugue");
        let config = resolve(overrides);
        let index = two_direction_index();
        let plan = StagePlanner::new(&config, &index).plan().unwrap();
        let undistort = plan.graph.task("sub-001/undistort").unwrap();
        assert!(!undistort
            .action
            .invocations()
            .iter()
            .any(|i| i.to_string().contains("] fugue ")));
    }

    #[test]
    fn registration_metric_reaches_greedy_unchanged() {
        for metric in ["SSD", "MI", "NMI", "MAHAL"] {
            let mut overrides = Overrides::new();
            overrides.set("preprocess.registration.metric", metric);
            let config = resolve(overrides);
            let index = two_direction_index();
            let plan = StagePlanner::new(&config, &index).plan().unwrap();
            let register = plan.graph.task("sub-001/register").unwrap();

            let greedy = register
                .action
                .invocations()
                .into_iter()
                .find_map(|inv| match inv {
                    Invocation::Exec(cmd) if cmd.program == "greedy" => Some(cmd.clone()),
                    _ => None,
                })
                .unwrap();
            let at = greedy.args.iter().position(|a| a == "-m").unwrap();
            assert_eq!(greedy.args[at + 1], metric);
            assert_eq!(greedy.tool, Tool::Greedy);
            assert!(greedy.args.contains(&"-ia-identity".to_string()));
        }
    }

    #[test]
    fn registration_converts_affine_for_resampling() {
        let config = resolve(Overrides::new());
        let index = two_direction_index();
        let plan = StagePlanner::new(&config, &index).plan().unwrap();
        let register = plan.graph.task("sub-001/register").unwrap();
        let programs: Vec<String> = register
            .action
            .invocations()
            .iter()
            .filter_map(|inv| match inv {
                Invocation::Exec(cmd) => Some(cmd.program.clone()),
                Invocation::Builtin(_) => None,
            })
            .collect();
        let greedy = programs.iter().position(|p| p == "greedy").unwrap();
        let convert = programs.iter().position(|p| p == "c3d_affine_tool").unwrap();
        let apply = programs.iter().position(|p| p == "antsApplyTransforms").unwrap();
        assert!(greedy < convert && convert < apply);
    }

    #[test]
    fn planning_is_idempotent() {
        let config = resolve(Overrides::new());
        let index = two_direction_index();
        let first = StagePlanner::new(&config, &index).plan().unwrap();
        let second = StagePlanner::new(&config, &index).plan().unwrap();
        assert_eq!(first.graph, second.graph);
        assert_eq!(first.graph.edges(), second.graph.edges());
    }
}
