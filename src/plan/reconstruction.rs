//! `reconstruction` stage: tensor metrics, FODs and whole-brain tractography

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use tracing::debug;

use super::{ChainBuilder, Command, Fallback, Invocation, Step, Task, TaskAction, UnitContext, DWI_QUERY};
use crate::config::schema::{ReconstructionConfig, TractographyMethod};
use crate::config::ResolvedConfig;
use crate::error::{DwiprocError, Result};
use crate::query::{InputRequest, Query};
use crate::tool::Tool;

const PREPROC: &str = "desc = 'preproc'";
const MASK_QUERY: &str = "suffix = 'mask' AND datatype = 'dwi' AND ext IN ('.nii', '.nii.gz')";
const FIVE_TT_QUERY: &str =
    "suffix = 'dseg' AND desc = '5tt' AND ext IN ('.nii', '.nii.gz', '.mif')";

const SS3T_FALLBACK: &str = "Unable to perform SS3T, trying SS2T (WM+CSF)";

fn settings(config: &ResolvedConfig) -> Result<&ReconstructionConfig> {
    config.reconstruction().ok_or_else(|| DwiprocError::ConfigInvalid {
        path: "reconstruction".to_string(),
        reason: "configuration was not resolved for the reconstruction stage".to_string(),
    })
}

pub(super) fn requests(config: &ResolvedConfig) -> Result<(InputRequest, Vec<InputRequest>)> {
    let cfg = settings(config)?;
    let query = &cfg.query;

    let dwi = InputRequest::one(
        "dwi",
        Query::parse(DWI_QUERY)?
            .refine(Some(PREPROC))?
            .refine(query.dwi.as_deref())?,
    )
    .with_companions(&[".bval", ".bvec"]);

    let secondary = vec![
        InputRequest::one("mask", Query::parse(MASK_QUERY)?.refine(query.mask.as_deref())?),
        InputRequest::one("5tt", Query::parse(FIVE_TT_QUERY)?)
            .required_if(cfg.tractography.method == TractographyMethod::Act),
    ];
    Ok((dwi, secondary))
}

pub(super) fn plan_unit(ctx: &UnitContext<'_>) -> Result<Vec<Task>> {
    let cfg = settings(ctx.config)?;

    let mut chain = ctx.chain();
    chain.seed("dwi", ctx.path(ctx.record("dwi")?));
    chain.seed("bval", ctx.companion("dwi", ".bval", 0)?);
    chain.seed("bvec", ctx.companion("dwi", ".bvec", 0)?);
    chain.seed("mask", ctx.path(ctx.record("mask")?));
    if let Some(five_tt) = ctx.selection.one("5tt") {
        chain.seed("5tt", ctx.path(five_tt));
    }

    tensor(&mut chain, ctx)?;
    fod(&mut chain, ctx, cfg)?;
    tractography(&mut chain, ctx, cfg)?;
    Ok(chain.finish())
}

fn tensor(chain: &mut ChainBuilder<'_>, ctx: &UnitContext<'_>) -> Result<()> {
    let step = Step::Tensor;
    let dwi = chain.require("dwi")?;
    let bval = chain.require("bval")?;
    let bvec = chain.require("bvec")?;
    let mask = chain.require("mask")?;
    let tensor = chain.scratch(step, "model-tensor", "dwimap.nii.gz");

    let param = |name: &str| chain.output("dwi", &format!("model-tensor_param-{name}"), "dwimap.nii.gz");
    let maps = [
        ("fa", "-fa", param("fa")),
        ("md", "-adc", param("md")),
        ("rd", "-rd", param("rd")),
        ("ad", "-ad", param("ad")),
        ("s1", "-value", param("s1")),
        ("v1", "-vector", param("v1")),
    ];

    let mut metrics = Command::new(Tool::Mrtrix3, "tensor2metric").opt_path("-mask", &mask);
    for (_, flag, path) in &maps {
        metrics = metrics.opt_path(flag, path);
    }
    let invocations: Vec<Invocation> = vec![
        Command::new(Tool::Mrtrix3, "dwi2tensor")
            .arg("-fslgrad")
            .path(&bvec)
            .path(&bval)
            .opt_path("-mask", &mask)
            .path(&dwi)
            .path(&tensor)
            .into(),
        metrics.opt("-num", 1).path(&tensor).into(),
    ];
    chain.run(
        step,
        Tool::Mrtrix3,
        &["dwi", "bval", "bvec", "mask"],
        maps.into_iter()
            .map(|(name, _, path)| (format!("tensor_{name}"), path))
            .collect(),
        TaskAction::Run(invocations),
        serde_yaml::Value::Null,
    );
    Ok(())
}

/// Distinct non-zero shells in a bval file (rounded to the nearest 100)
///
/// `None` when the file cannot be read or parsed.
pub(crate) fn shell_count(bval: &Path, b0_thresh: u32) -> Option<usize> {
    let text = fs::read_to_string(bval).ok()?;
    let mut shells = BTreeSet::new();
    for token in text.split_whitespace() {
        let b: f64 = token.parse().ok()?;
        if b > f64::from(b0_thresh) {
            shells.insert(((b / 100.0).round() * 100.0) as u64);
        }
    }
    Some(shells.len())
}

fn fod(chain: &mut ChainBuilder<'_>, ctx: &UnitContext<'_>, cfg: &ReconstructionConfig) -> Result<()> {
    let step = Step::Fod;
    let tract = &cfg.tractography;
    let settings = ctx.config.slice("reconstruction.tractography");
    if tract.skip {
        chain.passthrough(step, &["dwi", "mask"], settings);
        return Ok(());
    }

    let dwi = chain.require("dwi")?;
    let bval = chain.require("bval")?;
    let bvec = chain.require("bvec")?;
    let mask = chain.require("mask")?;
    let single_shell = tract.single_shell
        || shell_count(&bval, ctx.config.opts.b0_thresh) == Some(1);
    debug!(unit = %ctx.unit(), single_shell, "FOD model");

    let mif = chain.scratch(step, "", "dwi.mif");
    let response = |tissue: &str| chain.scratch(step, &format!("model-dhollander_param-{tissue}"), "response.txt");
    let raw = |tissue: &str| chain.scratch(step, &format!("model-csd_param-{tissue}"), "dwimap.mif");
    let normalized = |tissue: &str| {
        chain.output("dwi", &format!("model-csd_param-{tissue}_desc-normalized"), "dwimap.mif")
    };
    let (wm_resp, gm_resp, csf_resp) = (response("wm"), response("gm"), response("csf"));
    let (wm_raw, gm_raw, csf_raw) = (raw("wm"), raw("gm"), raw("csf"));
    let (wm_fod, gm_fod, csf_fod) = (normalized("wm"), normalized("gm"), normalized("csf"));

    let join = |values: &[u32]| values.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");
    let prepare: Vec<Invocation> = vec![
        Command::new(Tool::Mrtrix3, "mrconvert")
            .arg("-fslgrad")
            .path(&bvec)
            .path(&bval)
            .path(&dwi)
            .path(&mif)
            .into(),
        Command::new(Tool::Mrtrix3, "dwi2response")
            .arg("dhollander")
            .opt_path("-mask", &mask)
            .opt_some("-shells", tract.shells.as_deref().map(join))
            .opt_some("-lmax", tract.lmax.as_deref().map(join))
            .path(&mif)
            .path(&wm_resp)
            .path(&gm_resp)
            .path(&csf_resp)
            .into(),
    ];

    let two_tissue = |tool: Tool, program: &str, algorithm: Option<&str>| -> Vec<Invocation> {
        let mut fod = Command::new(tool, program).opt_path("-mask", &mask);
        if let Some(algorithm) = algorithm {
            fod = fod.arg(algorithm);
        }
        vec![
            fod.path(&mif)
                .path(&wm_resp)
                .path(&wm_raw)
                .path(&csf_resp)
                .path(&csf_raw)
                .into(),
            Command::new(Tool::Mrtrix3, "mtnormalise")
                .opt_path("-mask", &mask)
                .path(&wm_raw)
                .path(&wm_fod)
                .path(&csf_raw)
                .path(&csf_fod)
                .into(),
        ]
    };
    let three_tissue = |tool: Tool, program: &str, algorithm: Option<&str>| -> Vec<Invocation> {
        let mut fod = Command::new(tool, program).opt_path("-mask", &mask);
        if let Some(algorithm) = algorithm {
            fod = fod.arg(algorithm);
        }
        vec![
            fod.path(&mif)
                .path(&wm_resp)
                .path(&wm_raw)
                .path(&gm_resp)
                .path(&gm_raw)
                .path(&csf_resp)
                .path(&csf_raw)
                .into(),
            Command::new(Tool::Mrtrix3, "mtnormalise")
                .opt_path("-mask", &mask)
                .path(&wm_raw)
                .path(&wm_fod)
                .path(&gm_raw)
                .path(&gm_fod)
                .path(&csf_raw)
                .path(&csf_fod)
                .into(),
        ]
    };

    let mut produces = vec![
        ("wm_fod".to_string(), wm_fod.clone()),
        ("csf_fod".to_string(), csf_fod.clone()),
    ];
    let (tool, action) = if single_shell {
        let mut primary = prepare.clone();
        primary.extend(three_tissue(Tool::Mrtrix3Tissue, "ss3t_csd_beta1", None));
        let mut fallback = prepare;
        fallback.extend(two_tissue(Tool::Mrtrix3, "dwi2fod", Some("msmt_csd")));
        (
            Tool::Mrtrix3Tissue,
            TaskAction::RunWithFallback {
                primary,
                fallback: Fallback {
                    reason: SS3T_FALLBACK.to_string(),
                    substitute: "msmt_csd (WM+CSF)".to_string(),
                    invocations: fallback,
                },
            },
        )
    } else {
        let mut invocations = prepare;
        invocations.extend(three_tissue(Tool::Mrtrix3, "dwi2fod", Some("msmt_csd")));
        produces.push(("gm_fod".to_string(), gm_fod.clone()));
        (Tool::Mrtrix3, TaskAction::Run(invocations))
    };

    chain.run(step, tool, &["dwi", "bval", "bvec", "mask"], produces, action, settings);
    Ok(())
}

fn tractography(chain: &mut ChainBuilder<'_>, ctx: &UnitContext<'_>, cfg: &ReconstructionConfig) -> Result<()> {
    let step = Step::Tractography;
    let tract = &cfg.tractography;
    let settings = ctx.config.slice("reconstruction.tractography");
    if tract.skip {
        chain.passthrough(step, &["dwi", "mask"], settings);
        return Ok(());
    }

    let dwi = chain.require("dwi")?;
    let mask = chain.require("mask")?;
    let wm_fod = chain.require("wm_fod")?;
    let tck = chain.output("dwi", "method-iFOD2", "tractography.tck");
    let weights = chain.output("dwi", "method-SIFT2", "tckWeights.txt");
    let tdi = chain.output("dwi", "meas-weighted", "tdi.nii.gz");

    let mut invocations: Vec<Invocation> = Vec::new();
    let mut consumes = vec!["dwi", "mask", "wm_fod"];
    let mut tckgen = Command::new(Tool::Mrtrix3, "tckgen").opt("-algorithm", "iFOD2");
    let mut sift = Command::new(Tool::Mrtrix3, "tcksift2");

    match tract.method {
        TractographyMethod::Wm => {
            tckgen = tckgen.opt_path("-seed_dynamic", &wm_fod).opt_path("-mask", &mask);
        }
        TractographyMethod::Act => {
            let five_tt = chain.require("5tt")?;
            let gmwmi = chain.scratch(step, "desc-gmwmi", "mask.nii.gz");
            invocations.push(
                Command::new(Tool::Mrtrix3, "5tt2gmwmi")
                    .path(&five_tt)
                    .path(&gmwmi)
                    .into(),
            );
            tckgen = tckgen
                .opt_path("-act", &five_tt)
                .opt_path("-seed_gmwmi", &gmwmi)
                .flag_if(tract.act.backtrack, "-backtrack")
                .flag_if(!tract.act.no_crop_gmwmi, "-crop_at_gmwmi");
            sift = sift.opt_path("-act", &five_tt);
            consumes.push("5tt");
        }
    }

    invocations.push(
        tckgen
            .opt_some("-step", tract.steps)
            .opt("-cutoff", tract.cutoff)
            .opt("-select", tract.streamlines)
            .opt_some("-maxlength", tract.max_length)
            .path(&wm_fod)
            .path(&tck)
            .into(),
    );
    invocations.push(sift.path(&tck).path(&wm_fod).path(&weights).into());
    invocations.push(
        Command::new(Tool::Mrtrix3, "tckmap")
            .opt_path("-tck_weights_in", &weights)
            .opt_path("-template", &dwi)
            .path(&tck)
            .path(&tdi)
            .into(),
    );

    chain.run(
        step,
        Tool::Mrtrix3,
        &consumes,
        vec![
            ("tractography".to_string(), tck),
            ("weights".to_string(), weights),
            ("tdi".to_string(), tdi),
        ],
        TaskAction::Run(invocations),
        settings,
    );
    Ok(())
}
