//! `connectivity` stage
//!
//! Either a set of atlas connectomes or one ROI-constrained tract per unit,
//! depending on which of `atlas` / `tract_query` is configured.

use tracing::warn;

use super::{series_names, ChainBuilder, Command, Invocation, Step, Task, TaskAction, UnitContext, DWI_QUERY};
use crate::config::schema::{ConnectivityConfig, ConnectivityMethod};
use crate::config::ResolvedConfig;
use crate::error::{DwiprocError, Result};
use crate::index::EntityRecord;
use crate::query::{CmpOp, Expr, InputRequest, Literal, Query};
use crate::tool::Tool;

const PREPROC: &str = "desc = 'preproc'";
const TRACTOGRAPHY_QUERY: &str =
    "suffix = 'tractography' AND ext = '.tck' AND method = 'iFOD2' AND label IS NULL";
const WEIGHTS_QUERY: &str =
    "suffix = 'tckWeights' AND ext = '.txt' AND method = 'SIFT2' AND label IS NULL";
const ATLAS_QUERY: &str = "suffix = 'dseg' AND ext IN ('.nii', '.nii.gz')";
const ROI_QUERY: &str = "ext IN ('.nii', '.nii.gz')";
const SURFACE_QUERY: &str = "suffix IN ('inflated', 'white', 'pial') AND ext = '.surf.gii'";

/// Connectome measures: `meas` entity and extra `tck2connectome` arguments
const MEASURES: &[(&str, &[&str])] = &[
    ("count", &[]),
    ("afd", &["-tck_weights_in"]),
    ("avgLength", &["-scale_length", "-stat_edge", "mean"]),
];

fn settings(config: &ResolvedConfig) -> Result<(&ConnectivityConfig, ConnectivityMethod)> {
    let cfg = config.connectivity().ok_or_else(|| DwiprocError::ConfigInvalid {
        path: "connectivity".to_string(),
        reason: "configuration was not resolved for the connectivity stage".to_string(),
    })?;
    let method = cfg.method().ok_or_else(|| DwiprocError::ConfigConflict {
        reason: "exactly one of connectivity.atlas or connectivity.tract_query is required"
            .to_string(),
    })?;
    Ok((cfg, method))
}

pub(super) fn requests(config: &ResolvedConfig) -> Result<(InputRequest, Vec<InputRequest>)> {
    let (cfg, method) = settings(config)?;

    let dwi = InputRequest::one(
        "dwi",
        Query::parse(DWI_QUERY)?
            .refine(Some(PREPROC))?
            .refine(cfg.query.dwi.as_deref())?,
    );
    let mut secondary = vec![
        InputRequest::one("tractography", Query::parse(TRACTOGRAPHY_QUERY)?),
        InputRequest::one("weights", Query::parse(WEIGHTS_QUERY)?),
    ];
    match method {
        ConnectivityMethod::Connectome { atlas } => {
            let seg = Query::from_expr(Expr::Compare {
                attr: "seg".to_string(),
                op: CmpOp::Eq,
                value: Literal::Str(atlas),
            });
            secondary.push(InputRequest::one("atlas", seg.and(Query::parse(ATLAS_QUERY)?)));
        }
        ConnectivityMethod::Tract { query } => {
            secondary.push(InputRequest::many(
                "rois",
                Query::parse(ROI_QUERY)?.refine(Some(&query))?,
            ));
            secondary.push(
                InputRequest::many(
                    "surfaces",
                    Query::parse(SURFACE_QUERY)?.refine(cfg.surface_query.as_deref())?,
                )
                .optional(),
            );
        }
    }
    Ok((dwi, secondary))
}

pub(super) fn plan_unit(ctx: &UnitContext<'_>) -> Result<Vec<Task>> {
    let (cfg, method) = settings(ctx.config)?;
    match method {
        ConnectivityMethod::Connectome { atlas } => connectome(ctx, cfg, &atlas),
        ConnectivityMethod::Tract { .. } => tract(ctx, cfg),
    }
}

fn connectome(ctx: &UnitContext<'_>, cfg: &ConnectivityConfig, atlas: &str) -> Result<Vec<Task>> {
    let step = Step::Connectome;
    let mut chain = ctx.chain();
    chain.seed("tractography", ctx.path(ctx.record("tractography")?));
    chain.seed("weights", ctx.path(ctx.record("weights")?));
    chain.seed("atlas", ctx.path(ctx.record("atlas")?));
    let tck = chain.require("tractography")?;
    let weights = chain.require("weights")?;
    let parcellation = chain.require("atlas")?;

    let mut invocations: Vec<Invocation> = Vec::new();
    let mut produces = Vec::new();
    for (meas, extra) in MEASURES {
        let out = chain.output(
            "dwi",
            &format!("seg-{atlas}_meas-{meas}_desc-probabilisticTracking"),
            "relmap.csv",
        );
        let mut cmd = Command::new(Tool::Mrtrix3, "tck2connectome")
            .opt("-assignment_radial_search", cfg.radius);
        for arg in extra.iter() {
            cmd = cmd.arg(*arg);
            if *arg == "-tck_weights_in" {
                cmd = cmd.path(&weights);
            }
        }
        invocations.push(cmd.path(&tck).path(&parcellation).path(&out).into());
        produces.push((format!("connectome_{meas}"), out));
    }

    chain.run(
        step,
        Tool::Mrtrix3,
        &["tractography", "weights", "atlas"],
        produces,
        TaskAction::Run(invocations),
        ctx.config.slice("connectivity"),
    );
    Ok(chain.finish())
}

/// `tckedit` option for an ROI, from its `desc` entity
fn roi_role(record: &EntityRecord) -> Option<&'static str> {
    let desc = record.entity("desc")?.to_ascii_lowercase();
    if ["include", "seed", "target"].iter().any(|k| desc.contains(k)) {
        Some("-include")
    } else if desc.contains("exclude") {
        Some("-exclude")
    } else if ["truncate", "stop"].iter().any(|k| desc.contains(k)) {
        Some("-mask")
    } else {
        None
    }
}

fn tract(ctx: &UnitContext<'_>, cfg: &ConnectivityConfig) -> Result<Vec<Task>> {
    let rois = ctx.selection.all("rois");
    let first = rois
        .first()
        .ok_or_else(|| ctx.error("no ROIs selected for tract extraction"))?;
    let mut entities = String::new();
    if let Some(hemi) = first.entity("hemi") {
        entities.push_str(&format!("hemi-{hemi}_"));
    }
    entities.push_str(&format!("label-{}", first.entity("label").unwrap_or("tract")));

    let mut chain = ctx.chain();
    chain.seed("dwi", ctx.path(ctx.record("dwi")?));
    chain.seed("tractography", ctx.path(ctx.record("tractography")?));
    chain.seed("weights", ctx.path(ctx.record("weights")?));
    for (i, roi) in rois.iter().enumerate() {
        chain.seed(format!("roi.{i}"), ctx.path(roi));
    }

    let step = Step::ExtractTract;
    let tck = chain.require("tractography")?;
    let weights = chain.require("weights")?;
    let tract_tck = chain.output("dwi", &format!("{entities}_method-iFOD2"), "tractography.tck");
    let tract_weights = chain.output("dwi", &format!("{entities}_method-SIFT2"), "tckWeights.txt");
    let tdi = chain.output("dwi", &format!("{entities}_meas-weighted"), "tdi.nii.gz");

    let mut edit = Command::new(Tool::Mrtrix3, "tckedit");
    let mut roles = 0;
    for (i, roi) in rois.iter().enumerate() {
        match roi_role(roi) {
            Some(flag) => {
                edit = edit.opt_path(flag, &chain.require(&format!("roi.{i}"))?);
                roles += 1;
            }
            None => warn!(unit = %ctx.unit(), roi = %roi.path.display(), "ROI has no include/exclude/stop role - ignoring"),
        }
    }
    if roles == 0 {
        return Err(ctx.error("no ROI carries an include, exclude or stop role"));
    }
    let template = chain.require("roi.0")?;
    let invocations: Vec<Invocation> = vec![
        edit.opt_path("-tck_weights_in", &weights)
            .opt_path("-tck_weights_out", &tract_weights)
            .path(&tck)
            .path(&tract_tck)
            .into(),
        Command::new(Tool::Mrtrix3, "tckmap")
            .opt_some("-vox", cfg.voxel_size)
            .opt_path("-tck_weights_in", &tract_weights)
            .opt_path("-template", &template)
            .path(&tract_tck)
            .path(&tdi)
            .into(),
    ];
    let mut consumes = vec!["tractography".to_string(), "weights".to_string()];
    consumes.extend(series_names("roi", rois.len()));
    chain.run(
        step,
        Tool::Mrtrix3,
        &consumes,
        vec![
            ("tract".to_string(), tract_tck),
            ("tract_weights".to_string(), tract_weights),
            ("tdi".to_string(), tdi),
        ],
        TaskAction::Run(invocations),
        ctx.config.slice("connectivity"),
    );

    surface_map(&mut chain, ctx, first.entity("hemi"), &entities)?;
    Ok(chain.finish())
}

fn surface_map(
    chain: &mut ChainBuilder<'_>,
    ctx: &UnitContext<'_>,
    hemi: Option<&str>,
    entities: &str,
) -> Result<()> {
    let surface = |suffix: &str| {
        ctx.selection
            .all("surfaces")
            .iter()
            .find(|s| s.suffix == suffix && (hemi.is_none() || s.entity("hemi") == hemi))
    };
    let (Some(inflated), Some(white), Some(pial)) =
        (surface("inflated"), surface("white"), surface("pial"))
    else {
        warn!(unit = %ctx.unit(), "Inflated surface not found; not mapping end points");
        return Ok(());
    };
    for (name, record) in [("inflated", inflated), ("white", white), ("pial", pial)] {
        chain.seed(name, ctx.path(record));
    }

    let tdi = chain.require("tdi")?;
    let inflated = chain.require("inflated")?;
    let white = chain.require("white")?;
    let pial = chain.require("pial")?;
    let out = chain.output("dwi", &format!("{entities}_meas-weighted"), "tdi.shape.gii");
    let invocation = Command::new(Tool::Workbench, "wb_command")
        .arg("-volume-to-surface-mapping")
        .path(&tdi)
        .path(&inflated)
        .path(&out)
        .arg("-ribbon-constrained")
        .path(&white)
        .path(&pial);
    chain.run(
        Step::SurfaceMap,
        Tool::Workbench,
        &["tdi", "inflated", "white", "pial"],
        vec![("surface_tdi".to_string(), out)],
        TaskAction::Run(vec![invocation.into()]),
        serde_yaml::Value::Null,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigResolver, Overrides, Stage};
    use crate::index::EntityIndex;
    use crate::plan::StagePlanner;

    fn reconstructed(subject: &str) -> Vec<EntityRecord> {
        let dir = format!("sub-{subject}/dwi");
        vec![
            EntityRecord::new(
                subject,
                "dwi",
                ".nii.gz",
                format!("{dir}/sub-{subject}_desc-preproc_dwi.nii.gz"),
            )
            .with_datatype("dwi")
            .with_entity("desc", "preproc"),
            EntityRecord::new(
                subject,
                "tractography",
                ".tck",
                format!("{dir}/sub-{subject}_method-iFOD2_tractography.tck"),
            )
            .with_datatype("dwi")
            .with_entity("method", "iFOD2"),
            EntityRecord::new(
                subject,
                "tckWeights",
                ".txt",
                format!("{dir}/sub-{subject}_method-SIFT2_tckWeights.txt"),
            )
            .with_datatype("dwi")
            .with_entity("method", "SIFT2"),
        ]
    }

    fn atlas(subject: &str, seg: &str) -> EntityRecord {
        EntityRecord::new(
            subject,
            "dseg",
            ".nii.gz",
            format!("sub-{subject}/anat/sub-{subject}_seg-{seg}_dseg.nii.gz"),
        )
        .with_datatype("anat")
        .with_entity("seg", seg)
    }

    fn roi(subject: &str, desc: &str) -> EntityRecord {
        EntityRecord::new(
            subject,
            "mask",
            ".nii.gz",
            format!("sub-{subject}/anat/sub-{subject}_hemi-L_label-cst_desc-{desc}_mask.nii.gz"),
        )
        .with_datatype("anat")
        .with_entity("hemi", "L")
        .with_entity("label", "cst")
        .with_entity("desc", desc)
    }

    fn surface(subject: &str, suffix: &str) -> EntityRecord {
        EntityRecord::new(
            subject,
            suffix,
            ".surf.gii",
            format!("sub-{subject}/anat/sub-{subject}_hemi-L_{suffix}.surf.gii"),
        )
        .with_datatype("anat")
        .with_entity("hemi", "L")
    }

    fn resolve(key: &str, value: &str) -> ResolvedConfig {
        let mut overrides = Overrides::new();
        overrides.set(key, value);
        ConfigResolver::new()
            .with_overrides(overrides)
            .resolve(Stage::Connectivity, "/data", "/out")
            .unwrap()
    }

    #[test]
    fn connectome_runs_every_measure() {
        let config = resolve("connectivity.atlas", "Markov91");
        let mut records = reconstructed("001");
        records.push(atlas("001", "Markov91"));
        records.push(atlas("001", "Other"));
        let index = EntityIndex::new("/data", records);
        let plan = StagePlanner::new(&config, &index).plan().unwrap();

        let task = plan.graph.task("sub-001/connectome").unwrap();
        assert_eq!(task.action.invocations().len(), 3);
        let afd = &task.outputs["connectome_afd"];
        assert!(afd.ends_with("sub-001_seg-Markov91_meas-afd_desc-probabilisticTracking_relmap.csv"));
        let weighted = task.action.invocations()[1].to_string();
        assert!(weighted.contains("-tck_weights_in /data/sub-001/dwi/sub-001_method-SIFT2_tckWeights.txt"));
        assert!(weighted.contains("-assignment_radial_search 2"));
    }

    #[test]
    fn tract_outputs_are_not_whole_brain_inputs() {
        let config = resolve("connectivity.atlas", "Markov91");
        let mut records = reconstructed("001");
        records.push(atlas("001", "Markov91"));
        records.push(
            EntityRecord::new(
                "001",
                "tractography",
                ".tck",
                "sub-001/dwi/sub-001_label-cst_method-iFOD2_tractography.tck",
            )
            .with_datatype("dwi")
            .with_entity("method", "iFOD2")
            .with_entity("label", "cst"),
        );
        let index = EntityIndex::new("/data", records);
        let plan = StagePlanner::new(&config, &index).plan().unwrap();
        assert!(!plan.has_ambiguity());
        assert_eq!(plan.units().len(), 1);
    }

    #[test]
    fn tract_assigns_roi_roles() {
        let config = resolve("connectivity.tract_query", "label == 'cst'");
        let mut records = reconstructed("001");
        records.push(roi("001", "include"));
        records.push(roi("001", "exclude"));
        records.push(roi("001", "stop"));
        let index = EntityIndex::new("/data", records);
        let plan = StagePlanner::new(&config, &index).plan().unwrap();

        let task = plan.graph.task("sub-001/extract_tract").unwrap();
        let edit = match task.action.invocations()[0] {
            Invocation::Exec(cmd) => cmd.to_string(),
            Invocation::Builtin(_) => panic!("expected tckedit"),
        };
        assert!(edit.contains("-exclude /data/sub-001/anat/sub-001_hemi-L_label-cst_desc-exclude_mask.nii.gz"));
        assert!(edit.contains("-include /data/sub-001/anat/sub-001_hemi-L_label-cst_desc-include_mask.nii.gz"));
        assert!(edit.contains("-mask /data/sub-001/anat/sub-001_hemi-L_label-cst_desc-stop_mask.nii.gz"));
        assert!(task.outputs["tract"].ends_with("sub-001_hemi-L_label-cst_method-iFOD2_tractography.tck"));
        // no surfaces selected
        assert!(plan.graph.task("sub-001/surface_map").is_none());
    }

    #[test]
    fn tract_without_rois_skips_unit() {
        let config = resolve("connectivity.tract_query", "label == 'cst'");
        let index = EntityIndex::new("/data", reconstructed("001"));
        let plan = StagePlanner::new(&config, &index).plan().unwrap();
        assert!(plan.graph.is_empty());
        assert_eq!(plan.issues.len(), 1);
    }

    #[test]
    fn surfaces_add_mapping_after_extraction() {
        let config = resolve("connectivity.tract_query", "label == 'cst'");
        let mut records = reconstructed("001");
        records.push(roi("001", "seed"));
        for suffix in ["inflated", "white", "pial"] {
            records.push(surface("001", suffix));
        }
        let index = EntityIndex::new("/data", records);
        let plan = StagePlanner::new(&config, &index).plan().unwrap();

        let mapping = plan.graph.task("sub-001/surface_map").unwrap();
        assert_eq!(mapping.tool, Tool::Workbench);
        assert!(plan.graph.has_path("sub-001/extract_tract", "sub-001/surface_map"));
    }
}
