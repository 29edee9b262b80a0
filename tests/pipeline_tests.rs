//! Orchestrator tests with an injected TaskRunner
//!
//! The mock records every task it is asked to run and fails or degrades the
//! tasks it is told to, so unit isolation and exit codes can be checked
//! without any external tool installed.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

use nhp_dwiproc::error::exit_code;
use nhp_dwiproc::plan::TaskAction;
use nhp_dwiproc::{
    ConfigResolver, DwiprocError, EntityIndex, EntityRecord, EventKind, Orchestrator, Overrides,
    ResolvedConfig, Stage, StagePlanner, Task, TaskOutcome, TaskResult, TaskRunner, UnitOutcome,
};

// ═══════════════════════════════════════════════════════════════
// Fixtures
// ═══════════════════════════════════════════════════════════════

#[derive(Default)]
struct RecordingRunner {
    /// Task ids whose execution fails
    fail: BTreeSet<String>,
    calls: Mutex<Vec<String>>,
}

impl RecordingRunner {
    fn failing(ids: &[&str]) -> Self {
        Self {
            fail: ids.iter().map(|id| id.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl TaskRunner for RecordingRunner {
    fn name(&self) -> &str {
        "recording"
    }

    async fn execute(&self, task: &Task) -> TaskResult {
        self.calls.lock().push(task.id.to_string());
        let outcome = if self.fail.contains(task.id.as_ref()) {
            TaskOutcome::Failed {
                reason: format!("{} exited with 1", task.step),
            }
        } else {
            match &task.action {
                TaskAction::Passthrough => TaskOutcome::Passthrough,
                TaskAction::Run(_) => TaskOutcome::Success,
                // primary model always fails here; the fallback works
                TaskAction::RunWithFallback { fallback, .. } => TaskOutcome::Degraded {
                    reason: fallback.reason.clone(),
                    substitute: fallback.substitute.clone(),
                },
            }
        };
        TaskResult::new(task, outcome, Duration::ZERO)
    }
}

/// Runner whose execution panics for one unit
struct PanickingRunner {
    subject: &'static str,
}

#[async_trait]
impl TaskRunner for PanickingRunner {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn execute(&self, task: &Task) -> TaskResult {
        if task.id.starts_with(&format!("sub-{}/", self.subject)) {
            panic!("runner crashed on {}", task.id);
        }
        TaskResult::new(task, TaskOutcome::Success, Duration::ZERO)
    }
}

fn preprocess_records(subject: &str) -> Vec<EntityRecord> {
    let stem = format!("sub-{subject}/dwi/sub-{subject}_dwi");
    let dwi = |ext: &str| EntityRecord::new(subject, "dwi", ext, format!("{stem}{ext}")).with_datatype("dwi");
    vec![
        dwi(".nii.gz")
            .with_metadata("PhaseEncodingDirection", json!("j-"))
            .with_metadata("TotalReadoutTime", json!(0.05)),
        dwi(".bval"),
        dwi(".bvec"),
        EntityRecord::new(
            subject,
            "T1w",
            ".nii.gz",
            format!("sub-{subject}/anat/sub-{subject}_T1w.nii.gz"),
        )
        .with_datatype("anat"),
    ]
}

fn reconstruction_records(subject: &str) -> Vec<EntityRecord> {
    let dir = format!("sub-{subject}/dwi");
    let stem = format!("{dir}/sub-{subject}_space-T1w_desc-preproc_dwi");
    let dwi = |ext: &str| {
        EntityRecord::new(subject, "dwi", ext, format!("{stem}{ext}"))
            .with_datatype("dwi")
            .with_entity("space", "T1w")
            .with_entity("desc", "preproc")
    };
    let mask = EntityRecord::new(
        subject,
        "mask",
        ".nii.gz",
        format!("{dir}/sub-{subject}_space-T1w_desc-brain_mask.nii.gz"),
    )
    .with_datatype("dwi")
    .with_entity("desc", "brain");
    vec![dwi(".nii.gz"), dwi(".bval"), dwi(".bvec"), mask]
}

fn resolve(stage: Stage, input: &Path, output: &Path, overrides: Overrides) -> Arc<ResolvedConfig> {
    Arc::new(
        ConfigResolver::new()
            .with_overrides(overrides)
            .resolve(stage, input, output)
            .unwrap(),
    )
}

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

// ═══════════════════════════════════════════════════════════════
// Unit isolation
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn tool_failure_aborts_only_its_unit() {
    let out = TempDir::new().unwrap();
    let mut records = preprocess_records("001");
    records.extend(preprocess_records("002"));
    let index = EntityIndex::new("/data", records);
    let mut overrides = Overrides::new();
    overrides.set("opts.threads", 2);
    let config = resolve(Stage::Preprocess, Path::new("/data"), out.path(), overrides);
    let plan = StagePlanner::new(&config, &index).plan().unwrap();

    let runner = Arc::new(RecordingRunner::failing(&["sub-002/undistort"]));
    let orchestrator = Orchestrator::new(Arc::clone(&config)).with_runner(runner.clone());
    let report = orchestrator.execute(&plan).await.unwrap();

    let outcomes: Vec<&UnitOutcome> = report.units.values().collect();
    assert!(outcomes[0].is_completed());
    assert_eq!(
        outcomes[1],
        &UnitOutcome::Failed {
            task_id: Some("sub-002/undistort".to_string()),
            reason: "undistort exited with 1".to_string(),
        }
    );
    assert_eq!(report.exit_code(), exit_code::SUCCESS);

    let calls = runner.calls();
    assert!(calls.contains(&"sub-001/finalize".to_string()));
    assert!(!calls.iter().any(|id| id == "sub-002/biascorrect" || id == "sub-002/finalize"));

    let aborted = orchestrator.events().filter_task("sub-002/finalize");
    assert!(matches!(aborted[0].kind, EventKind::TaskAborted { .. }));
}

#[tokio::test]
async fn chains_run_in_dependency_order() {
    let out = TempDir::new().unwrap();
    let index = EntityIndex::new("/data", preprocess_records("001"));
    let config = resolve(Stage::Preprocess, Path::new("/data"), out.path(), Overrides::new());
    let plan = StagePlanner::new(&config, &index).plan().unwrap();

    let runner = Arc::new(RecordingRunner::default());
    let orchestrator = Orchestrator::new(config).with_runner(runner.clone());
    orchestrator.execute(&plan).await.unwrap();

    let steps: Vec<String> = runner
        .calls()
        .iter()
        .map(|id| id.rsplit('/').next().unwrap_or_default().to_string())
        .collect();
    assert_eq!(
        steps,
        vec!["denoise", "unring", "undistort", "biascorrect", "register", "finalize"]
    );
}

#[tokio::test]
async fn every_unit_failing_exits_one() {
    let out = TempDir::new().unwrap();
    let mut records = preprocess_records("001");
    records.extend(preprocess_records("002"));
    let index = EntityIndex::new("/data", records);
    let config = resolve(Stage::Preprocess, Path::new("/data"), out.path(), Overrides::new());
    let plan = StagePlanner::new(&config, &index).plan().unwrap();

    let runner = Arc::new(RecordingRunner::failing(&["sub-001/denoise", "sub-002/denoise"]));
    let report = Orchestrator::new(config)
        .with_runner(runner)
        .execute(&plan)
        .await
        .unwrap();
    assert_eq!(report.failed(), 2);
    assert_eq!(report.exit_code(), exit_code::FAILURE);
}

#[tokio::test]
async fn missing_dwi_is_skipped_not_failed() {
    let out = TempDir::new().unwrap();
    let mut records = preprocess_records("001");
    // subject 002 only has an anatomical image
    records.push(
        EntityRecord::new("002", "T1w", ".nii.gz", "sub-002/anat/sub-002_T1w.nii.gz").with_datatype("anat"),
    );
    let index = EntityIndex::new("/data", records);
    let config = resolve(Stage::Preprocess, Path::new("/data"), out.path(), Overrides::new());
    let plan = StagePlanner::new(&config, &index).plan().unwrap();

    let report = Orchestrator::new(config)
        .with_runner(Arc::new(RecordingRunner::default()))
        .execute(&plan)
        .await
        .unwrap();
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.exit_code(), exit_code::SUCCESS);
}

#[tokio::test]
async fn ambiguous_unit_exits_three_while_siblings_run() {
    let out = TempDir::new().unwrap();
    let mut records = preprocess_records("001");
    records.extend(preprocess_records("002"));
    records.push(
        EntityRecord::new("002", "T1w", ".nii.gz", "sub-002/anat/sub-002_acq-fast_T1w.nii.gz")
            .with_datatype("anat")
            .with_entity("acq", "fast"),
    );
    let index = EntityIndex::new("/data", records);
    let config = resolve(Stage::Preprocess, Path::new("/data"), out.path(), Overrides::new());
    let plan = StagePlanner::new(&config, &index).plan().unwrap();
    assert!(plan.has_ambiguity());

    let runner = Arc::new(RecordingRunner::default());
    let report = Orchestrator::new(config)
        .with_runner(runner.clone())
        .execute(&plan)
        .await
        .unwrap();
    assert_eq!(report.exit_code(), exit_code::AMBIGUITY);
    assert_eq!(report.succeeded(), 1);
    assert!(runner.calls().iter().all(|id| id.starts_with("sub-001/")));
}

#[tokio::test]
async fn panicking_runner_marks_its_unit_failed() {
    let out = TempDir::new().unwrap();
    let mut records = preprocess_records("001");
    records.extend(preprocess_records("002"));
    let index = EntityIndex::new("/data", records);
    let config = resolve(Stage::Preprocess, Path::new("/data"), out.path(), Overrides::new());
    let plan = StagePlanner::new(&config, &index).plan().unwrap();

    let report = Orchestrator::new(config)
        .with_runner(Arc::new(PanickingRunner { subject: "002" }))
        .execute(&plan)
        .await
        .unwrap();
    assert_eq!(report.units.len(), 2);
    assert_eq!((report.succeeded(), report.failed()), (1, 1));
    let outcomes: Vec<&UnitOutcome> = report.units.values().collect();
    assert!(matches!(
        outcomes[1],
        UnitOutcome::Failed { task_id: None, reason } if reason.contains("panicked")
    ));
}

#[tokio::test]
async fn panic_in_only_unit_exits_one() {
    let out = TempDir::new().unwrap();
    let index = EntityIndex::new("/data", preprocess_records("001"));
    let config = resolve(Stage::Preprocess, Path::new("/data"), out.path(), Overrides::new());
    let plan = StagePlanner::new(&config, &index).plan().unwrap();

    let report = Orchestrator::new(config)
        .with_runner(Arc::new(PanickingRunner { subject: "001" }))
        .execute(&plan)
        .await
        .unwrap();
    assert_eq!(report.failed(), 1);
    assert_eq!(report.exit_code(), exit_code::FAILURE);
}

// ═══════════════════════════════════════════════════════════════
// Degradation
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn single_shell_fallback_completes_degraded() {
    let out = TempDir::new().unwrap();
    let index = EntityIndex::new("/data", reconstruction_records("001"));
    let mut overrides = Overrides::new();
    overrides.flag("reconstruction.tractography.single_shell", true);
    let config = resolve(Stage::Reconstruction, Path::new("/data"), out.path(), overrides);
    let plan = StagePlanner::new(&config, &index).plan().unwrap();

    let orchestrator = Orchestrator::new(config).with_runner(Arc::new(RecordingRunner::default()));
    let report = orchestrator.execute(&plan).await.unwrap();

    let outcome = report.units.values().next().unwrap();
    assert_eq!(
        outcome,
        &UnitOutcome::Completed {
            degraded: vec!["sub-001/fod".to_string()]
        }
    );
    assert_eq!(report.exit_code(), exit_code::SUCCESS);
    let fod_events = orchestrator.events().filter_task("sub-001/fod");
    assert!(fod_events
        .iter()
        .any(|e| matches!(&e.kind, EventKind::TaskDegraded { .. })));
}

// ═══════════════════════════════════════════════════════════════
// Preflight and artifacts
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn unresolved_singularity_image_fails_before_any_task() {
    let out = TempDir::new().unwrap();
    let index = EntityIndex::new("/data", preprocess_records("001"));
    let mut overrides = Overrides::new();
    overrides.set("opts.runner.name", "singularity");
    let config = resolve(Stage::Preprocess, Path::new("/data"), out.path(), overrides);
    let plan = StagePlanner::new(&config, &index).plan().unwrap();

    // default runner: the configured singularity backend
    let orchestrator = Orchestrator::new(config);
    let err = orchestrator.execute(&plan).await.unwrap_err();
    assert!(matches!(err, DwiprocError::ImageUnresolved { .. }));
    assert_eq!(err.exit_code(), exit_code::CONFIGURATION);
    assert!(orchestrator
        .events()
        .events()
        .iter()
        .all(|e| e.kind.task_id().is_none()));
}

#[tokio::test]
async fn index_stage_artifact_is_loaded_by_later_stages() {
    let data = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    write(data.path(), "sub-01/dwi/sub-01_dwi.nii.gz", "");
    write(data.path(), "sub-01/dwi/sub-01_dwi.bval", "0 1000\n");
    write(data.path(), "sub-01/dwi/sub-01_dwi.bvec", "0 1\n0 0\n0 0\n");
    write(
        data.path(),
        "sub-01/dwi/sub-01_dwi.json",
        r#"{"PhaseEncodingDirection": "j-", "TotalReadoutTime": 0.05}"#,
    );
    write(data.path(), "sub-01/anat/sub-01_T1w.nii.gz", "");

    let index_config = resolve(Stage::Index, data.path(), out.path(), Overrides::new());
    let report = Orchestrator::new(Arc::clone(&index_config)).run().await.unwrap();
    assert_eq!(report.exit_code(), exit_code::SUCCESS);
    assert!(index_config.index_path().exists());
    assert!(out.path().join("logs/index_events.json").exists());
    // working directory is removed after a clean run
    assert!(!out.path().join("dwiproc_tmp").exists());

    let config = resolve(Stage::Preprocess, data.path(), out.path(), Overrides::new());
    let orchestrator = Orchestrator::new(config);
    let loaded = orchestrator.load_index().await.unwrap();
    assert!(loaded
        .records()
        .iter()
        .any(|r| r.suffix == "dwi" && r.metadata_str("PhaseEncodingDirection") == Some("j-")));

    let plan = orchestrator.plan().await.unwrap();
    assert_eq!(plan.units().len(), 1);
    assert!(plan.graph.task("sub-01/finalize").is_some());
}

#[tokio::test]
async fn finish_writes_descriptor_and_event_log() {
    let out = TempDir::new().unwrap();
    let index = EntityIndex::new("/data", reconstruction_records("001"));
    let config = resolve(Stage::Reconstruction, Path::new("/data"), out.path(), Overrides::new());
    let plan = StagePlanner::new(&config, &index).plan().unwrap();

    let orchestrator = Orchestrator::new(config).with_runner(Arc::new(RecordingRunner::default()));
    let report = orchestrator.execute(&plan).await.unwrap();
    orchestrator.finish(Some(&report)).unwrap();

    let descriptor: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(out.path().join("dataset_description.json")).unwrap()).unwrap();
    assert_eq!(descriptor["DatasetType"], "derivative");

    let log: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(orchestrator.events_path()).unwrap()).unwrap();
    let kinds: Vec<&str> = log
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["kind"]["type"].as_str())
        .collect();
    assert_eq!(kinds.first(), Some(&"stage_started"));
    assert_eq!(kinds.last(), Some(&"stage_completed"));
}
