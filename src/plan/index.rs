//! `index` stage: one aggregate task rebuilding the dataset index

use super::{Builtin, Layout, Step, Task, TaskAction, TaskInput};
use crate::config::ResolvedConfig;
use crate::tool::Tool;

pub(super) fn plan(config: &ResolvedConfig, layout: &Layout) -> Task {
    let index_path = config.index_path();
    let overwrite = config.index().is_some_and(|cfg| cfg.overwrite);
    let build = Builtin::BuildIndex {
        root: config.input_dir.clone(),
        index_path: index_path.clone(),
        overwrite,
    };
    let mut task = Task::new(
        None,
        Step::Index,
        Tool::Builtin,
        TaskAction::Run(vec![build.into()]),
        layout.work_dir(None, Step::Index),
    )
    .with_settings(config.slice("index"));
    task.inputs
        .insert("root".to_string(), TaskInput::dataset(&config.input_dir));
    task.outputs.insert("index".to_string(), index_path);
    task
}
