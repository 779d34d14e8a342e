//! Schedule command

use super::print_json;
use anyhow::Result;
use serde::Serialize;
use shellstudy_core::config::StudyConfig;
use shellstudy_core::scheduler::{Group, Scheduler, Stage, Treatment};
use shellstudy_core::task::TaskType;
use std::path::Path;
use tracing::instrument;

/// One served task in a group's order
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledTask {
    /// 1-based position within its phase
    pub position: usize,
    pub task_id: u32,
    pub task_type: TaskType,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub treatment: Option<Treatment>,
    pub is_training: bool,
}

/// Training tasks followed by the group's scored tasks
pub fn plan(scheduler: &Scheduler, group: Group) -> Result<Vec<ScheduledTask>> {
    let mut out = Vec::new();

    for n in 0..scheduler.total_training_tasks() {
        let task = scheduler.training_task(n)?;
        out.push(ScheduledTask {
            position: n + 1,
            task_id: task.task_id,
            task_type: task.task_type(),
            stage: Stage::O,
            treatment: None,
            is_training: true,
        });
    }

    let switch_point = scheduler.switch_point(group);
    for n in 0..scheduler.total_scored_tasks() {
        let task = scheduler.next_task(n, group)?;
        let stage = if n < switch_point { Stage::I } else { Stage::II };
        out.push(ScheduledTask {
            position: n + 1,
            task_id: task.task_id,
            task_type: task.task_type(),
            stage,
            treatment: Scheduler::treatment(group, stage),
            is_training: false,
        });
    }
    Ok(out)
}

#[instrument]
pub fn execute_schedule(config_path: &Path, group: Group) -> Result<()> {
    let config = StudyConfig::load_from_path(config_path)?;
    let scheduler = config.build_scheduler()?;
    print_json(&plan(&scheduler, group)?)
}
