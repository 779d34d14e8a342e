//! Task scheduling
//!
//! Task order is a deterministic function of the participant's group and
//! their position in the study. Groups 1 and 4 take block I first, groups 2
//! and 3 take block II first; groups 1 and 3 use treatment order 0.

use crate::errors::{ConfigError, Result, StudyError};
use crate::task::{Task, TaskCatalog};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;

/// Participant group, fixing block order and treatment order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Group {
    Group1,
    Group2,
    Group3,
    Group4,
}

impl Group {
    pub const ALL: [Group; 4] = [Self::Group1, Self::Group2, Self::Group3, Self::Group4];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Group1 => "group1",
            Self::Group2 => "group2",
            Self::Group3 => "group3",
            Self::Group4 => "group4",
        }
    }
}

impl FromStr for Group {
    type Err = StudyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| {
                ConfigError::Validation {
                    message: format!("Unknown group: {}. Expected group1..group4", s),
                }
                .into()
            })
    }
}

impl std::fmt::Display for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse study phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Onboarding and training
    O,
    /// First scored block
    I,
    /// Second scored block
    II,
    /// All scored tasks done, awaiting close
    III,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::O => "O",
            Self::I => "I",
            Self::II => "II",
            Self::III => "III",
        })
    }
}

/// Tool condition assigned to a scored stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Treatment {
    A,
    B,
}

impl std::fmt::Display for Treatment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::A => "A",
            Self::B => "B",
        })
    }
}

/// Ordered task-id lists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub training: Vec<u32>,
    pub block_i: Vec<u32>,
    pub block_ii: Vec<u32>,
}

impl ScheduleConfig {
    /// Lists are duplicate-free and pairwise disjoint; at least one scored task
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| -> StudyError { ConfigError::Validation { message }.into() };

        if self.block_i.is_empty() && self.block_ii.is_empty() {
            return Err(invalid("schedule has no scored tasks".to_string()));
        }

        let mut seen = HashSet::new();
        for (list, ids) in [
            ("training", &self.training),
            ("block_i", &self.block_i),
            ("block_ii", &self.block_ii),
        ] {
            for id in ids {
                if !seen.insert(*id) {
                    return Err(invalid(format!(
                        "task {} is scheduled more than once (seen again in {})",
                        id, list
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn all_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.training
            .iter()
            .chain(&self.block_i)
            .chain(&self.block_ii)
            .copied()
    }
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    schedule: ScheduleConfig,
    catalog: TaskCatalog,
}

impl Scheduler {
    /// Validate the schedule and check every scheduled id against the catalog
    pub fn new(schedule: ScheduleConfig, catalog: TaskCatalog) -> Result<Self> {
        schedule.validate()?;
        if let Some(missing) = schedule.all_ids().find(|id| !catalog.contains(*id)) {
            return Err(ConfigError::Validation {
                message: format!("scheduled task {} is not defined", missing),
            }
            .into());
        }
        Ok(Self { schedule, catalog })
    }

    pub fn catalog(&self) -> &TaskCatalog {
        &self.catalog
    }

    pub fn schedule(&self) -> &ScheduleConfig {
        &self.schedule
    }

    /// 0 when block I is served first (group1, group4), else 1
    pub fn task_block_order(group: Group) -> u8 {
        match group {
            Group::Group1 | Group::Group4 => 0,
            Group::Group2 | Group::Group3 => 1,
        }
    }

    /// 0 for group1 and group3, else 1
    pub fn treatment_order(group: Group) -> u8 {
        match group {
            Group::Group1 | Group::Group3 => 0,
            Group::Group2 | Group::Group4 => 1,
        }
    }

    /// Tool condition for a scored stage; `None` for O and III
    pub fn treatment(group: Group, stage: Stage) -> Option<Treatment> {
        match (Self::treatment_order(group), stage) {
            (0, Stage::I) | (1, Stage::II) => Some(Treatment::A),
            (0, Stage::II) | (1, Stage::I) => Some(Treatment::B),
            _ => None,
        }
    }

    fn blocks(&self, group: Group) -> (&[u32], &[u32]) {
        if Self::task_block_order(group) == 0 {
            (&self.schedule.block_i, &self.schedule.block_ii)
        } else {
            (&self.schedule.block_ii, &self.schedule.block_i)
        }
    }

    /// Task ids in serving order for `group`
    pub fn scored_order(&self, group: Group) -> Vec<u32> {
        let (first, second) = self.blocks(group);
        first.iter().chain(second).copied().collect()
    }

    /// Number of scored tasks in the first block served to `group`
    pub fn switch_point(&self, group: Group) -> usize {
        self.blocks(group).0.len()
    }

    /// Number of scored tasks in the second block served to `group`
    pub fn remaining_block_length(&self, group: Group) -> usize {
        self.blocks(group).1.len()
    }

    pub fn total_scored_tasks(&self) -> usize {
        self.schedule.block_i.len() + self.schedule.block_ii.len()
    }

    pub fn total_training_tasks(&self) -> usize {
        self.schedule.training.len()
    }

    /// Scored task at position `num_completed`
    pub fn next_task(&self, num_completed: usize, group: Group) -> Result<&Task> {
        let (first, second) = self.blocks(group);
        let task_id = if num_completed < first.len() {
            first[num_completed]
        } else {
            *second.get(num_completed - first.len()).ok_or_else(|| {
                StudyError::invalid_state(
                    "schedule",
                    format!("{} of {} scored tasks completed", num_completed, self.total_scored_tasks()),
                    "select a next task from",
                )
            })?
        };
        self.catalog.get(task_id)
    }

    /// Training task at position `num_completed`
    pub fn training_task(&self, num_completed: usize) -> Result<&Task> {
        let task_id = *self.schedule.training.get(num_completed).ok_or_else(|| {
            StudyError::invalid_state(
                "schedule",
                format!(
                    "{} of {} training tasks completed",
                    num_completed,
                    self.total_training_tasks()
                ),
                "select a training task from",
            )
        })?;
        self.catalog.get(task_id)
    }
}
