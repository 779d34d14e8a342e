//! Task definitions and the task catalog
//!
//! Tasks are immutable, pre-seeded configuration. Each carries a [`TaskKind`]
//! holding its own goal representation and completion predicate.

use crate::diff::Delta;
use crate::errors::{ConfigError, Result, StudyError};
use crate::snapshot::FsNode;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Task type label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Stdout,
    FileSearch,
    FilesystemChange,
}

impl TaskType {
    pub const ALL: [TaskType; 3] = [Self::Stdout, Self::FileSearch, Self::FilesystemChange];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::FileSearch => "file_search",
            Self::FilesystemChange => "filesystem_change",
        }
    }

    /// Suffix used in page tour names
    pub fn tour_suffix(&self) -> &'static str {
        match self {
            Self::Stdout => "standard_output",
            Self::FileSearch => "file_search",
            Self::FilesystemChange => "filesystem_change",
        }
    }
}

impl FromStr for TaskType {
    type Err = StudyError;

    /// Accepts the canonical labels plus the legacy `filesearch` / `filesystem`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Self::Stdout),
            "file_search" | "filesearch" => Ok(Self::FileSearch),
            "filesystem_change" | "filesystem" => Ok(Self::FilesystemChange),
            other => Err(StudyError::UnrecognizedTaskType {
                label: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Goal and completion policy of a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Complete when `expected` shows up in the last output line before the prompt
    Stdout { expected: String },
    /// Complete when the home directory matches `goal`
    FileSearch { goal: FsNode },
    /// Complete when the home directory matches `goal`
    FilesystemChange { goal: FsNode },
}

impl TaskKind {
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::Stdout { .. } => TaskType::Stdout,
            Self::FileSearch { .. } => TaskType::FileSearch,
            Self::FilesystemChange { .. } => TaskType::FilesystemChange,
        }
    }

    pub fn goal_filesystem(&self) -> Option<&FsNode> {
        match self {
            Self::Stdout { .. } => None,
            Self::FileSearch { goal } | Self::FilesystemChange { goal } => Some(goal),
        }
    }

    /// Completion check after a command.
    ///
    /// `output` is the raw transcript (echoed command, output lines, prompt);
    /// `delta` is the diff of the current home directory against the goal.
    pub fn is_complete(&self, output: &str, delta: &Delta) -> bool {
        match self {
            Self::Stdout { expected } => {
                let lines: Vec<&str> = output.split('\n').collect();
                lines.len() >= 2 && lines[lines.len() - 2].contains(expected.as_str())
            }
            Self::FileSearch { .. } | Self::FilesystemChange { .. } => !delta.has_differences,
        }
    }
}

/// One-off environment adjustment applied after a sandbox starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fixup {
    /// Set the modification time of a home-relative path (host side)
    SetModified { path: String, timestamp: i64 },
    /// Run a command inside the sandbox
    Exec {
        #[serde(default = "default_fixup_user")]
        user: String,
        argv: Vec<String>,
    },
}

fn default_fixup_user() -> String {
    "root".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub task_id: u32,
    pub kind: TaskKind,
    pub description: String,
    /// Free-form attribute notes shown next to the description
    pub file_attributes: String,
    pub initial_filesystem: FsNode,
    pub duration: Duration,
    pub fixups: Vec<Fixup>,
}

impl Task {
    pub fn task_type(&self) -> TaskType {
        self.kind.task_type()
    }

    /// Tree the current home directory is diffed against.
    ///
    /// Stdout tasks have no goal tree and compare against their initial
    /// filesystem; the resulting delta is informational only.
    pub fn comparison_target(&self) -> &FsNode {
        self.kind
            .goal_filesystem()
            .unwrap_or(&self.initial_filesystem)
    }
}

/// Task as written in configuration files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: u32,
    #[serde(rename = "type")]
    pub task_type: String,
    pub description: String,
    #[serde(default)]
    pub file_attributes: String,
    pub initial_filesystem: FsNode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_filesystem: Option<FsNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    pub duration_secs: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fixups: Vec<Fixup>,
}

impl TryFrom<TaskRecord> for Task {
    type Error = StudyError;

    fn try_from(record: TaskRecord) -> Result<Self> {
        let invalid = |message: String| -> StudyError { ConfigError::Validation { message }.into() };

        let kind = match record.task_type.parse::<TaskType>()? {
            TaskType::Stdout => match record.stdout {
                Some(expected) if !expected.is_empty() => TaskKind::Stdout { expected },
                _ => {
                    return Err(invalid(format!(
                        "task {}: stdout tasks need a non-empty 'stdout' goal",
                        record.task_id
                    )))
                }
            },
            task_type => {
                let goal = record.goal_filesystem.ok_or_else(|| {
                    invalid(format!(
                        "task {}: {} tasks need a 'goal_filesystem'",
                        record.task_id, task_type
                    ))
                })?;
                if task_type == TaskType::FileSearch {
                    TaskKind::FileSearch { goal }
                } else {
                    TaskKind::FilesystemChange { goal }
                }
            }
        };

        if record.duration_secs == 0 {
            return Err(invalid(format!(
                "task {}: duration_secs must be positive",
                record.task_id
            )));
        }

        Ok(Task {
            task_id: record.task_id,
            kind,
            description: record.description,
            file_attributes: record.file_attributes,
            initial_filesystem: record.initial_filesystem,
            duration: Duration::from_secs(record.duration_secs),
            fixups: record.fixups,
        })
    }
}

/// Immutable lookup of tasks by id
#[derive(Debug, Clone, Default)]
pub struct TaskCatalog {
    tasks: IndexMap<u32, Task>,
}

impl TaskCatalog {
    pub fn new(tasks: Vec<Task>) -> Result<Self> {
        let mut map = IndexMap::with_capacity(tasks.len());
        for task in tasks {
            let id = task.task_id;
            if map.insert(id, task).is_some() {
                return Err(ConfigError::Validation {
                    message: format!("duplicate task id {}", id),
                }
                .into());
            }
        }
        Ok(Self { tasks: map })
    }

    pub fn from_records(records: Vec<TaskRecord>) -> Result<Self> {
        let tasks = records
            .into_iter()
            .map(Task::try_from)
            .collect::<Result<Vec<_>>>()?;
        Self::new(tasks)
    }

    pub fn get(&self, task_id: u32) -> Result<&Task> {
        self.tasks
            .get(&task_id)
            .ok_or_else(|| StudyError::not_found("Task", task_id.to_string()))
    }

    pub fn contains(&self, task_id: u32) -> bool {
        self.tasks.contains_key(&task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }
}
