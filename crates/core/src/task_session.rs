//! Task session state machine
//!
//! A task session is one attempt at one task: `running` until it ends as
//! `time_out`, `quit` or `passed`. It owns at most one sandbox at a time and
//! releases it when it closes.

use crate::docker::SandboxRuntime;
use crate::errors::{Result, StudyError};
use crate::sandbox::{FilesystemProvisioner, Sandbox, SandboxManager};
use crate::scheduler::Stage;
use crate::study_session::{StudySession, StudyStatus};
use crate::task::{Task, TaskType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, instrument};

/// Action text recorded when the participant resets their filesystem
pub const RESET_ACTION: &str = "__reset__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    TimeOut,
    Quit,
    Passed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::TimeOut => "time_out",
            Self::Quit => "quit",
            Self::Passed => "passed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self != Self::Running
    }
}

impl FromStr for TaskStatus {
    type Err = StudyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "time_out" => Ok(Self::TimeOut),
            "quit" => Ok(Self::Quit),
            "passed" => Ok(Self::Passed),
            other => Err(StudyError::Internal(format!("unknown task status '{}'", other))),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted when a task session closes; consumed by [`StudySession::advance`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskClosed {
    pub study_session_id: String,
    pub task_session_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub is_training: bool,
}

/// Onboarding tour flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TourKind {
    /// First training task of the study
    Init,
    /// First later occurrence of a task type
    First,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageTour {
    pub kind: TourKind,
    pub task_type: TaskType,
}

impl PageTour {
    /// Tour name, e.g. `init_standard_output` or `first_file_search`
    pub fn name(&self) -> String {
        let prefix = match self.kind {
            TourKind::Init => "init",
            TourKind::First => "first",
        };
        format!("{}_{}", prefix, self.task_type.tour_suffix())
    }
}

/// Audit record of one participant action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub task_session_id: String,
    /// Position within the task session's history, starting at 1
    pub sequence: usize,
    /// Command transcript, or [`RESET_ACTION`]
    pub action: String,
    pub action_time: DateTime<Utc>,
}

impl ActionRecord {
    pub fn new(task_session_id: impl Into<String>, sequence: usize, action: impl Into<String>) -> Self {
        Self {
            task_session_id: task_session_id.into(),
            sequence,
            action: action.into(),
            action_time: Utc::now(),
        }
    }

    pub fn is_reset(&self) -> bool {
        self.action == RESET_ACTION
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSession {
    pub session_id: String,
    pub study_session_id: String,
    /// Stage of the study when this session was created
    pub stage: Stage,
    pub task_id: u32,
    pub task_type: TaskType,
    pub sandbox: Option<Sandbox>,
    pub is_training: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: TaskStatus,
}

impl TaskSession {
    /// New running session for `task` within `study`
    pub fn new(session_id: impl Into<String>, study: &StudySession, task: &Task) -> Result<Self> {
        Ok(Self {
            session_id: session_id.into(),
            study_session_id: study.session_id.clone(),
            stage: study.stage()?,
            task_id: task.task_id,
            task_type: task.task_type(),
            sandbox: None,
            is_training: study.status.is_training_phase(),
            start_time: Utc::now(),
            end_time: None,
            status: TaskStatus::Running,
        })
    }

    pub fn is_running(&self) -> bool {
        self.status == TaskStatus::Running
    }

    /// End the attempt; `None` when it had already ended.
    ///
    /// The sandbox is released before the status changes.
    #[instrument(skip(self, sandboxes), fields(session_id = %self.session_id))]
    pub async fn close<R, F>(
        &mut self,
        reason: TaskStatus,
        sandboxes: &SandboxManager<R, F>,
    ) -> Result<Option<TaskClosed>>
    where
        R: SandboxRuntime,
        F: FilesystemProvisioner,
    {
        if !reason.is_terminal() {
            return Err(StudyError::invalid_state(
                "task session",
                self.status,
                "close with reason 'running'",
            ));
        }
        if !self.is_running() {
            debug!("Task session {} already closed as {}", self.session_id, self.status);
            return Ok(None);
        }

        self.destroy_sandbox(sandboxes).await;
        self.end_time = Some(Utc::now());
        self.status = reason;

        Ok(Some(TaskClosed {
            study_session_id: self.study_session_id.clone(),
            task_session_id: self.session_id.clone(),
            task_type: self.task_type,
            status: reason,
            is_training: self.is_training,
        }))
    }

    /// Bind a fresh sandbox, destroying any previously bound one first
    #[instrument(skip(self, sandboxes, task), fields(session_id = %self.session_id))]
    pub async fn create_sandbox<R, F>(
        &mut self,
        sandboxes: &SandboxManager<R, F>,
        task: &Task,
    ) -> Result<&Sandbox>
    where
        R: SandboxRuntime,
        F: FilesystemProvisioner,
    {
        if !self.is_running() {
            return Err(StudyError::invalid_state(
                "task session",
                self.status,
                "create a sandbox for",
            ));
        }
        self.destroy_sandbox(sandboxes).await;
        let sandbox = sandboxes.provision(&self.session_id, task).await?;
        Ok(&*self.sandbox.insert(sandbox))
    }

    /// Release the bound sandbox, if any
    pub async fn destroy_sandbox<R, F>(&mut self, sandboxes: &SandboxManager<R, F>)
    where
        R: SandboxRuntime,
        F: FilesystemProvisioner,
    {
        if let Some(sandbox) = self.sandbox.take() {
            sandboxes.destroy(&sandbox).await;
        }
    }

    /// Onboarding tour to show with this task, if any.
    ///
    /// Each task type gets one tour per study: `init` when it is met on the
    /// very first training task, `first` when it is met later.
    pub fn page_tour(&self, study: &StudySession) -> Option<PageTour> {
        if study.seen.get(self.task_type) {
            return None;
        }
        let kind = if study.status == StudyStatus::Training && study.num_tasks_completed == 0 {
            TourKind::Init
        } else {
            TourKind::First
        };
        Some(PageTour {
            kind,
            task_type: self.task_type,
        })
    }
}
