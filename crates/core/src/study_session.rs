//! Study session state machine
//!
//! ```text
//! pre-consent -> pre-training -> training -> running -> finished
//!                                              |  ^  \-> closed_with_error
//!                                              v  |
//!                                             paused
//! ```
//!
//! Training and scored tasks share the `num_tasks_completed` counter; it is
//! reset to zero when training ends.

use crate::errors::{Result, StudyError};
use crate::participant::Participant;
use crate::scheduler::{Group, Scheduler, Stage};
use crate::task::TaskType;
use crate::task_session::TaskClosed;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

const ENTITY: &str = "study session";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StudyStatus {
    #[serde(rename = "pre-consent")]
    PreConsent,
    #[serde(rename = "pre-training")]
    PreTraining,
    #[serde(rename = "training")]
    Training,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "finished")]
    Finished,
    #[serde(rename = "closed_with_error")]
    ClosedWithError,
}

impl StudyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreConsent => "pre-consent",
            Self::PreTraining => "pre-training",
            Self::Training => "training",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Finished => "finished",
            Self::ClosedWithError => "closed_with_error",
        }
    }

    /// Onboarding statuses, where served tasks are training tasks
    pub fn is_training_phase(&self) -> bool {
        matches!(self, Self::PreConsent | Self::PreTraining | Self::Training)
    }

    /// Running or paused: the session can still be resumed or closed
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Finished | Self::ClosedWithError)
    }
}

impl std::fmt::Display for StudyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal reason passed to [`StudySession::close`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Finished,
    ClosedWithError,
}

impl From<CloseReason> for StudyStatus {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::Finished => Self::Finished,
            CloseReason::ClosedWithError => Self::ClosedWithError,
        }
    }
}

/// Which task types have been shown at least once
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenTypes {
    pub stdout: bool,
    pub file_search: bool,
    pub filesystem_change: bool,
}

impl SeenTypes {
    pub fn get(&self, task_type: TaskType) -> bool {
        match task_type {
            TaskType::Stdout => self.stdout,
            TaskType::FileSearch => self.file_search,
            TaskType::FilesystemChange => self.filesystem_change,
        }
    }

    pub fn mark(&mut self, task_type: TaskType) {
        match task_type {
            TaskType::Stdout => self.stdout = true,
            TaskType::FileSearch => self.file_search = true,
            TaskType::FilesystemChange => self.filesystem_change = true,
        }
    }
}

/// Emitted by [`StudySession::close`] when the session actually closes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyClosed {
    pub session_id: String,
    pub status: StudyStatus,
    /// Task session whose sandbox must be released
    pub released_task_session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudySession {
    pub session_id: String,
    pub access_code: String,
    pub group: Group,
    pub creation_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    pub status: StudyStatus,
    pub num_tasks_completed: usize,
    pub total_num_training_tasks: usize,
    pub total_num_tasks: usize,
    /// Scored tasks in the first block served to this session's group
    pub switch_point: usize,
    pub seen: SeenTypes,
    pub current_task_session_id: Option<String>,
}

impl StudySession {
    /// New session in `pre-consent`, sized from the schedule
    pub fn new(session_id: impl Into<String>, participant: &Participant, scheduler: &Scheduler) -> Self {
        Self {
            session_id: session_id.into(),
            access_code: participant.access_code.clone(),
            group: participant.group,
            creation_time: Utc::now(),
            close_time: None,
            status: StudyStatus::PreConsent,
            num_tasks_completed: 0,
            total_num_training_tasks: scheduler.total_training_tasks(),
            total_num_tasks: scheduler.total_scored_tasks(),
            switch_point: scheduler.switch_point(participant.group),
            seen: SeenTypes::default(),
            current_task_session_id: None,
        }
    }

    fn transition(&mut self, from: StudyStatus, to: StudyStatus, operation: &str) -> Result<()> {
        if self.status != from {
            return Err(StudyError::invalid_state(ENTITY, self.status, operation));
        }
        debug!("Study session {}: {} -> {}", self.session_id, from, to);
        self.status = to;
        Ok(())
    }

    pub fn give_consent(&mut self) -> Result<()> {
        self.transition(StudyStatus::PreConsent, StudyStatus::PreTraining, "give consent in")
    }

    /// Enter training; a study without training tasks goes straight to `running`
    pub fn begin_training(&mut self) -> Result<()> {
        let target = if self.total_num_training_tasks == 0 {
            StudyStatus::Running
        } else {
            StudyStatus::Training
        };
        self.transition(StudyStatus::PreTraining, target, "begin training in")
    }

    pub fn pause(&mut self) -> Result<()> {
        self.transition(StudyStatus::Running, StudyStatus::Paused, "pause")
    }

    pub fn resume(&mut self) -> Result<()> {
        self.transition(StudyStatus::Paused, StudyStatus::Running, "resume")
    }

    /// Current coarse phase
    pub fn stage(&self) -> Result<Stage> {
        match self.status {
            StudyStatus::PreConsent | StudyStatus::PreTraining | StudyStatus::Training => {
                Ok(Stage::O)
            }
            StudyStatus::Running if self.num_tasks_completed < self.switch_point => Ok(Stage::I),
            StudyStatus::Running if self.num_tasks_completed < self.total_num_tasks => {
                Ok(Stage::II)
            }
            StudyStatus::Running => Ok(Stage::III),
            StudyStatus::Paused | StudyStatus::Finished | StudyStatus::ClosedWithError => Err(
                StudyError::invalid_state(ENTITY, self.status, "derive the stage of"),
            ),
        }
    }

    /// True when the caller should show a between-block screen instead of a task
    pub fn stage_change(&self) -> bool {
        self.status == StudyStatus::Running
            && (self.num_tasks_completed == 0
                || self.num_tasks_completed == self.switch_point
                || self.num_tasks_completed == self.total_num_tasks)
    }

    /// All scored tasks done
    pub fn is_complete(&self) -> bool {
        self.status == StudyStatus::Running && self.num_tasks_completed == self.total_num_tasks
    }

    /// Fails unless a task-close event could be counted right now
    pub fn ensure_can_advance(&self) -> Result<()> {
        match self.status {
            StudyStatus::Training => {
                if self.num_tasks_completed >= self.total_num_training_tasks {
                    return Err(StudyError::invalid_state(ENTITY, self.status, "advance past training in"));
                }
            }
            StudyStatus::Running => {
                if self.num_tasks_completed >= self.total_num_tasks {
                    return Err(StudyError::invalid_state(ENTITY, self.status, "advance past the last task in"));
                }
            }
            status => return Err(StudyError::invalid_state(ENTITY, status, "advance")),
        }
        Ok(())
    }

    /// Consume a task-close event: record the seen type and count the task
    pub fn advance(&mut self, event: &TaskClosed) -> Result<()> {
        if event.study_session_id != self.session_id {
            return Err(StudyError::Internal(format!(
                "task session {} belongs to {}, not {}",
                event.task_session_id, event.study_session_id, self.session_id
            )));
        }
        self.ensure_can_advance()?;

        self.seen.mark(event.task_type);
        self.num_tasks_completed += 1;

        if self.status == StudyStatus::Training
            && self.num_tasks_completed == self.total_num_training_tasks
        {
            debug!("Study session {} finished training", self.session_id);
            self.num_tasks_completed = 0;
            self.status = StudyStatus::Running;
        }
        Ok(())
    }

    /// Close a running or paused session; `None` when nothing changed
    pub fn close(&mut self, reason: CloseReason) -> Option<StudyClosed> {
        if !self.status.is_open() {
            return None;
        }
        self.status = reason.into();
        self.close_time = Some(Utc::now());
        let released = self.current_task_session_id.take();
        debug!("Study session {} closed as {}", self.session_id, self.status);

        Some(StudyClosed {
            session_id: self.session_id.clone(),
            status: self.status,
            released_task_session_id: released,
        })
    }

    /// Identifier the next task session would get
    pub fn next_task_session_id(&self) -> Result<String> {
        let n = self.num_tasks_completed + 1;
        match self.status {
            s if s.is_training_phase() => Ok(format!("{}-training-task-{}", self.session_id, n)),
            StudyStatus::Running => Ok(format!("{}-task-{}", self.session_id, n)),
            status => Err(StudyError::invalid_state(
                ENTITY,
                status,
                "generate a task session id for",
            )),
        }
    }

    /// Generate the next task session id and make it current
    pub fn assign_next_task_session_id(&mut self) -> Result<String> {
        let id = self.next_task_session_id()?;
        self.current_task_session_id = Some(id.clone());
        Ok(id)
    }

    /// 1-based position of the current task within its phase
    pub fn order_number(&self) -> usize {
        self.num_tasks_completed + 1
    }
}
