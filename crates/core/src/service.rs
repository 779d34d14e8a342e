//! Study orchestration
//!
//! [`StudyService`] drives a participant through a study: it asks the
//! scheduler for tasks, creates task sessions with their sandboxes, feeds
//! task-close events into the study session, evaluates commands against the
//! task goal and resumes interrupted studies.

use crate::config::StudyConfig;
use crate::diff::{annotate, diff, observed_paths, Delta};
use crate::docker::SandboxRuntime;
use crate::errors::{Result, StudyError};
use crate::participant::Participant;
use crate::repository::{Repository, Store};
use crate::sandbox::{FilesystemProvisioner, Sandbox, SandboxManager};
use crate::scheduler::{Scheduler, Stage, Treatment};
use crate::snapshot::{FsNode, MaterializeReport};
use crate::study_session::{CloseReason, StudySession, StudyStatus};
use crate::task::TaskType;
use crate::task_session::{ActionRecord, TaskSession, TaskStatus, RESET_ACTION};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, instrument, warn};

/// Score counts reported when a study finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudySummary {
    pub passed: usize,
    pub quit: usize,
    pub timed_out: usize,
    /// Number of scored tasks in the study
    pub total: usize,
}

/// A task session ready to be worked on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_session: TaskSession,
    /// Show the between-block screen before this task
    pub stage_change: bool,
}

/// Outcome of advancing past a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "next", rename_all = "snake_case")]
pub enum NextStep {
    Task(TaskAssignment),
    Finished { study_session_id: String, summary: StudySummary },
}

/// Evaluation of one shell command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub delta: Delta,
    pub completed: bool,
    /// Home-relative paths the command output referred to
    pub observed_paths: Vec<String>,
}

/// Everything the task page shows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    pub task_session_id: String,
    pub task_id: u32,
    pub task_type: TaskType,
    pub description: String,
    pub file_attributes: String,
    pub stage: Stage,
    pub is_training: bool,
    /// 1-based position within the current phase
    pub order_number: usize,
    /// Tasks in the current phase (training or scored)
    pub total: usize,
    pub duration_secs: u64,
    pub page_tour: Option<String>,
    pub treatment: Option<Treatment>,
    pub stage_change: bool,
    pub port: Option<u16>,
    pub initial_filesystem: FsNode,
    pub goal_filesystem: Option<FsNode>,
    pub current_filesystem: Option<FsNode>,
}

type SessionLock = Arc<tokio::sync::Mutex<()>>;
type LockMap = Mutex<HashMap<String, SessionLock>>;

/// Holds one task session's lock; the map entry is dropped with the last holder
struct SessionGuard<'a> {
    locks: &'a LockMap,
    task_session_id: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.task_session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.task_session_id);
        }
    }
}

pub struct StudyService<S, R, F> {
    config: Arc<StudyConfig>,
    scheduler: Arc<Scheduler>,
    store: S,
    sandboxes: SandboxManager<R, F>,
    locks: LockMap,
}

impl<S, R, F> StudyService<S, R, F>
where
    S: Store,
    R: SandboxRuntime,
    F: FilesystemProvisioner,
{
    pub fn new(config: Arc<StudyConfig>, store: S, runtime: R, provisioner: F) -> Result<Self> {
        let scheduler = Arc::new(config.build_scheduler()?);
        let sandboxes = SandboxManager::new(runtime, provisioner, config.sandbox.clone());
        Ok(Self {
            config,
            scheduler,
            store,
            sandboxes,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &StudyConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn sandboxes(&self) -> &SandboxManager<R, F> {
        &self.sandboxes
    }

    /// Serialize work on one task session
    async fn lock_session(&self, task_session_id: &str) -> SessionGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(task_session_id.to_string())
                .or_default()
                .clone()
        };
        SessionGuard {
            locks: &self.locks,
            task_session_id: task_session_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn register_participant(&self, participant: Participant) -> Result<()> {
        self.store.participants().create(participant)
    }

    /// Open a new study session in `pre-consent`
    #[instrument(skip(self))]
    pub fn start_study(&self, access_code: &str) -> Result<StudySession> {
        let participant = self.store.participants().get(access_code)?;
        let previous = self
            .store
            .study_sessions()
            .query(&|s| s.access_code == access_code)?
            .len();

        let session_id = format!("{}-study_session-{}", access_code, previous + 1);
        let session = StudySession::new(session_id, &participant, &self.scheduler);
        self.store.study_sessions().create(session.clone())?;
        info!("Started study session {}", session.session_id);
        Ok(session)
    }

    pub fn give_consent(&self, study_session_id: &str) -> Result<StudySession> {
        let mut study = self.store.study_sessions().get(study_session_id)?;
        study.give_consent()?;
        self.store.study_sessions().update(study.clone())?;
        Ok(study)
    }

    /// Enter training and serve the first task
    #[instrument(skip(self))]
    pub async fn begin_training(&self, study_session_id: &str) -> Result<TaskAssignment> {
        let mut study = self.store.study_sessions().get(study_session_id)?;
        study.begin_training()?;
        self.store.study_sessions().update(study.clone())?;
        self.serve_next(&mut study).await
    }

    /// Close the given task session with `reason` and move on.
    ///
    /// Calls for the same task session are serialized; a repeated call after
    /// the session closed reports the study's current position without
    /// advancing again.
    #[instrument(skip(self))]
    pub async fn next_task(&self, task_session_id: &str, reason: TaskStatus) -> Result<NextStep> {
        let _guard = self.lock_session(task_session_id).await;

        let mut task_session = self.store.task_sessions().get(task_session_id)?;
        let mut study = self
            .store
            .study_sessions()
            .get(&task_session.study_session_id)?;

        if task_session.is_running() {
            study.ensure_can_advance()?;
        }
        let Some(event) = task_session.close(reason, &self.sandboxes).await? else {
            debug!("Task session {} already closed", task_session_id);
            return self.current_step(&study);
        };
        self.store.task_sessions().update(task_session)?;

        study.advance(&event)?;
        self.store.study_sessions().update(study.clone())?;

        if study.is_complete() {
            self.finish(&mut study).await
        } else {
            self.serve_next(&mut study).await.map(NextStep::Task)
        }
    }

    async fn finish(&self, study: &mut StudySession) -> Result<NextStep> {
        self.close_and_release(study, CloseReason::Finished).await?;
        Ok(NextStep::Finished {
            study_session_id: study.session_id.clone(),
            summary: self.summary(&study.session_id)?,
        })
    }

    fn current_step(&self, study: &StudySession) -> Result<NextStep> {
        if study.status == StudyStatus::Finished {
            return Ok(NextStep::Finished {
                study_session_id: study.session_id.clone(),
                summary: self.summary(&study.session_id)?,
            });
        }
        let current = study.current_task_session_id.as_deref().ok_or_else(|| {
            StudyError::invalid_state("study session", study.status, "report the current task of")
        })?;
        Ok(NextStep::Task(TaskAssignment {
            task_session: self.store.task_sessions().get(current)?,
            stage_change: study.stage_change(),
        }))
    }

    /// Create the next task session and its sandbox.
    ///
    /// The task session is stored before provisioning; if provisioning fails
    /// it stays without a sandbox and [`Self::recreate_sandbox`] can retry.
    async fn serve_next(&self, study: &mut StudySession) -> Result<TaskAssignment> {
        let task = if study.status == StudyStatus::Training {
            self.scheduler.training_task(study.num_tasks_completed)?
        } else {
            self.scheduler
                .next_task(study.num_tasks_completed, study.group)?
        };

        let task_session_id = study.assign_next_task_session_id()?;
        let mut task_session = TaskSession::new(task_session_id, study, task)?;
        self.store.task_sessions().create(task_session.clone())?;
        self.store.study_sessions().update(study.clone())?;

        task_session.create_sandbox(&self.sandboxes, task).await?;
        self.store.task_sessions().update(task_session.clone())?;

        info!(
            task_id = task.task_id,
            stage = %task_session.stage,
            "Serving task session {}",
            task_session.session_id
        );
        Ok(TaskAssignment {
            task_session,
            stage_change: study.stage_change(),
        })
    }

    /// Provision a new sandbox for a running task session
    #[instrument(skip(self))]
    pub async fn recreate_sandbox(&self, task_session_id: &str) -> Result<Sandbox> {
        let _guard = self.lock_session(task_session_id).await;

        let mut task_session = self.store.task_sessions().get(task_session_id)?;
        let task = self.scheduler.catalog().get(task_session.task_id)?;
        let sandbox = task_session
            .create_sandbox(&self.sandboxes, task)
            .await?
            .clone();
        self.store.task_sessions().update(task_session)?;
        Ok(sandbox)
    }

    fn running_with_sandbox(&self, task_session_id: &str, operation: &str) -> Result<(TaskSession, Sandbox)> {
        let task_session = self.store.task_sessions().get(task_session_id)?;
        if !task_session.is_running() {
            return Err(StudyError::invalid_state(
                "task session",
                task_session.status,
                operation,
            ));
        }
        let sandbox = task_session.sandbox.clone().ok_or_else(|| {
            StudyError::invalid_state("task session", "without sandbox", operation)
        })?;
        Ok((task_session, sandbox))
    }

    fn record_action(&self, task_session_id: &str, action: &str) -> Result<()> {
        let sequence = self
            .store
            .actions()
            .query(&|a| a.task_session_id == task_session_id)?
            .len()
            + 1;
        self.store
            .actions()
            .create(ActionRecord::new(task_session_id, sequence, action))
    }

    /// Record a command transcript and check it against the task goal
    #[instrument(skip(self, output))]
    pub async fn on_command(&self, task_session_id: &str, output: &str) -> Result<CommandOutcome> {
        let _guard = self.lock_session(task_session_id).await;

        let (task_session, sandbox) = self.running_with_sandbox(task_session_id, "evaluate a command in")?;
        self.record_action(task_session_id, output)?;

        let task = self.scheduler.catalog().get(task_session.task_id)?;
        let current = self.sandboxes.current_filesystem(&sandbox).await?;
        let mut delta = diff(&current, task.comparison_target(), &self.config.diff);

        let observed = observed_paths(output, &self.config.sandbox.home_dir());
        annotate(&mut delta, task.task_type(), &observed);
        let completed = task.kind.is_complete(output, &delta);

        debug!(
            completed,
            differences = delta.differences().count(),
            "Evaluated command"
        );
        Ok(CommandOutcome {
            delta,
            completed,
            observed_paths: observed,
        })
    }

    /// Restore the task's initial filesystem and record the reset
    #[instrument(skip(self))]
    pub async fn reset_filesystem(&self, task_session_id: &str) -> Result<MaterializeReport> {
        let _guard = self.lock_session(task_session_id).await;

        let (task_session, sandbox) = self.running_with_sandbox(task_session_id, "reset the filesystem of")?;
        let task = self.scheduler.catalog().get(task_session.task_id)?;
        let report = self.sandboxes.reset(&sandbox, task).await?;
        self.record_action(task_session_id, RESET_ACTION)?;
        Ok(report)
    }

    /// Data for rendering the task page
    pub async fn task_view(&self, task_session_id: &str) -> Result<TaskView> {
        let task_session = self.store.task_sessions().get(task_session_id)?;
        let study = self
            .store
            .study_sessions()
            .get(&task_session.study_session_id)?;
        let task = self.scheduler.catalog().get(task_session.task_id)?;

        let current_filesystem = match &task_session.sandbox {
            Some(sandbox) => Some(self.sandboxes.current_filesystem(sandbox).await?),
            None => None,
        };
        let total = if task_session.is_training {
            study.total_num_training_tasks
        } else {
            study.total_num_tasks
        };

        Ok(TaskView {
            task_session_id: task_session.session_id.clone(),
            task_id: task.task_id,
            task_type: task.task_type(),
            description: task.description.clone(),
            file_attributes: task.file_attributes.clone(),
            stage: task_session.stage,
            is_training: task_session.is_training,
            order_number: study.order_number(),
            total,
            duration_secs: task.duration.as_secs(),
            page_tour: task_session.page_tour(&study).map(|tour| tour.name()),
            treatment: Scheduler::treatment(study.group, task_session.stage),
            stage_change: study.stage_change(),
            port: task_session.sandbox.as_ref().map(|s| s.port),
            initial_filesystem: task.initial_filesystem.clone(),
            goal_filesystem: task.kind.goal_filesystem().cloned(),
            current_filesystem,
        })
    }

    /// Close a study session and release the sandbox of its current task
    #[instrument(skip(self))]
    pub async fn close_study(&self, study_session_id: &str, reason: CloseReason) -> Result<StudySession> {
        let mut study = self.store.study_sessions().get(study_session_id)?;
        self.close_and_release(&mut study, reason).await?;
        Ok(study)
    }

    async fn close_and_release(&self, study: &mut StudySession, reason: CloseReason) -> Result<()> {
        let Some(closed) = study.close(reason) else {
            return Ok(());
        };
        self.store.study_sessions().update(study.clone())?;
        info!("Closed study session {} as {}", closed.session_id, closed.status);

        if let Some(task_session_id) = closed.released_task_session_id {
            match self.store.task_sessions().get(&task_session_id) {
                Ok(mut task_session) => {
                    task_session.destroy_sandbox(&self.sandboxes).await;
                    if let Err(e) = self.store.task_sessions().update(task_session) {
                        warn!("Failed to store released task session {}: {}", task_session_id, e);
                    }
                }
                Err(e) => warn!("Cannot release sandbox of {}: {}", task_session_id, e),
            }
        }
        Ok(())
    }

    pub fn pause_study(&self, study_session_id: &str) -> Result<StudySession> {
        let mut study = self.store.study_sessions().get(study_session_id)?;
        study.pause()?;
        self.store.study_sessions().update(study.clone())?;
        Ok(study)
    }

    /// Find the participant's resumable study session.
    ///
    /// Open sessions whose current task session is missing or no longer
    /// running are closed as `closed_with_error`, as are all healthy ones but
    /// the most recent. A paused survivor is set running again.
    #[instrument(skip(self))]
    pub async fn resume(&self, access_code: &str) -> Result<Option<StudySession>> {
        let open = self
            .store
            .study_sessions()
            .query(&|s| s.access_code == access_code && s.status.is_open())?;

        let mut healthy = Vec::new();
        for mut study in open {
            let current_running = match study.current_task_session_id.as_deref() {
                Some(id) => match self.store.task_sessions().get(id) {
                    Ok(task_session) => task_session.is_running(),
                    Err(StudyError::NotFound { .. }) => false,
                    Err(e) => return Err(e),
                },
                None => false,
            };

            if current_running {
                healthy.push(study);
            } else {
                warn!("Closing corrupted study session {}", study.session_id);
                self.close_and_release(&mut study, CloseReason::ClosedWithError)
                    .await?;
            }
        }

        let Some(mut latest) = healthy.pop() else {
            return Ok(None);
        };
        for mut stale in healthy {
            warn!("Closing superseded study session {}", stale.session_id);
            self.close_and_release(&mut stale, CloseReason::ClosedWithError)
                .await?;
        }

        if latest.status == StudyStatus::Paused {
            latest.resume()?;
            self.store.study_sessions().update(latest.clone())?;
        }
        Ok(Some(latest))
    }

    /// Counts over the scored task sessions of a study
    pub fn summary(&self, study_session_id: &str) -> Result<StudySummary> {
        let sessions = self
            .store
            .task_sessions()
            .query(&|t| t.study_session_id == study_session_id && !t.is_training)?;
        let count = |status: TaskStatus| sessions.iter().filter(|t| t.status == status).count();

        Ok(StudySummary {
            passed: count(TaskStatus::Passed),
            quit: count(TaskStatus::Quit),
            timed_out: count(TaskStatus::TimeOut),
            total: self.scheduler.total_scored_tasks(),
        })
    }

    /// Action history of a task session, oldest first
    pub fn actions(&self, task_session_id: &str) -> Result<Vec<ActionRecord>> {
        self.store
            .actions()
            .query(&|a| a.task_session_id == task_session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::diff::DiffOptions;
    use crate::docker::mock::MockRuntime;
    use crate::repository::MemoryStore;
    use crate::sandbox::DirectoryProvisioner;
    use crate::scheduler::tests::stdout_record;
    use crate::scheduler::{Group, ScheduleConfig};
    use crate::snapshot::FsNode;
    use crate::task::TaskRecord;
    use tempfile::TempDir;

    type TestService = StudyService<MemoryStore, MockRuntime, DirectoryProvisioner>;

    fn mkdir_record(task_id: u32) -> TaskRecord {
        TaskRecord {
            task_type: "filesystem_change".to_string(),
            goal_filesystem: Some(FsNode::directory(
                "home",
                vec![FsNode::directory("backup", vec![])],
            )),
            stdout: None,
            ..stdout_record(task_id)
        }
    }

    fn service(dir: &TempDir, runtime: MockRuntime) -> TestService {
        let mut sandbox = SandboxConfig::new("shellstudy/sandbox:test", dir.path());
        sandbox.startup_timeout_secs = 1;
        sandbox.poll_interval_ms = 10;
        let config = StudyConfig {
            sandbox,
            schedule: ScheduleConfig {
                training: vec![21],
                block_i: vec![5, 10],
                block_ii: vec![8],
            },
            tasks: vec![
                mkdir_record(21),
                stdout_record(5),
                stdout_record(10),
                stdout_record(8),
            ],
            tasks_file: None,
            diff: DiffOptions::default(),
        };
        let service = StudyService::new(
            Arc::new(config),
            MemoryStore::new(),
            runtime,
            DirectoryProvisioner::new(dir.path()),
        )
        .unwrap();
        service
            .register_participant(Participant::new("p1", "Ada", "Lovelace", Group::Group1))
            .unwrap();
        service
    }

    async fn started(service: &TestService) -> (String, TaskAssignment) {
        let study = service.start_study("p1").unwrap();
        service.give_consent(&study.session_id).unwrap();
        let first = service.begin_training(&study.session_id).await.unwrap();
        (study.session_id, first)
    }

    fn expect_task(step: NextStep) -> TaskAssignment {
        match step {
            NextStep::Task(assignment) => assignment,
            other => panic!("expected another task, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_study_runs_to_summary() {
        let dir = TempDir::new().unwrap();
        let runtime = MockRuntime::new();
        let service = service(&dir, runtime.clone());
        let (study_id, first) = started(&service).await;

        assert_eq!(first.task_session.session_id, "p1-study_session-1-training-task-1");
        assert!(first.task_session.is_training);
        assert_eq!(first.task_session.stage, Stage::O);

        let second = expect_task(
            service
                .next_task(&first.task_session.session_id, TaskStatus::Passed)
                .await
                .unwrap(),
        );
        assert_eq!(second.task_session.session_id, "p1-study_session-1-task-1");
        assert_eq!(second.task_session.task_id, 5);
        assert_eq!(second.task_session.stage, Stage::I);

        let third = expect_task(
            service
                .next_task(&second.task_session.session_id, TaskStatus::Passed)
                .await
                .unwrap(),
        );
        assert_eq!(third.task_session.task_id, 10);

        let fourth = expect_task(
            service
                .next_task(&third.task_session.session_id, TaskStatus::Quit)
                .await
                .unwrap(),
        );
        assert_eq!(fourth.task_session.task_id, 8);
        assert_eq!(fourth.task_session.stage, Stage::II);
        assert!(fourth.stage_change);

        let last = service
            .next_task(&fourth.task_session.session_id, TaskStatus::TimeOut)
            .await
            .unwrap();
        assert_eq!(
            last,
            NextStep::Finished {
                study_session_id: study_id.clone(),
                summary: StudySummary {
                    passed: 1,
                    quit: 1,
                    timed_out: 1,
                    total: 3,
                },
            }
        );

        let study = service.store().study_sessions().get(&study_id).unwrap();
        assert_eq!(study.status, StudyStatus::Finished);
        assert!(runtime.live_containers().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_next_task_does_not_advance() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, MockRuntime::new());
        let (study_id, first) = started(&service).await;
        let id = first.task_session.session_id.clone();

        let (a, b) = tokio::join!(
            service.next_task(&id, TaskStatus::Passed),
            service.next_task(&id, TaskStatus::Passed)
        );
        let a = expect_task(a.unwrap());
        let b = expect_task(b.unwrap());
        assert_eq!(a.task_session.session_id, b.task_session.session_id);

        let study = service.store().study_sessions().get(&study_id).unwrap();
        assert_eq!(study.status, StudyStatus::Running);
        assert_eq!(study.num_tasks_completed, 0);
        assert_eq!(service.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn test_next_task_while_paused_keeps_task_running() {
        let dir = TempDir::new().unwrap();
        let runtime = MockRuntime::new();
        let service = service(&dir, runtime.clone());
        let (study_id, current) = scored(&service).await;
        let id = current.task_session.session_id.clone();
        service.pause_study(&study_id).unwrap();

        let result = service.next_task(&id, TaskStatus::TimeOut).await;
        assert!(matches!(result, Err(StudyError::InvalidState { .. })));

        let task_session = service.store().task_sessions().get(&id).unwrap();
        assert!(task_session.is_running());
        assert!(task_session.sandbox.is_some());
        assert_eq!(runtime.live_containers().len(), 1);
        let study = service.store().study_sessions().get(&study_id).unwrap();
        assert_eq!(study.status, StudyStatus::Paused);
        assert_eq!(study.num_tasks_completed, 0);

        let resumed = service.resume("p1").await.unwrap().unwrap();
        assert_eq!(resumed.session_id, study_id);
        assert_eq!(resumed.status, StudyStatus::Running);

        let next = expect_task(service.next_task(&id, TaskStatus::TimeOut).await.unwrap());
        assert_eq!(next.task_session.task_id, 10);
    }

    #[tokio::test]
    async fn test_on_command_tracks_filesystem_goal() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, MockRuntime::new());
        let (_, first) = started(&service).await;
        let id = first.task_session.session_id.clone();
        let home = first.task_session.sandbox.as_ref().unwrap().home_path.clone();

        let outcome = service.on_command(&id, "me@sandbox:~$ ls\nme@sandbox:~$").await.unwrap();
        assert!(!outcome.completed);
        assert!(outcome.delta.has_differences);

        std::fs::create_dir(home.join("backup")).unwrap();
        let outcome = service
            .on_command(&id, "me@sandbox:~$ mkdir backup\nme@sandbox:~$")
            .await
            .unwrap();
        assert!(outcome.completed);

        let actions = service.actions(&id).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[1].sequence, 2);
    }

    #[tokio::test]
    async fn test_reset_restores_and_records() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, MockRuntime::new());
        let (_, first) = started(&service).await;
        let id = first.task_session.session_id.clone();
        let home = first.task_session.sandbox.as_ref().unwrap().home_path.clone();

        std::fs::write(home.join("stray.txt"), "x").unwrap();
        let report = service.reset_filesystem(&id).await.unwrap();
        assert!(report.is_success());
        assert!(!home.join("stray.txt").exists());

        let actions = service.actions(&id).unwrap();
        assert!(actions.last().unwrap().is_reset());
    }

    #[tokio::test]
    async fn test_task_view_shows_init_tour_first() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, MockRuntime::new());
        let (_, first) = started(&service).await;

        let view = service.task_view(&first.task_session.session_id).await.unwrap();
        assert_eq!(view.page_tour.as_deref(), Some("init_filesystem_change"));
        assert_eq!(view.order_number, 1);
        assert_eq!(view.total, 1);
        assert_eq!(view.treatment, None);
        assert!(view.port.is_some());
        assert!(view.goal_filesystem.is_some());

        let second = expect_task(
            service
                .next_task(&first.task_session.session_id, TaskStatus::Passed)
                .await
                .unwrap(),
        );
        let view = service.task_view(&second.task_session.session_id).await.unwrap();
        assert_eq!(view.page_tour.as_deref(), Some("first_standard_output"));
        assert_eq!(view.treatment, Some(Treatment::A));
        assert_eq!(view.total, 3);
    }

    async fn scored(service: &TestService) -> (String, TaskAssignment) {
        let (study_id, first) = started(service).await;
        let second = expect_task(
            service
                .next_task(&first.task_session.session_id, TaskStatus::Passed)
                .await
                .unwrap(),
        );
        (study_id, second)
    }

    #[tokio::test]
    async fn test_resume_keeps_latest_healthy_session() {
        let dir = TempDir::new().unwrap();
        let runtime = MockRuntime::new();
        let service = service(&dir, runtime.clone());

        let abandoned = service.start_study("p1").unwrap();
        let (stale_id, stale_task) = scored(&service).await;
        let (live_id, _) = scored(&service).await;
        service.pause_study(&live_id).unwrap();

        // The earlier session lost its task without the study noticing
        let mut lost = stale_task.task_session.clone();
        lost.status = TaskStatus::Quit;
        service.store().task_sessions().update(lost).unwrap();

        let resumed = service.resume("p1").await.unwrap().unwrap();
        assert_eq!(resumed.session_id, live_id);
        assert_eq!(resumed.status, StudyStatus::Running);

        let stale = service.store().study_sessions().get(&stale_id).unwrap();
        assert_eq!(stale.status, StudyStatus::ClosedWithError);
        assert!(stale.current_task_session_id.is_none());

        let abandoned = service
            .store()
            .study_sessions()
            .get(&abandoned.session_id)
            .unwrap();
        assert_eq!(abandoned.status, StudyStatus::PreConsent);
        assert_eq!(runtime.live_containers().len(), 1);
    }

    #[tokio::test]
    async fn test_close_study_releases_sandbox() {
        let dir = TempDir::new().unwrap();
        let runtime = MockRuntime::new();
        let service = service(&dir, runtime.clone());
        let (study_id, current) = scored(&service).await;

        let study = service
            .close_study(&study_id, CloseReason::ClosedWithError)
            .await
            .unwrap();
        assert_eq!(study.status, StudyStatus::ClosedWithError);
        assert!(runtime.live_containers().is_empty());

        let task_session = service
            .store()
            .task_sessions()
            .get(&current.task_session.session_id)
            .unwrap();
        assert!(task_session.sandbox.is_none());
        assert!(service.resume("p1").await.unwrap().is_none());
    }
}
