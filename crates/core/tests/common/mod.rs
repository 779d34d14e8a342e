//! Shared test helpers for core integration tests.
#![allow(dead_code)]

use shellstudy_core::config::{SandboxConfig, StudyConfig};
use shellstudy_core::diff::DiffOptions;
use shellstudy_core::docker::mock::MockRuntime;
use shellstudy_core::participant::Participant;
use shellstudy_core::repository::MemoryStore;
use shellstudy_core::sandbox::DirectoryProvisioner;
use shellstudy_core::scheduler::{Group, ScheduleConfig};
use shellstudy_core::service::{NextStep, StudyService, TaskAssignment};
use shellstudy_core::snapshot::FsNode;
use shellstudy_core::task::TaskRecord;
use std::sync::Arc;
use tempfile::TempDir;

pub type TestService = StudyService<MemoryStore, MockRuntime, DirectoryProvisioner>;

pub const TRAINING: [u32; 2] = [21, 22];
pub const BLOCK_I: [u32; 9] = [5, 10, 6, 9, 19, 1, 18, 17, 16];
pub const BLOCK_II: [u32; 9] = [8, 7, 2, 14, 12, 4, 13, 15, 11];

/// Initial tree shared by every test task
pub fn website() -> FsNode {
    FsNode::directory(
        "home",
        vec![FsNode::directory(
            "website",
            vec![
                FsNode::file("index.html", "<html/>"),
                FsNode::file("about.html", "<p>about</p>"),
            ],
        )],
    )
}

/// A stdout task whose expected output is `done`
pub fn stdout_task(task_id: u32) -> TaskRecord {
    TaskRecord {
        task_id,
        task_type: "stdout".to_string(),
        description: format!("Print done for task {}", task_id),
        file_attributes: String::new(),
        initial_filesystem: website(),
        goal_filesystem: None,
        stdout: Some("done".to_string()),
        duration_secs: 300,
        fixups: vec![],
    }
}

pub fn study_config(dir: &TempDir) -> StudyConfig {
    let mut sandbox = SandboxConfig::new("shellstudy/sandbox:test", dir.path().join("fs"));
    sandbox.startup_timeout_secs = 1;
    sandbox.poll_interval_ms = 10;
    let schedule = ScheduleConfig {
        training: TRAINING.to_vec(),
        block_i: BLOCK_I.to_vec(),
        block_ii: BLOCK_II.to_vec(),
    };
    StudyConfig {
        sandbox,
        tasks: schedule.all_ids().map(stdout_task).collect(),
        schedule,
        tasks_file: None,
        diff: DiffOptions::default(),
    }
}

/// Service over `config` with participant `p1` registered in `group`
pub fn service_with(config: StudyConfig, dir: &TempDir, runtime: MockRuntime, group: Group) -> TestService {
    let service = StudyService::new(
        Arc::new(config),
        MemoryStore::new(),
        runtime,
        DirectoryProvisioner::new(dir.path().join("fs")),
    )
    .unwrap();
    service
        .register_participant(Participant::new("p1", "Grace", "Hopper", group))
        .unwrap();
    service
}

pub fn service(dir: &TempDir, runtime: MockRuntime, group: Group) -> TestService {
    service_with(study_config(dir), dir, runtime, group)
}

/// Start a study for `p1` and serve the first training task
pub async fn begin(service: &TestService) -> (String, TaskAssignment) {
    let study = service.start_study("p1").unwrap();
    service.give_consent(&study.session_id).unwrap();
    let first = service.begin_training(&study.session_id).await.unwrap();
    (study.session_id, first)
}

pub fn expect_task(step: NextStep) -> TaskAssignment {
    match step {
        NextStep::Task(assignment) => assignment,
        other => panic!("expected another task, got {:?}", other),
    }
}
