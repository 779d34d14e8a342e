//! Integration tests for complete study runs without a container runtime
//!
//! The mock runtime stands in for docker; sandbox homes are plain directories
//! under a temporary filesystem root.

mod common;

use common::{begin, expect_task, service, BLOCK_I, BLOCK_II, TRAINING};
use shellstudy_core::docker::mock::MockRuntime;
use shellstudy_core::repository::{Repository, Store};
use shellstudy_core::scheduler::{Group, Stage, Treatment};
use shellstudy_core::service::{NextStep, StudySummary};
use shellstudy_core::study_session::StudyStatus;
use shellstudy_core::task_session::TaskStatus;
use tempfile::TempDir;

#[tokio::test]
async fn test_group1_runs_training_then_blocks_in_order() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let service = service(&dir, runtime.clone(), Group::Group1);
    let (study_id, first) = begin(&service).await;

    // Training
    let mut current = first;
    for (n, task_id) in TRAINING.iter().enumerate() {
        assert_eq!(current.task_session.task_id, *task_id);
        assert!(current.task_session.is_training);
        assert_eq!(
            current.task_session.session_id,
            format!("{}-training-task-{}", study_id, n + 1)
        );
        let study = service.store().study_sessions().get(&study_id).unwrap();
        assert_eq!(study.status, StudyStatus::Training);
        assert_eq!(study.num_tasks_completed, n);

        current = expect_task(
            service
                .next_task(&current.task_session.session_id, TaskStatus::Passed)
                .await
                .unwrap(),
        );
    }

    let study = service.store().study_sessions().get(&study_id).unwrap();
    assert_eq!(study.status, StudyStatus::Running);
    assert_eq!(study.num_tasks_completed, 0);
    assert!(current.stage_change);

    // Scored tasks: block I then block II
    let expected: Vec<u32> = BLOCK_I.iter().chain(BLOCK_II.iter()).copied().collect();
    let mut finished = None;
    for (n, task_id) in expected.iter().enumerate() {
        assert_eq!(current.task_session.task_id, *task_id);
        assert!(!current.task_session.is_training);
        let stage = if n < BLOCK_I.len() { Stage::I } else { Stage::II };
        assert_eq!(current.task_session.stage, stage, "task {}", n);
        assert_eq!(current.stage_change, n == 0 || n == BLOCK_I.len());

        let view = service
            .task_view(&current.task_session.session_id)
            .await
            .unwrap();
        assert_eq!(view.order_number, n + 1);
        assert_eq!(view.total, expected.len());
        let treatment = if n < BLOCK_I.len() { Treatment::A } else { Treatment::B };
        assert_eq!(view.treatment, Some(treatment));

        // One live sandbox at a time
        assert_eq!(runtime.live_containers().len(), 1);

        let reason = if n % 2 == 0 { TaskStatus::Passed } else { TaskStatus::Quit };
        match service
            .next_task(&current.task_session.session_id, reason)
            .await
            .unwrap()
        {
            NextStep::Task(next) => current = next,
            NextStep::Finished { summary, .. } => {
                finished = Some(summary);
                break;
            }
        }
    }

    assert_eq!(
        finished,
        Some(StudySummary {
            passed: 9,
            quit: 9,
            timed_out: 0,
            total: 18,
        })
    );
    let study = service.store().study_sessions().get(&study_id).unwrap();
    assert_eq!(study.status, StudyStatus::Finished);
    assert!(study.close_time.is_some());
    assert!(study.current_task_session_id.is_none());
    assert!(runtime.live_containers().is_empty());
    assert!(
        std::fs::read_dir(dir.path().join("fs")).unwrap().next().is_none(),
        "all filesystem roots should be deleted"
    );
}

#[tokio::test]
async fn test_group2_starts_with_block_ii() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir, MockRuntime::new(), Group::Group2);
    let (_, mut current) = begin(&service).await;
    for _ in TRAINING {
        current = expect_task(
            service
                .next_task(&current.task_session.session_id, TaskStatus::TimeOut)
                .await
                .unwrap(),
        );
    }
    assert_eq!(current.task_session.task_id, BLOCK_II[0]);
    assert_eq!(current.task_session.stage, Stage::I);
}

#[tokio::test]
async fn test_stdout_task_completion() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir, MockRuntime::new(), Group::Group1);
    let (_, first) = begin(&service).await;
    let id = first.task_session.session_id;

    let outcome = service
        .on_command(&id, "me@sandbox:~$ ./build.sh\ndone\nme@sandbox:~$ ")
        .await
        .unwrap();
    assert!(outcome.completed);

    let outcome = service
        .on_command(&id, "me@sandbox:~$ find website -type f\nwebsite/about.html\nwebsite/index.html\nme@sandbox:~$ ")
        .await
        .unwrap();
    assert!(!outcome.completed);
    // Stdout tasks compare against the initial tree, which is untouched
    assert!(!outcome.delta.has_differences);
    assert_eq!(
        outcome.observed_paths,
        vec!["website/about.html".to_string(), "website/index.html".to_string()]
    );
    let entry = outcome.delta.entry("website/index.html").unwrap();
    assert!(entry.highlight.is_some());

    let actions = service.actions(&id).unwrap();
    assert_eq!(actions.len(), 2);
    assert!(actions[0].action.contains("build.sh"));
}

#[tokio::test]
async fn test_commands_rejected_after_task_closes() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir, MockRuntime::new(), Group::Group1);
    let (_, first) = begin(&service).await;
    let id = first.task_session.session_id;

    service.next_task(&id, TaskStatus::Quit).await.unwrap();
    assert!(service.on_command(&id, "ls\n\n$").await.is_err());
    assert!(service.reset_filesystem(&id).await.is_err());
}
