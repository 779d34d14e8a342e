//! Integration tests for resuming interrupted studies

mod common;

use common::{begin, expect_task, service};
use shellstudy_core::docker::mock::MockRuntime;
use shellstudy_core::repository::{Repository, Store};
use shellstudy_core::scheduler::Group;
use shellstudy_core::study_session::StudyStatus;
use shellstudy_core::task_session::TaskStatus;
use tempfile::TempDir;

/// Start a study and complete both training tasks
async fn running_study(service: &common::TestService) -> (String, String) {
    let (study_id, mut current) = begin(service).await;
    for _ in 0..2 {
        current = expect_task(
            service
                .next_task(&current.task_session.session_id, TaskStatus::Passed)
                .await
                .unwrap(),
        );
    }
    (study_id, current.task_session.session_id)
}

#[tokio::test]
async fn test_stale_running_sessions_resolve_to_latest_healthy() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let service = service(&dir, runtime.clone(), Group::Group1);

    let (earlier_id, earlier_task) = running_study(&service).await;
    let (later_id, _) = running_study(&service).await;
    assert_eq!(later_id, "p1-study_session-2");

    // The earlier study lost its task session without noticing
    let mut orphan = service.store().task_sessions().get(&earlier_task).unwrap();
    orphan.status = TaskStatus::TimeOut;
    service.store().task_sessions().update(orphan).unwrap();

    let resumed = service.resume("p1").await.unwrap().unwrap();
    assert_eq!(resumed.session_id, later_id);
    assert_eq!(resumed.status, StudyStatus::Running);

    let earlier = service.store().study_sessions().get(&earlier_id).unwrap();
    assert_eq!(earlier.status, StudyStatus::ClosedWithError);
    assert!(earlier.close_time.is_some());
    assert_eq!(runtime.live_containers().len(), 1);

    // Resuming again is stable
    let again = service.resume("p1").await.unwrap().unwrap();
    assert_eq!(again.session_id, later_id);
}

#[tokio::test]
async fn test_two_healthy_sessions_keep_only_latest() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let service = service(&dir, runtime.clone(), Group::Group1);

    let (first_id, _) = running_study(&service).await;
    let (second_id, _) = running_study(&service).await;
    service.pause_study(&second_id).unwrap();

    let resumed = service.resume("p1").await.unwrap().unwrap();
    assert_eq!(resumed.session_id, second_id);
    assert_eq!(resumed.status, StudyStatus::Running);

    let first = service.store().study_sessions().get(&first_id).unwrap();
    assert_eq!(first.status, StudyStatus::ClosedWithError);
    assert_eq!(runtime.live_containers().len(), 1);
}

#[tokio::test]
async fn test_missing_task_session_closes_study() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir, MockRuntime::new(), Group::Group3);
    let (study_id, _) = running_study(&service).await;

    let mut study = service.store().study_sessions().get(&study_id).unwrap();
    study.current_task_session_id = Some(format!("{}-task-99", study_id));
    service.store().study_sessions().update(study).unwrap();

    assert!(service.resume("p1").await.unwrap().is_none());
    let study = service.store().study_sessions().get(&study_id).unwrap();
    assert_eq!(study.status, StudyStatus::ClosedWithError);
}

#[tokio::test]
async fn test_unknown_participant_has_nothing_to_resume() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir, MockRuntime::new(), Group::Group1);
    assert!(service.resume("nobody").await.unwrap().is_none());
}
