//! User-facing operations racing a running loop: pause, resume, skip,
//! delete, plus lock conflicts and stale-agent recovery.

mod common;

use std::time::Duration;

use code_automata::orchestrator::LockOperation;
use code_automata::task::{
    AgentAssignment, AgentHandle, PlanningStatus, Subtask, SubtaskStatus, SubtaskType, TaskPhase,
    TaskStatus,
};
use code_automata::Error;
use common::*;
use tempfile::tempdir;

fn running_on(subtask_id: &'static str) -> impl Fn(&code_automata::task::Task) -> bool {
    move |task| {
        task.subtask(subtask_id)
            .map(|s| s.status == SubtaskStatus::InProgress)
            .unwrap_or(false)
            && matches!(task.assigned_agent, AgentAssignment::Running(_))
    }
}

#[tokio::test]
async fn test_pause_then_resume() {
    let temp = tempdir().unwrap();
    let agent = ScriptedAgent::new(vec![
        Reply::Output(subtasks_json(&["Login form", "Session handling"], &["Check"])),
        Reply::Hang,
    ]);
    let checks = ScriptedChecks::new(vec![true]);
    let orch = orchestrator(temp.path(), agent.clone(), checks);
    let task = approved_task(&orch).await;

    let run = orch.start_development(&task.id).await.unwrap();
    wait_for(&orch, &task.id, running_on("subtask-1")).await;

    assert!(orch.pause(&task.id).await.unwrap());
    run.await.unwrap();

    // A user pause is not a failure
    let paused = orch.get_task(&task.id).await.unwrap();
    assert_eq!(paused.status, TaskStatus::Pending);
    assert_eq!(paused.phase, TaskPhase::InProgress);
    assert_eq!(paused.assigned_agent, AgentAssignment::Idle);
    assert_eq!(paused.in_progress_count(), 0);
    assert!(!orch.is_orchestrating(&task.id));

    let (reset, run) = orch.resume(&task.id).await.unwrap();
    assert_eq!(reset, 0);
    run.await.unwrap();

    let task = orch.get_task(&task.id).await.unwrap();
    assert_eq!(task.phase, TaskPhase::HumanReview);
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.subtasks.iter().all(|s| s.is_completed()));
}

#[tokio::test]
async fn test_skip_running_subtask() {
    let temp = tempdir().unwrap();
    let agent = ScriptedAgent::new(vec![
        Reply::Output(subtasks_json(&["Login form", "Session handling"], &["Check"])),
        Reply::Hang,
    ]);
    let orch = orchestrator(temp.path(), agent.clone(), ScriptedChecks::new(vec![true]));
    let task = approved_task(&orch).await;

    let run = orch.start_development(&task.id).await.unwrap();
    wait_for(&orch, &task.id, running_on("subtask-1")).await;

    let skipped = orch.skip_subtask(&task.id, "subtask-1").await.unwrap();
    assert!(skipped.subtask("subtask-1").unwrap().is_completed());
    run.await.unwrap();

    // The stopped agent's failure must not block the task
    let task = orch.get_task(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.phase, TaskPhase::HumanReview);
    assert_eq!(agent.prompts().len(), 4);

    let err = orch.skip_subtask(&task.id, "subtask-1").await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    let err = orch.skip_subtask(&task.id, "nope").await.unwrap_err();
    assert!(matches!(err, Error::SubtaskNotFound { .. }));
}

#[tokio::test]
async fn test_skip_last_dev_subtask_moves_to_ai_review() {
    let temp = tempdir().unwrap();
    let orch = orchestrator(temp.path(), ScriptedAgent::new(vec![]), ScriptedChecks::new(vec![]));
    let task = orch.create_task("t", "d", None).await.unwrap();
    orch.store()
        .update(&task.id, |task| {
            task.phase = TaskPhase::InProgress;
            task.subtasks = vec![
                Subtask::new("subtask-1", SubtaskType::Dev, "A", "a"),
                Subtask::new("subtask-qa-1", SubtaskType::Qa, "Verify", "v"),
            ];
        })
        .await
        .unwrap();

    let task = orch.skip_subtask(&task.id, "subtask-1").await.unwrap();
    assert_eq!(task.phase, TaskPhase::AiReview);
    assert_eq!(task.subtasks[1].status, SubtaskStatus::Pending);
}

#[tokio::test]
async fn test_delete_running_subtask() {
    let temp = tempdir().unwrap();
    let agent = ScriptedAgent::new(vec![
        Reply::Output(subtasks_json(&["Login form", "Session handling"], &["Check"])),
        Reply::Hang,
    ]);
    let orch = orchestrator(temp.path(), agent, ScriptedChecks::new(vec![true]));
    let task = approved_task(&orch).await;

    let run = orch.start_development(&task.id).await.unwrap();
    wait_for(&orch, &task.id, running_on("subtask-1")).await;

    orch.delete_subtask(&task.id, "subtask-1").await.unwrap();
    run.await.unwrap();

    let task = orch.get_task(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let ids: Vec<_> = task.subtasks.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, ["subtask-2", "subtask-verify-1"]);
    assert!(read_dev_log(&orch, &task.id)
        .await
        .contains("Subtask subtask-1 deleted by user"));
}

#[tokio::test]
async fn test_start_development_respects_lock() {
    let temp = tempdir().unwrap();
    let orch = orchestrator(temp.path(), ScriptedAgent::new(vec![]), ScriptedChecks::new(vec![]));
    let task = approved_task(&orch).await;

    assert!(orch.locks().acquire(&task.id, LockOperation::Resuming));
    let err = orch.start_development(&task.id).await.unwrap_err();
    assert!(matches!(err, Error::Locked(_)));

    // Nothing was recorded for the refused start
    let unchanged = orch.get_task(&task.id).await.unwrap();
    assert_eq!(unchanged.assigned_agent, AgentAssignment::Idle);
    assert_eq!(unchanged.phase, TaskPhase::Planning);

    orch.locks().release(&task.id);
    orch.start_development(&task.id).await.unwrap().await.unwrap();
    assert!(!orch.locks().is_locked(&task.id));
}

#[tokio::test]
async fn test_second_start_is_rejected_while_running() {
    let temp = tempdir().unwrap();
    let agent = ScriptedAgent::new(vec![
        Reply::Output(subtasks_json(&["Login form"], &["Check"])),
        Reply::Hang,
    ]);
    let orch = orchestrator(temp.path(), agent, ScriptedChecks::new(vec![]));
    let task = approved_task(&orch).await;

    let run = orch.start_development(&task.id).await.unwrap();
    wait_for(&orch, &task.id, running_on("subtask-1")).await;

    assert!(orch.is_orchestrating(&task.id));
    assert!(matches!(
        orch.resume(&task.id).await.unwrap_err(),
        Error::AlreadyRunning(_)
    ));
    assert!(matches!(
        orch.start_development(&task.id).await.unwrap_err(),
        Error::InvalidState(_)
    ));

    orch.pause(&task.id).await.unwrap();
    run.await.unwrap();
}

#[tokio::test]
async fn test_start_development_preconditions() {
    let temp = tempdir().unwrap();
    let orch = orchestrator(temp.path(), ScriptedAgent::new(vec![]), ScriptedChecks::new(vec![]));
    let task = orch.create_task("t", "d", None).await.unwrap();

    assert!(matches!(
        orch.start_development(&task.id).await.unwrap_err(),
        Error::InvalidState(_)
    ));
    assert!(matches!(
        orch.approve_plan(&task.id).await.unwrap_err(),
        Error::InvalidState(_)
    ));
    assert!(matches!(
        orch.create_task("  ", "d", None).await.unwrap_err(),
        Error::InvalidState(_)
    ));
}

#[tokio::test]
async fn test_resume_resets_interrupted_subtasks() {
    let temp = tempdir().unwrap();
    let checks = ScriptedChecks::new(vec![true]);
    let orch = orchestrator(temp.path(), ScriptedAgent::new(vec![]), checks.clone());
    let task = orch.create_task("t", "d", None).await.unwrap();

    assert!(matches!(
        orch.resume(&task.id).await.unwrap_err(),
        Error::InvalidState(_)
    ));
    // The refused resume left no lock behind
    assert!(!orch.locks().is_locked(&task.id));

    orch.store()
        .update(&task.id, |task| {
            task.phase = TaskPhase::InProgress;
            task.status = TaskStatus::Blocked;
            let mut interrupted = Subtask::new("subtask-1", SubtaskType::Dev, "A", "a");
            interrupted.status = SubtaskStatus::InProgress;
            task.subtasks = vec![
                interrupted,
                Subtask::new("subtask-qa-1", SubtaskType::Qa, "Verify", "v"),
            ];
        })
        .await
        .unwrap();

    let (reset, run) = orch.resume(&task.id).await.unwrap();
    assert_eq!(reset, 1);
    run.await.unwrap();

    let task = orch.get_task(&task.id).await.unwrap();
    assert_eq!(task.phase, TaskPhase::HumanReview);
    assert_eq!(checks.runs(), 1);
    assert!(read_dev_log(&orch, &task.id)
        .await
        .contains("reset 1 in-progress subtask(s)"));
}

#[tokio::test]
async fn test_list_clears_stale_agents() {
    let temp = tempdir().unwrap();
    let agent = ScriptedAgent::new(vec![]);
    let orch = orchestrator(temp.path(), agent, ScriptedChecks::new(vec![]));

    let ghost = orch.create_task("ghost", "", None).await.unwrap();
    orch.store()
        .update(&ghost.id, |task| {
            task.phase = TaskPhase::InProgress;
            task.assigned_agent = AgentAssignment::Running(AgentHandle::from("thread-gone"));
            let mut subtask = Subtask::new("subtask-1", SubtaskType::Dev, "A", "a");
            subtask.status = SubtaskStatus::InProgress;
            task.subtasks.push(subtask);
        })
        .await
        .unwrap();

    let locked = orch.create_task("locked", "", None).await.unwrap();
    orch.store()
        .update(&locked.id, |task| {
            task.assigned_agent = AgentAssignment::Starting
        })
        .await
        .unwrap();
    assert!(orch.locks().acquire(&locked.id, LockOperation::Starting));

    let tasks = orch.list_tasks().await.unwrap();
    assert_eq!(tasks.len(), 2);
    let find = |id: &str| tasks.iter().find(|t| t.id == id).unwrap().clone();

    let ghost = find(&ghost.id);
    assert_eq!(ghost.assigned_agent, AgentAssignment::Idle);
    assert_eq!(ghost.subtasks[0].status, SubtaskStatus::Pending);
    assert_eq!(find(&locked.id).assigned_agent, AgentAssignment::Starting);

    // The cleared assignment was persisted
    let stored = orch.get_task(&ghost.id).await.unwrap();
    assert_eq!(stored.assigned_agent, AgentAssignment::Idle);
}

#[tokio::test]
async fn test_orphaned_resume_marker_is_recovered_after_restart() {
    let temp = tempdir().unwrap();
    let old = orchestrator(temp.path(), ScriptedAgent::new(vec![]), ScriptedChecks::new(vec![]));
    let task = old.create_task("t", "d", None).await.unwrap();
    old.store()
        .update(&task.id, |task| {
            task.phase = TaskPhase::InProgress;
            task.status = TaskStatus::InProgress;
            task.assigned_agent = AgentAssignment::Resuming;
            task.subtasks = vec![Subtask::new("subtask-1", SubtaskType::Dev, "A", "a")];
        })
        .await
        .unwrap();

    // A fresh process over the same project has no lock and no active run
    let checks = ScriptedChecks::new(vec![true]);
    let fresh = orchestrator(temp.path(), ScriptedAgent::new(vec![]), checks.clone());
    let listed = fresh.list_tasks().await.unwrap();
    assert_eq!(listed[0].assigned_agent, AgentAssignment::Idle);

    let (_, run) = fresh.resume(&task.id).await.unwrap();
    run.await.unwrap();
    let task = fresh.get_task(&task.id).await.unwrap();
    assert_eq!(task.phase, TaskPhase::HumanReview);
    assert_eq!(checks.runs(), 1);
}

#[tokio::test]
async fn test_delete_task_removes_everything() {
    let temp = tempdir().unwrap();
    let orch = orchestrator(temp.path(), ScriptedAgent::new(vec![]), ScriptedChecks::new(vec![]));
    let task = orch.create_task("t", "d", None).await.unwrap();
    let task_dir = orch.store().task_dir(&task.id);
    std::fs::create_dir_all(&task_dir).unwrap();
    std::fs::write(task_dir.join("development-logs.txt"), "log").unwrap();

    orch.delete_task(&task.id).await.unwrap();

    assert!(matches!(
        orch.get_task(&task.id).await.unwrap_err(),
        Error::TaskNotFound(_)
    ));
    assert!(!orch.store().task_dir(&task.id).exists());
    assert!(matches!(
        orch.delete_task(&task.id).await.unwrap_err(),
        Error::TaskNotFound(_)
    ));
}

#[tokio::test]
async fn test_pause_while_agent_is_starting() {
    let temp = tempdir().unwrap();
    let agent = ScriptedAgent::new(vec![
        Reply::Output(subtasks_json(&["Login form"], &["Check"])),
        Reply::SlowHang(Duration::from_millis(300)),
    ]);
    let checks = ScriptedChecks::new(vec![]);
    let orch = orchestrator(temp.path(), agent.clone(), checks.clone());
    let task = approved_task(&orch).await;

    let run = orch.start_development(&task.id).await.unwrap();
    wait_for(&orch, &task.id, |task| {
        task.subtask("subtask-1")
            .map(|s| s.status == SubtaskStatus::InProgress)
            .unwrap_or(false)
    })
    .await;
    orch.pause(&task.id).await.unwrap();
    run.await.unwrap();

    // The late-starting agent was stopped instead of taking the task back
    let task = orch.get_task(&task.id).await.unwrap();
    assert_eq!(task.assigned_agent, AgentAssignment::Idle);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.subtasks[0].status, SubtaskStatus::Pending);
    assert_eq!(agent.hanging_count(), 0);
    assert_eq!(checks.runs(), 0);
    assert!(read_dev_log(&orch, &task.id)
        .await
        .contains("released during agent start"));
}

#[tokio::test]
async fn test_plan_generation_holds_the_lock() {
    let temp = tempdir().unwrap();
    let agent = ScriptedAgent::new(vec![Reply::Hang]);
    let orch = orchestrator(temp.path(), agent.clone(), ScriptedChecks::new(vec![]));
    let task = orch.create_task("Add login", "", None).await.unwrap();

    assert!(orch.locks().acquire(&task.id, LockOperation::Resuming));
    assert!(matches!(
        orch.generate_plan(&task.id).await.unwrap_err(),
        Error::Locked(_)
    ));
    let unchanged = orch.get_task(&task.id).await.unwrap();
    assert_eq!(unchanged.assigned_agent, AgentAssignment::Idle);
    assert!(unchanged.planning_status.is_none());
    orch.locks().release(&task.id);

    let run = orch.generate_plan(&task.id).await.unwrap();
    assert!(orch.locks().is_locked(&task.id));
    wait_for(&orch, &task.id, |task| {
        matches!(task.assigned_agent, AgentAssignment::Running(_))
    })
    .await;

    // Listing while generating must not mistake the run for a ghost
    let listed = orch.list_tasks().await.unwrap();
    assert!(matches!(listed[0].assigned_agent, AgentAssignment::Running(_)));

    orch.pause(&task.id).await.unwrap();
    run.await.unwrap();
    assert!(!orch.locks().is_locked(&task.id));
    assert_eq!(orch.get_task(&task.id).await.unwrap().status, TaskStatus::Pending);
}

async fn task_in_phase(orch: &code_automata::Orchestrator, phase: TaskPhase) -> String {
    let task = approved_task(orch).await;
    orch.store()
        .update(&task.id, |task| {
            task.phase = phase;
            task.status = TaskStatus::Completed;
            task.qa_failure_feedback = Some("## Lint Errors".to_string());
            task.subtasks = vec![Subtask::new("subtask-1", SubtaskType::Dev, "A", "a")];
        })
        .await
        .unwrap();
    task.id
}

#[tokio::test]
async fn test_move_task_to_done_and_back_to_planning() {
    let temp = tempdir().unwrap();
    let orch = orchestrator(temp.path(), ScriptedAgent::new(vec![]), ScriptedChecks::new(vec![]));

    let id = task_in_phase(&orch, TaskPhase::HumanReview).await;
    let done = orch.move_task(&id, TaskPhase::Done).await.unwrap();
    assert_eq!(done.phase, TaskPhase::Done);
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(read_dev_log(&orch, &id)
        .await
        .contains("Moved from human_review to done by user"));

    let id = task_in_phase(&orch, TaskPhase::HumanReview).await;
    let replanned = orch.move_task(&id, TaskPhase::Planning).await.unwrap();
    assert_eq!(replanned.phase, TaskPhase::Planning);
    assert_eq!(replanned.status, TaskStatus::Pending);
    assert!(!replanned.plan_approved);
    assert!(replanned.qa_failure_feedback.is_none());
    assert_eq!(replanned.planning_status, Some(PlanningStatus::PlanReady));

    // Development has to wait for a fresh approval
    assert!(matches!(
        orch.start_development(&id).await.unwrap_err(),
        Error::InvalidState(_)
    ));
    orch.approve_plan(&id).await.unwrap();
}

#[tokio::test]
async fn test_move_task_rejects_backward_moves_into_the_loop() {
    let temp = tempdir().unwrap();
    let orch = orchestrator(temp.path(), ScriptedAgent::new(vec![]), ScriptedChecks::new(vec![]));

    let id = task_in_phase(&orch, TaskPhase::HumanReview).await;
    for target in [TaskPhase::AiReview, TaskPhase::InProgress] {
        assert!(matches!(
            orch.move_task(&id, target).await.unwrap_err(),
            Error::InvalidTransition { from: TaskPhase::HumanReview, .. }
        ));
    }
    let id = task_in_phase(&orch, TaskPhase::AiReview).await;
    assert!(matches!(
        orch.move_task(&id, TaskPhase::InProgress).await.unwrap_err(),
        Error::InvalidTransition { .. }
    ));
    assert_eq!(orch.get_task(&id).await.unwrap().phase, TaskPhase::AiReview);

    assert!(matches!(
        orch.move_task("task-missing", TaskPhase::Done).await.unwrap_err(),
        Error::TaskNotFound(_)
    ));
}

#[tokio::test]
async fn test_move_task_refused_while_running() {
    let temp = tempdir().unwrap();
    let agent = ScriptedAgent::new(vec![
        Reply::Output(subtasks_json(&["Login form"], &["Check"])),
        Reply::Hang,
    ]);
    let orch = orchestrator(temp.path(), agent, ScriptedChecks::new(vec![]));
    let task = approved_task(&orch).await;

    let run = orch.start_development(&task.id).await.unwrap();
    wait_for(&orch, &task.id, running_on("subtask-1")).await;
    assert!(matches!(
        orch.move_task(&task.id, TaskPhase::Planning).await.unwrap_err(),
        Error::AlreadyRunning(_)
    ));

    orch.pause(&task.id).await.unwrap();
    run.await.unwrap();
    let moved = orch.move_task(&task.id, TaskPhase::Planning).await.unwrap();
    assert_eq!(moved.phase, TaskPhase::Planning);
}
