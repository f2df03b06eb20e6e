//! Running a single subtask to completion.
//!
//! The executor marks the subtask `in_progress`, starts an agent and hands the
//! agent's completion to a detached handler that writes the outcome to the
//! store. The caller then waits on the store itself: the subtask may also be
//! finished (or abandoned) by someone else, e.g. a user skipping it, deleting
//! it or pausing the task.

use std::fmt;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};

use super::prompts::{dev_subtask_prompt, qa_prompt_with_context};
use super::Orchestrator;
use crate::agent::{AgentCompletion, AgentRequest};
use crate::task::{
    AgentAssignment, AgentHandle, SubtaskStatus, SubtaskType, Task, TaskLog, TaskPhase, TaskStatus,
};

/// How a wait for one subtask ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    /// Already completed before the executor got to it (user skip)
    AlreadyCompleted,
    /// The subtask was removed from the task
    Deleted,
    TaskBlocked,
    TaskCompleted,
    /// The assignment was cleared by a pause
    Paused,
    TaskMissing,
    TimedOut,
}

impl WaitOutcome {
    /// Whether the loop should move on to the next subtask.
    pub fn should_continue(&self) -> bool {
        matches!(self, Self::Completed | Self::AlreadyCompleted | Self::Deleted)
    }
}

impl fmt::Display for WaitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::AlreadyCompleted => "already completed",
            Self::Deleted => "deleted",
            Self::TaskBlocked => "task blocked",
            Self::TaskCompleted => "task completed",
            Self::Paused => "task paused",
            Self::TaskMissing => "task deleted",
            Self::TimedOut => "timed out",
        };
        f.write_str(s)
    }
}

enum Claim {
    Started(Task),
    Done(WaitOutcome),
}

/// Inspect fresh task state. `None` means keep waiting.
fn observe(task: Option<&Task>, subtask_id: &str) -> Option<WaitOutcome> {
    let Some(task) = task else {
        return Some(WaitOutcome::TaskMissing);
    };
    let Some(subtask) = task.subtask(subtask_id) else {
        return Some(WaitOutcome::Deleted);
    };
    if subtask.is_completed() {
        return Some(WaitOutcome::Completed);
    }
    match task.status {
        TaskStatus::Blocked => return Some(WaitOutcome::TaskBlocked),
        TaskStatus::Completed => return Some(WaitOutcome::TaskCompleted),
        _ => {}
    }
    if task.assigned_agent.is_idle() {
        return Some(WaitOutcome::Paused);
    }
    None
}

impl Orchestrator {
    /// Execute one subtask and wait until it is resolved one way or another.
    pub(crate) async fn execute_subtask(
        &self,
        task_id: &str,
        subtask_id: &str,
        log: &TaskLog,
    ) -> crate::Result<WaitOutcome> {
        // Subscribe before anything can complete so no change is missed.
        let changes = self.store.subscribe();

        let claim = self
            .store
            .update(task_id, |task| {
                let Some(subtask) = task.subtask_mut(subtask_id) else {
                    return Claim::Done(WaitOutcome::Deleted);
                };
                if subtask.is_completed() {
                    return Claim::Done(WaitOutcome::AlreadyCompleted);
                }
                subtask.status = SubtaskStatus::InProgress;
                task.status = TaskStatus::InProgress;
                Claim::Started(task.clone())
            })
            .await?;

        let task = match claim {
            None => return Ok(WaitOutcome::TaskMissing),
            Some(Claim::Done(outcome)) => return Ok(outcome),
            Some(Claim::Started(task)) => task,
        };
        let Some(subtask) = task.subtask(subtask_id) else {
            return Ok(WaitOutcome::Deleted);
        };

        let prompt = match subtask.kind {
            SubtaskType::Dev => dev_subtask_prompt(subtask, task.qa_failure_feedback.as_deref()),
            SubtaskType::Qa => qa_prompt_with_context(subtask, &task),
        };
        let request = AgentRequest {
            task_id: task_id.to_string(),
            prompt,
            working_dir: task.working_dir(self.store.project_dir()),
        };

        let run = match self.agents.start_agent(request).await {
            Ok(run) => run,
            Err(e) => {
                log.error(format!("Failed to start agent: {:#}", e)).await;
                self.store
                    .update(task_id, |task| {
                        if let Some(subtask) = task.subtask_mut(subtask_id) {
                            subtask.status = SubtaskStatus::Pending;
                        }
                        task.status = TaskStatus::Blocked;
                        task.assigned_agent = AgentAssignment::Idle;
                    })
                    .await?;
                return Ok(WaitOutcome::TaskBlocked);
            }
        };

        log.line(format!(
            "[Agent Started for {} Subtask] Thread ID: {}",
            if subtask.is_qa() { "QA" } else { "Dev" },
            run.handle
        ))
        .await;

        // A pause, skip or delete may have landed while the agent was starting;
        // each takes the subtask out of `in_progress`. The assignment can be
        // `Idle` here legitimately, so it is not checked.
        let handle = run.handle.clone();
        let assigned = self
            .store
            .update(task_id, |task| {
                let claimed = task
                    .subtask(subtask_id)
                    .is_some_and(|s| s.status == SubtaskStatus::InProgress);
                if !claimed {
                    return Err(observe(Some(&*task), subtask_id).unwrap_or(WaitOutcome::Paused));
                }
                task.assigned_agent = AgentAssignment::Running(handle);
                Ok(())
            })
            .await?;
        let abandoned = match assigned {
            None => Some(WaitOutcome::TaskMissing),
            Some(Err(outcome)) => Some(outcome),
            Some(Ok(())) => None,
        };
        if let Some(outcome) = abandoned {
            log.line(format!(
                "[Orchestrator] Subtask {} released during agent start ({}), stopping {}",
                subtask_id, outcome, run.handle
            ))
            .await;
            self.agents.stop_agent(&run.handle).await;
            return Ok(outcome);
        }

        let orchestrator = self.clone();
        let handler_task_id = task_id.to_string();
        let handler_subtask_id = subtask_id.to_string();
        let handler_log = log.clone();
        tokio::spawn(async move {
            let handle = run.handle.clone();
            let completion = run.finished().await;
            orchestrator
                .handle_subtask_completion(
                    &handler_task_id,
                    &handler_subtask_id,
                    &handle,
                    completion,
                    &handler_log,
                )
                .await;
        });

        let outcome = self.wait_for_subtask(task_id, subtask_id, changes).await?;
        if outcome == WaitOutcome::TimedOut {
            log.error(format!(
                "Timed out after {:?} waiting for subtask {}",
                self.config.subtask_wait,
                subtask_id
            ))
            .await;
        }
        Ok(outcome)
    }

    /// Wait for the subtask to resolve, waking on store changes and, as a
    /// fallback, on a fixed interval. Gives up after the configured timeout
    /// without touching task state.
    async fn wait_for_subtask(
        &self,
        task_id: &str,
        subtask_id: &str,
        mut changes: tokio::sync::broadcast::Receiver<String>,
    ) -> crate::Result<WaitOutcome> {
        let deadline = Instant::now() + self.config.subtask_wait;
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut subscribed = true;
        let mut check = true;

        loop {
            if check {
                let task = self.store.load(task_id).await?;
                if let Some(outcome) = observe(task.as_ref(), subtask_id) {
                    return Ok(outcome);
                }
            }
            check = true;

            tokio::select! {
                _ = sleep_until(deadline) => return Ok(WaitOutcome::TimedOut),
                changed = changes.recv(), if subscribed => match changed {
                    Ok(id) => check = id == task_id,
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => subscribed = false,
                },
                _ = ticker.tick() => {}
            }
        }
    }

    /// Apply an agent's completion to the stored task.
    ///
    /// Failures block the task unless the subtask was already resolved by
    /// someone else, the task was paused (assignment cleared) or another
    /// agent has been assigned since.
    pub(crate) async fn handle_subtask_completion(
        &self,
        task_id: &str,
        subtask_id: &str,
        handle: &AgentHandle,
        completion: AgentCompletion,
        log: &TaskLog,
    ) {
        log.line(format!(
            "\n[Subtask {} Completed] Success: {}",
            subtask_id, completion.success
        ))
        .await;

        if completion.success {
            log.output(&completion.output).await;
            let result = self
                .store
                .update(task_id, |task| {
                    let Some(subtask) = task.subtask_mut(subtask_id) else {
                        return false;
                    };
                    if !subtask.is_completed() {
                        subtask.mark_completed();
                    }
                    // The assignment stays set: the loop is still running.
                    if task.phase == TaskPhase::InProgress && task.all_dev_completed() {
                        task.set_phase(TaskPhase::AiReview).is_ok()
                    } else {
                        false
                    }
                })
                .await;
            match result {
                Ok(Some(true)) => {
                    log.banner("[ALL DEV SUBTASKS COMPLETED - Moving to AI Review]")
                        .await
                }
                Ok(_) => {}
                Err(e) => log.error(format!("Failed to record completion: {:#}", e)).await,
            }
            return;
        }

        let error = completion
            .error
            .unwrap_or_else(|| "Agent reported failure without an error message".to_string());
        log.error(&error).await;

        let result = self
            .store
            .update(task_id, |task| {
                if task.assigned_agent.is_idle() {
                    return Some("[Orchestrator] Task was paused - skipping error handler");
                }
                if task.assigned_agent.handle() != Some(handle) {
                    return Some("[Orchestrator] Agent was replaced - skipping error handler");
                }
                match task.subtask_mut(subtask_id) {
                    None => {
                        return Some("[Orchestrator] Subtask was deleted - skipping error handler")
                    }
                    Some(subtask) if subtask.is_completed() => {
                        return Some("[Orchestrator] Subtask was skipped - skipping error handler")
                    }
                    Some(subtask) => subtask.status = SubtaskStatus::Pending,
                }
                task.status = TaskStatus::Blocked;
                task.assigned_agent = AgentAssignment::Idle;
                None
            })
            .await;

        match result {
            Ok(Some(Some(note))) => log.line(note).await,
            Ok(Some(None)) => log.line("[Orchestrator] Task blocked - resume required").await,
            Ok(None) => {}
            Err(e) => log.error(format!("Failed to record failure: {:#}", e)).await,
        }
    }
}
