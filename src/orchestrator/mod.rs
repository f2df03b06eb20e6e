//! Orchestrator - the task lifecycle controller.
//!
//! Public operations validate and record intent synchronously, then hand the
//! long-running work (agent invocations, checks) to a detached tokio task.
//! Every detached run holds a [`RunGuard`] that removes the task from the
//! active set and releases the orchestrator lock however the run ends.

mod dev_qa;
mod executor;
pub mod extract;
mod generation;
mod lock;
pub mod prompts;

pub use dev_qa::MAX_REWORK;
pub use executor::WaitOutcome;
pub use generation::{arrange_subtasks, MAX_PARSE_RETRIES};
pub use lock::{LockOperation, OrchestratorLock, SharedLock, LOCK_STALE_AFTER};

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::agent::AgentRef;
use crate::checks::ChecksRef;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::task::{
    clear_stale_agent, AgentAssignment, AgentHandle, LogKind, PlanningStatus, SubtaskStatus, Task,
    TaskLog, TaskPhase, TaskStatus, TaskStore,
};

/// Coordinates agents, checks and the task store.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<TaskStore>,
    agents: AgentRef,
    checks: ChecksRef,
    locks: SharedLock,
    config: Arc<Config>,
    /// Tasks with a detached run in flight
    active: Arc<Mutex<HashSet<String>>>,
}

/// Marks a task as actively orchestrated for the lifetime of a detached run.
struct RunGuard {
    orchestrator: Orchestrator,
    task_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.orchestrator.active_set().remove(&self.task_id);
        self.orchestrator.locks.release(&self.task_id);
        tracing::debug!("Orchestrator run for task {} ended", self.task_id);
    }
}

impl Orchestrator {
    pub fn new(config: Config, agents: AgentRef, checks: ChecksRef) -> Self {
        Self {
            store: Arc::new(TaskStore::new(config.project_dir.clone())),
            agents,
            checks,
            locks: Arc::new(OrchestratorLock::new()),
            config: Arc::new(config),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn locks(&self) -> &SharedLock {
        &self.locks
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn active_set(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a detached run is in flight or a start/resume holds the lock.
    pub fn is_orchestrating(&self, task_id: &str) -> bool {
        self.active_set().contains(task_id) || self.locks.is_locked(task_id)
    }

    pub(crate) fn dev_log(&self, task_id: &str) -> TaskLog {
        TaskLog::new(&self.store.task_dir(task_id), task_id, LogKind::Development)
    }

    pub(crate) fn review_log(&self, task_id: &str) -> TaskLog {
        TaskLog::new(&self.store.task_dir(task_id), task_id, LogKind::Review)
    }

    async fn require_task(&self, task_id: &str) -> Result<Task> {
        self.store
            .load(task_id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))
    }

    /// Run `work` in the background. Failures are logged to the task's
    /// development log and block the task.
    fn spawn_run<F>(&self, task_id: &str, what: &'static str, work: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.active_set().insert(task_id.to_string());
        let guard = RunGuard {
            orchestrator: self.clone(),
            task_id: task_id.to_string(),
        };

        tokio::spawn(async move {
            let task_id = guard.task_id.clone();
            if let Err(e) = work.await {
                tracing::error!(task_id = %task_id, "{} failed: {}", what, e);
                guard.orchestrator.block_after_error(&task_id, what, &e).await;
            }
            drop(guard);
        })
    }

    async fn block_after_error(&self, task_id: &str, what: &str, error: &Error) {
        self.dev_log(task_id)
            .error(format!("{} failed: {}", what, error))
            .await;
        let result = self
            .store
            .update(task_id, |task| {
                task.status = TaskStatus::Blocked;
                task.assigned_agent = AgentAssignment::Idle;
                task.reset_in_progress_subtasks();
            })
            .await;
        if let Err(e) = result {
            tracing::error!("Failed to block task {} after error: {}", task_id, e);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn create_task(
        &self,
        title: &str,
        description: &str,
        worktree_path: Option<PathBuf>,
    ) -> Result<Task> {
        if title.trim().is_empty() {
            return Err(Error::InvalidState("Task title must not be empty".to_string()));
        }
        let mut task = Task::new(title.trim(), description);
        task.worktree_path = worktree_path;
        self.store.save(&task).await?;
        tracing::info!("Created task {} ({})", task.id, task.title);
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.require_task(task_id).await
    }

    /// All tasks, newest first, with orphaned agent assignments cleared.
    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        let swept = self.locks.sweep_stale();
        if swept > 0 {
            tracing::info!("Dropped {} stale orchestrator lock(s)", swept);
        }
        let mut tasks = self.store.list().await?;
        for task in &mut tasks {
            let active = self.is_orchestrating(&task.id);
            let agents = &self.agents;
            if !clear_stale_agent(&mut task.clone(), active, |handle| agents.is_active(handle)) {
                continue;
            }
            let refreshed = self
                .store
                .update(&task.id, |fresh| {
                    clear_stale_agent(fresh, active, |handle| agents.is_active(handle));
                    fresh.clone()
                })
                .await?;
            if let Some(refreshed) = refreshed {
                *task = refreshed;
            }
        }
        Ok(tasks)
    }

    /// Start plan generation in the background.
    pub async fn generate_plan(&self, task_id: &str) -> Result<JoinHandle<()>> {
        if self.active_set().contains(task_id) {
            return Err(Error::AlreadyRunning(task_id.to_string()));
        }
        // Held until the run's guard drops, so the `Starting` marker is never
        // visible without a lock or an active run behind it.
        if !self.locks.acquire(task_id, LockOperation::Starting) {
            return Err(Error::Locked(task_id.to_string()));
        }
        let marked = self
            .store
            .try_update(task_id, |task| {
                if task.phase != TaskPhase::Planning {
                    return Err(Error::InvalidState(format!(
                        "Plans can only be generated in planning, task is in {}",
                        task.phase
                    )));
                }
                if !task.assigned_agent.is_idle() {
                    return Err(Error::AlreadyRunning(task.id.clone()));
                }
                task.assigned_agent = AgentAssignment::Starting;
                task.planning_status = Some(PlanningStatus::GeneratingPlan);
                task.plan_approved = false;
                task.status = TaskStatus::InProgress;
                Ok(())
            })
            .await;
        if let Err(e) = marked {
            self.locks.release(task_id);
            return Err(e);
        }

        let orchestrator = self.clone();
        let id = task_id.to_string();
        Ok(self.spawn_run(task_id, "Plan generation", async move {
            orchestrator.run_plan_generation(&id).await
        }))
    }

    pub async fn approve_plan(&self, task_id: &str) -> Result<Task> {
        self.store
            .try_update(task_id, |task| {
                if task.plan_content.is_none() {
                    return Err(Error::InvalidState("Task has no plan to approve".to_string()));
                }
                if task.phase != TaskPhase::Planning {
                    return Err(Error::InvalidState(format!(
                        "Plans can only be approved in planning, task is in {}",
                        task.phase
                    )));
                }
                task.plan_approved = true;
                task.planning_status = Some(PlanningStatus::PlanReady);
                Ok(task.clone())
            })
            .await
    }

    /// Move a task to another phase by hand.
    ///
    /// `ai_review → in_progress` belongs to the rework loop and is refused
    /// here. Moving back to `planning` replans: the plan has to be approved
    /// again and pending QA feedback is dropped.
    pub async fn move_task(&self, task_id: &str, phase: TaskPhase) -> Result<Task> {
        let (task, from) = self
            .store
            .try_update(task_id, |task| {
                if self.is_orchestrating(&task.id) || !task.assigned_agent.is_idle() {
                    return Err(Error::AlreadyRunning(task.id.clone()));
                }
                let from = task.phase;
                if from == phase {
                    return Ok((task.clone(), from));
                }
                if from == TaskPhase::AiReview && phase == TaskPhase::InProgress {
                    return Err(Error::InvalidTransition { from, to: phase });
                }
                task.set_phase(phase)?;

                match phase {
                    TaskPhase::Planning => {
                        task.plan_approved = false;
                        task.planning_status =
                            task.plan_content.as_ref().map(|_| PlanningStatus::PlanReady);
                        task.qa_failure_feedback = None;
                        task.status = TaskStatus::Pending;
                    }
                    TaskPhase::HumanReview | TaskPhase::Done => {
                        task.status = TaskStatus::Completed;
                    }
                    // The loop picks these up on resume
                    TaskPhase::InProgress | TaskPhase::AiReview => {
                        task.status = TaskStatus::Pending;
                    }
                }
                Ok((task.clone(), from))
            })
            .await?;

        if from != phase {
            tracing::info!("Moved task {} from {} to {}", task_id, from, phase);
            self.dev_log(task_id)
                .line(format!("[Phase] Moved from {} to {} by user", from, phase))
                .await;
        }
        if phase == TaskPhase::Done {
            if let Some(path) = &task.worktree_path {
                tracing::info!("Task {} done, worktree kept at {}", task_id, path.display());
            }
        }
        Ok(task)
    }

    /// Generate subtasks from the approved plan, then run the dev+QA loop,
    /// all in the background.
    pub async fn start_development(&self, task_id: &str) -> Result<JoinHandle<()>> {
        let task = self.require_task(task_id).await?;
        if !task.plan_approved || task.plan_content.is_none() {
            return Err(Error::InvalidState(
                "Task must have an approved plan before starting development".to_string(),
            ));
        }
        if task.phase != TaskPhase::Planning {
            return Err(Error::InvalidState(format!(
                "Development already started (phase {}), use resume instead",
                task.phase
            )));
        }
        if !task.assigned_agent.is_idle() || self.active_set().contains(task_id) {
            return Err(Error::AlreadyRunning(task_id.to_string()));
        }
        if !self.locks.acquire(task_id, LockOperation::Starting) {
            return Err(Error::Locked(task_id.to_string()));
        }

        let marked = self
            .store
            .try_update(task_id, |task| {
                if !task.assigned_agent.is_idle() {
                    return Err(Error::AlreadyRunning(task.id.clone()));
                }
                task.assigned_agent = AgentAssignment::Starting;
                task.planning_status = Some(PlanningStatus::GeneratingSubtasks);
                task.status = TaskStatus::InProgress;
                Ok(())
            })
            .await;
        if let Err(e) = marked {
            self.locks.release(task_id);
            return Err(e);
        }

        let orchestrator = self.clone();
        let id = task_id.to_string();
        Ok(self.spawn_run(task_id, "Development", async move {
            if orchestrator.run_subtask_generation(&id).await? {
                orchestrator.run_dev_qa_loop(&id).await?;
            }
            Ok(())
        }))
    }

    /// Re-enter the dev+QA loop for an interrupted or blocked task.
    /// Returns how many in-progress subtasks were reset to pending.
    pub async fn resume(&self, task_id: &str) -> Result<(usize, JoinHandle<()>)> {
        if self.active_set().contains(task_id) {
            return Err(Error::AlreadyRunning(task_id.to_string()));
        }
        if !self.locks.acquire(task_id, LockOperation::Resuming) {
            return Err(Error::Locked(task_id.to_string()));
        }

        let reset = self
            .store
            .try_update(task_id, |task| {
                if !matches!(task.phase, TaskPhase::InProgress | TaskPhase::AiReview) {
                    return Err(Error::InvalidState(format!(
                        "Only tasks in in_progress or ai_review can be resumed, task is in {}",
                        task.phase
                    )));
                }
                if !task.assigned_agent.is_idle() {
                    return Err(Error::AlreadyRunning(task.id.clone()));
                }
                let reset = task.reset_in_progress_subtasks();
                task.assigned_agent = AgentAssignment::Resuming;
                task.status = TaskStatus::InProgress;
                Ok(reset)
            })
            .await;
        let reset = match reset {
            Ok(reset) => reset,
            Err(e) => {
                self.locks.release(task_id);
                return Err(e);
            }
        };

        self.dev_log(task_id)
            .line(format!(
                "\n[Resume] Resuming task, reset {} in-progress subtask(s)",
                reset
            ))
            .await;

        let orchestrator = self.clone();
        let id = task_id.to_string();
        let handle = self.spawn_run(task_id, "Resume", async move {
            orchestrator.run_dev_qa_loop(&id).await
        });
        Ok((reset, handle))
    }

    /// Stop the running agent and park the task. The phase is kept; a later
    /// `resume` picks up where it stopped. Returns whether an agent was stopped.
    pub async fn pause(&self, task_id: &str) -> Result<bool> {
        let handle = self
            .store
            .try_update(task_id, |task| {
                let handle = task.assigned_agent.handle().cloned();
                task.assigned_agent = AgentAssignment::Idle;
                if task.status == TaskStatus::InProgress {
                    task.status = TaskStatus::Pending;
                }
                task.reset_in_progress_subtasks();
                if matches!(
                    task.planning_status,
                    Some(PlanningStatus::GeneratingPlan | PlanningStatus::GeneratingSubtasks)
                ) {
                    task.planning_status =
                        task.plan_content.as_ref().map(|_| PlanningStatus::PlanReady);
                }
                Ok(handle)
            })
            .await?;

        self.dev_log(task_id).line("\n[Pause] Task paused by user").await;
        Ok(self.stop_agent(handle).await)
    }

    async fn stop_agent(&self, handle: Option<AgentHandle>) -> bool {
        match handle {
            Some(handle) => self.agents.stop_agent(&handle).await,
            None => false,
        }
    }

    /// Mark a pending or running subtask completed without running it.
    pub async fn skip_subtask(&self, task_id: &str, subtask_id: &str) -> Result<Task> {
        let (task, running) = self
            .store
            .try_update(task_id, |task| {
                let Some(subtask) = task.subtask_mut(subtask_id) else {
                    return Err(Error::SubtaskNotFound {
                        task_id: task_id.to_string(),
                        subtask_id: subtask_id.to_string(),
                    });
                };
                if subtask.is_completed() {
                    return Err(Error::InvalidState(format!(
                        "Subtask {} is already completed",
                        subtask_id
                    )));
                }
                let was_running = subtask.status == SubtaskStatus::InProgress;
                subtask.mark_completed();

                if task.phase == TaskPhase::InProgress && task.all_dev_completed() {
                    task.set_phase(TaskPhase::AiReview)?;
                }
                let running = if was_running {
                    task.assigned_agent.handle().cloned()
                } else {
                    None
                };
                Ok((task.clone(), running))
            })
            .await?;

        self.dev_log(task_id)
            .line(format!("[Skip] Subtask {} skipped by user", subtask_id))
            .await;
        self.stop_agent(running).await;
        Ok(task)
    }

    /// Remove a subtask. A loop waiting on it moves on to the next one.
    pub async fn delete_subtask(&self, task_id: &str, subtask_id: &str) -> Result<Task> {
        let (task, running) = self
            .store
            .try_update(task_id, |task| {
                let Some(index) = task.subtasks.iter().position(|s| s.id == subtask_id) else {
                    return Err(Error::SubtaskNotFound {
                        task_id: task_id.to_string(),
                        subtask_id: subtask_id.to_string(),
                    });
                };
                let removed = task.subtasks.remove(index);
                let running = if removed.status == SubtaskStatus::InProgress {
                    task.assigned_agent.handle().cloned()
                } else {
                    None
                };
                Ok((task.clone(), running))
            })
            .await?;

        self.dev_log(task_id)
            .line(format!("[Delete] Subtask {} deleted by user", subtask_id))
            .await;
        self.stop_agent(running).await;
        Ok(task)
    }

    /// Delete a task and its logs, stopping its agent if one is running.
    pub async fn delete_task(&self, task_id: &str) -> Result<()> {
        let task = self.require_task(task_id).await?;
        self.stop_agent(task.assigned_agent.handle().cloned()).await;

        if !self.store.delete(task_id).await? {
            return Err(Error::TaskNotFound(task_id.to_string()));
        }
        let task_dir = self.store.task_dir(task_id);
        if let Err(e) = tokio::fs::remove_dir_all(&task_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove {}: {}", task_dir.display(), e);
            }
        }
        tracing::info!("Deleted task {}", task_id);
        Ok(())
    }
}
