//! The dev → QA → automated checks → rework loop.
//!
//! ```text
//! RunDev → RunQA → RunChecks ─┬─ pass ──────────────→ human_review
//!    ↑                        ├─ fail, cap reached ─→ human_review
//!    └──── rework subtask ────┘─ fail
//! ```
//!
//! Each iteration either terminates or strictly increases `reworkCount`, and
//! the count is capped at [`MAX_REWORK`], so the loop always ends.

use super::executor::WaitOutcome;
use super::Orchestrator;
use crate::checks::generate_rework_feedback;
use crate::error::Error;
use crate::task::{
    AgentAssignment, Subtask, SubtaskStatus, SubtaskType, Task, TaskLog, TaskPhase, TaskStatus,
};
use crate::worktree::clean_planning_artifacts;

/// Rework iterations before a failing task is handed to a human anyway.
pub const MAX_REWORK: u32 = 2;

enum ChecksVerdict {
    /// Task moved to human review
    Finished,
    /// A rework subtask was appended; go around again
    Rework,
}

/// Rework subtask id that does not clash with anything already on the task.
fn rework_subtask(task: &Task, rework_count: u32, summary: &str) -> Subtask {
    let mut subtask = Subtask::rework(rework_count, MAX_REWORK, summary);
    let base = subtask.id.clone();
    let mut n = 2;
    while task.subtask(&subtask.id).is_some() {
        subtask.id = format!("{}-{}", base, n);
        n += 1;
    }
    subtask
}

impl Orchestrator {
    /// Drive a task from its pending dev subtasks to human review.
    ///
    /// Returns early, leaving state as the executor set it, when a subtask
    /// fails, the task is paused or deleted, or a wait times out.
    pub(crate) async fn run_dev_qa_loop(&self, task_id: &str) -> crate::Result<()> {
        let dev_log = self.dev_log(task_id);
        let review_log = self.review_log(task_id);

        // The startup placeholder must not outlive startup.
        self.store
            .update(task_id, |task| {
                if task.assigned_agent.is_placeholder() {
                    task.assigned_agent = AgentAssignment::Idle;
                }
            })
            .await?
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;

        loop {
            let rework_count = self
                .store
                .load(task_id)
                .await?
                .map(|t| t.rework_count)
                .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
            dev_log
                .line(format!(
                    "\n[Orchestrator] Starting dev+QA loop (rework count: {}/{})",
                    rework_count, MAX_REWORK
                ))
                .await;

            if !self.run_subtasks(task_id, SubtaskType::Dev, &dev_log).await? {
                return Ok(());
            }
            dev_log.line("\n[Orchestrator] Dev subtasks completed").await;

            self.enter_review(task_id, &dev_log, &review_log).await?;
            if !self.run_subtasks(task_id, SubtaskType::Qa, &review_log).await? {
                return Ok(());
            }

            match self.run_checks(task_id, &review_log).await? {
                ChecksVerdict::Finished => return Ok(()),
                ChecksVerdict::Rework => continue,
            }
        }
    }

    /// Execute pending subtasks of one kind in array order, one at a time.
    /// Returns false if the loop has to stop.
    async fn run_subtasks(
        &self,
        task_id: &str,
        kind: SubtaskType,
        log: &TaskLog,
    ) -> crate::Result<bool> {
        let Some(task) = self.store.load(task_id).await? else {
            return Ok(false);
        };
        let queue: Vec<(String, String)> = task
            .subtasks
            .iter()
            .filter(|s| s.kind == kind && s.status == SubtaskStatus::Pending)
            .map(|s| (s.id.clone(), s.label.clone()))
            .collect();

        let heading = match kind {
            SubtaskType::Dev => "Dev Subtask",
            SubtaskType::Qa => "QA Subtask",
        };
        if queue.is_empty() {
            let heading = heading.to_lowercase();
            log.line(format!("[Orchestrator] No pending {} to execute", heading))
                .await;
            return Ok(true);
        }
        log.line(format!(
            "[Orchestrator] Executing {} pending {}(s)",
            queue.len(),
            heading.to_lowercase()
        ))
        .await;

        let total = queue.len();
        for (i, (subtask_id, label)) in queue.into_iter().enumerate() {
            let position = format!("[{} {}/{}] {}", heading, i + 1, total, label);

            let outcome = self.execute_subtask(task_id, &subtask_id, log).await?;
            if !outcome.should_continue() {
                log.line(format!("[Orchestrator] Stopping loop at {}: {}", position, outcome))
                    .await;
                return Ok(false);
            }
            let line = match outcome {
                WaitOutcome::Deleted => format!("\n{} - SKIPPED (deleted)", position),
                WaitOutcome::AlreadyCompleted => {
                    format!("\n{} - SKIPPED (already completed)", position)
                }
                _ => format!("{} - done", position),
            };
            log.line(line).await;
        }
        Ok(true)
    }

    /// Move to `ai_review`. On a rework pass QA subtasks are reset so they
    /// verify again.
    async fn enter_review(
        &self,
        task_id: &str,
        dev_log: &TaskLog,
        review_log: &TaskLog,
    ) -> crate::Result<()> {
        let task = self
            .store
            .try_update(task_id, |task| {
                task.set_phase(TaskPhase::AiReview)?;
                task.status = TaskStatus::InProgress;
                if task.rework_count > 0 {
                    for subtask in task.subtasks.iter_mut().filter(|s| s.is_qa()) {
                        subtask.status = SubtaskStatus::Pending;
                        subtask.completed_at = None;
                    }
                }
                Ok(task.clone())
            })
            .await?;

        dev_log.banner("[Orchestrator] Moving to AI Review phase").await;
        let project_dir = self.store.project_dir();
        clean_planning_artifacts(&task.working_dir(project_dir), project_dir).await;

        if review_log.exists() {
            review_log
                .banner(format!(
                    "[Rework {}] Re-running QA after fixes",
                    task.rework_count
                ))
                .await;
        } else {
            review_log.start("AI Review started", &task.title).await;
        }

        let qa_count = task.subtasks.iter().filter(|s| s.is_qa()).count();
        review_log
            .line(format!(
                "[Starting QA Verification] {} QA subtask(s) to verify",
                qa_count
            ))
            .await;
        Ok(())
    }

    /// Run automated checks and decide between human review and rework.
    async fn run_checks(&self, task_id: &str, log: &TaskLog) -> crate::Result<ChecksVerdict> {
        let task = self
            .store
            .load(task_id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        let working_dir = task.working_dir(self.store.project_dir());

        log.banner("[Automated Checks] Running typecheck, build and lint")
            .await;
        let result = self.checks.run(&working_dir).await;
        log.line(format!(
            "[Automated Checks] {}: {}",
            result.overall.to_string().to_uppercase(),
            result.summary
        ))
        .await;
        log.line(&result.details).await;

        let qa_result = result.to_qa_result();

        if result.passed() {
            clean_planning_artifacts(&working_dir, self.store.project_dir()).await;
            self.store
                .try_update(task_id, |task| {
                    task.set_phase(TaskPhase::HumanReview)?;
                    task.status = TaskStatus::Completed;
                    task.assigned_agent = AgentAssignment::Idle;
                    task.qa_failure_feedback = None;
                    task.last_qa_result = Some(qa_result);
                    Ok(())
                })
                .await?;
            log.banner("[QA PASSED - Moving to Human Review]").await;
            return Ok(ChecksVerdict::Finished);
        }

        let feedback = generate_rework_feedback(&result);

        if task.rework_count >= MAX_REWORK {
            // Failure is preserved in lastQAResult for the reviewer.
            log.error(format!(
                "Automated checks still failing after {} rework(s), escalating to human review",
                task.rework_count
            ))
            .await;
            clean_planning_artifacts(&working_dir, self.store.project_dir()).await;
            self.store
                .try_update(task_id, |task| {
                    task.set_phase(TaskPhase::HumanReview)?;
                    task.status = TaskStatus::Completed;
                    task.assigned_agent = AgentAssignment::Idle;
                    task.qa_failure_feedback = Some(feedback);
                    task.last_qa_result = Some(qa_result);
                    Ok(())
                })
                .await?;
            log.banner("[REWORK CAP REACHED - Moving to Human Review]")
                .await;
            return Ok(ChecksVerdict::Finished);
        }

        log.error(format!("Automated checks failed: {}", result.summary))
            .await;
        let summary = result.summary.clone();
        let rework_count = self
            .store
            .try_update(task_id, |task| {
                task.set_phase(TaskPhase::InProgress)?;
                task.rework_count += 1;
                let subtask = rework_subtask(task, task.rework_count, &summary);
                task.subtasks.push(subtask);
                task.status = TaskStatus::InProgress;
                task.qa_failure_feedback = Some(feedback);
                task.last_qa_result = Some(qa_result);
                Ok(task.rework_count)
            })
            .await?;
        log.line(format!(
            "[Rework {}/{}] Appended rework subtask, returning to development",
            rework_count, MAX_REWORK
        ))
        .await;
        Ok(ChecksVerdict::Rework)
    }
}
