//! Plan and subtask generation with fix-agent retries.
//!
//! Each attempt runs an agent and parses its output. A parse or validation
//! failure starts a fix agent that is shown its previous output and the exact
//! error, up to [`MAX_PARSE_RETRIES`] times. After that the task is blocked.

use std::path::Path;

use serde_json::Value;

use super::extract::{parse_plan, parse_subtasks};
use super::prompts::{plan_fix_prompt, subtask_fix_prompt, ProjectPrompts};
use super::Orchestrator;
use crate::agent::{AgentCompletion, AgentRequest};
use crate::error::Error;
use crate::task::{
    AgentAssignment, PlanningStatus, Subtask, SubtaskType, TaskLog, TaskPhase, TaskStatus,
};
use crate::worktree::clean_planning_artifacts;

/// Fix-agent attempts after the first generation attempt.
pub const MAX_PARSE_RETRIES: u32 = 2;

/// Auto-generated QA subtasks per dev subtask when the agent produced none.
const AUTO_QA_RATIO: f64 = 0.6;

/// Files a planning agent may have written its plan to instead of answering.
const PLAN_ARTIFACT_FILES: [&str; 2] = ["implementation-plan.json", "implementation_plan.json"];

/// Look for a plan the agent wrote to disk.
fn read_plan_artifact(working_dir: &Path) -> Option<(String, &'static str)> {
    PLAN_ARTIFACT_FILES.iter().find_map(|name| {
        let contents = std::fs::read_to_string(working_dir.join(name)).ok()?;
        let value: Value = serde_json::from_str(&contents).ok()?;
        let plan = value.get("plan")?.as_str()?.trim();
        (!plan.is_empty()).then(|| (plan.to_string(), *name))
    })
}

/// Dev subtasks first, then QA. Without QA subtasks, add
/// `floor(0.6 * dev_count)` generic verification steps.
pub fn arrange_subtasks(subtasks: Vec<Subtask>) -> Vec<Subtask> {
    let (dev, mut qa): (Vec<_>, Vec<_>) = subtasks.into_iter().partition(Subtask::is_dev);

    if qa.is_empty() {
        let count = (dev.len() as f64 * AUTO_QA_RATIO).floor() as usize;
        qa = (1..=count)
            .map(|n| {
                let mut subtask = Subtask::new(
                    format!("subtask-qa-{}", n),
                    SubtaskType::Qa,
                    format!("Verify Step {}", n),
                    format!(
                        "[AUTO] Verify implementation step {} - Validate the corresponding development work",
                        n
                    ),
                );
                subtask.active_form = format!("Verifying Step {}", n);
                subtask
            })
            .collect();
    }

    dev.into_iter().chain(qa).collect()
}

/// What a generation attempt produced.
enum Generated<T> {
    Ready(T),
    /// Blocked, paused or deleted; nothing more to do
    Stopped,
}

impl Orchestrator {
    /// Run one generation agent and wait for its completion.
    async fn run_generation_agent(
        &self,
        task_id: &str,
        prompt: String,
        working_dir: &Path,
        log: &TaskLog,
        what: &str,
    ) -> crate::Result<Option<AgentCompletion>> {
        match self.store.load(task_id).await? {
            Some(task) if !task.assigned_agent.is_idle() => {}
            _ => {
                log.line("[Orchestrator] Task was paused or deleted - stopping generation")
                    .await;
                return Ok(None);
            }
        }

        let request = AgentRequest {
            task_id: task_id.to_string(),
            prompt,
            working_dir: working_dir.to_path_buf(),
        };
        let run = match self.agents.start_agent(request).await {
            Ok(run) => run,
            Err(e) => {
                let error = format!("Failed to start agent: {:#}", e);
                return Ok(Some(AgentCompletion::failure(error)));
            }
        };
        log.line(format!("[Agent Started] Thread ID: {}", run.handle)).await;

        let handle = run.handle.clone();
        let assigned = self
            .store
            .update(task_id, |task| {
                // A pause while the agent was starting has cleared the marker
                if task.assigned_agent.is_idle() {
                    return false;
                }
                task.assigned_agent = AgentAssignment::Running(handle);
                true
            })
            .await?;
        if assigned != Some(true) {
            log.line("[Orchestrator] Task was paused or deleted - stopping generation")
                .await;
            self.agents.stop_agent(&run.handle).await;
            return Ok(None);
        }

        let handle = run.handle.clone();
        let finished = tokio::time::timeout(self.config.subtask_wait, run.finished());
        let completion = match finished.await {
            Ok(completion) => completion,
            Err(_) => {
                self.agents.stop_agent(&handle).await;
                AgentCompletion::failure(format!(
                    "{} agent did not finish within {}s",
                    what,
                    self.config.subtask_wait.as_secs()
                ))
            }
        };
        log.line(format!("\n[{} Completed] Success: {}", what, completion.success))
            .await;
        Ok(Some(completion))
    }

    /// Block after a failed generation, unless the task was paused meanwhile.
    async fn stop_generation(
        &self,
        task_id: &str,
        log: &TaskLog,
        reason: &str,
    ) -> crate::Result<()> {
        log.error(reason).await;
        let paused = self
            .store
            .update(task_id, |task| {
                if task.assigned_agent.is_idle() {
                    return true;
                }
                task.status = TaskStatus::Blocked;
                task.assigned_agent = AgentAssignment::Idle;
                false
            })
            .await?;
        if paused == Some(true) {
            log.line("[Orchestrator] Task was paused - not blocking").await;
        }
        Ok(())
    }

    /// The bounded retry loop shared by plan and subtask generation.
    #[allow(clippy::too_many_arguments)]
    async fn generate_with_retries<T>(
        &self,
        task_id: &str,
        log: &TaskLog,
        what: &str,
        first_prompt: String,
        parse: impl Fn(&str) -> Result<T, String>,
        fix_prompt: impl Fn(&str, &str) -> String,
        fallback: impl Fn(&Path) -> Option<T>,
    ) -> crate::Result<Generated<T>> {
        let task = self
            .store
            .load(task_id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        let working_dir = task.working_dir(self.store.project_dir());

        let mut prompt = first_prompt;
        let mut attempt = 0;
        loop {
            let label = if attempt == 0 {
                what.to_string()
            } else {
                format!("Fix Agent ({})", what)
            };
            let Some(completion) = self
                .run_generation_agent(task_id, prompt, &working_dir, log, &label)
                .await?
            else {
                return Ok(Generated::Stopped);
            };

            if !completion.success {
                let error = completion.error.unwrap_or_else(|| {
                    "Agent reported failure without an error message".to_string()
                });
                self.stop_generation(task_id, log, &error).await?;
                return Ok(Generated::Stopped);
            }
            log.output(&completion.output).await;

            let error = match parse(&completion.output) {
                Ok(value) => {
                    log.line("[Parsed JSON successfully]").await;
                    return Ok(Generated::Ready(value));
                }
                Err(error) => error,
            };
            log.line(format!("[Parse Error] {}", error)).await;

            if let Some(value) = fallback(&working_dir) {
                log.line("[Fallback] Found output written to the working tree, using it")
                    .await;
                return Ok(Generated::Ready(value));
            }

            if attempt >= MAX_PARSE_RETRIES {
                self.stop_generation(
                    task_id,
                    log,
                    &format!("[Max Parse Retries Reached] {} failed, task blocked", what),
                )
                .await?;
                return Ok(Generated::Stopped);
            }

            attempt += 1;
            log.line(format!(
                "\n[Parse Retry] Attempt {}/{} - Starting fix agent...",
                attempt, MAX_PARSE_RETRIES
            ))
            .await;
            prompt = fix_prompt(&error, &completion.output);
        }
    }

    /// Generate the implementation plan. Leaves the task in `planning` with
    /// `planningStatus = plan_ready` on success, blocked otherwise.
    pub(crate) async fn run_plan_generation(&self, task_id: &str) -> crate::Result<()> {
        let task = self
            .store
            .load(task_id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        let log = self.dev_log(task_id);
        log.start("Plan generation started", &task.title).await;
        log.line("[Starting Plan Generation]").await;

        let prompts = ProjectPrompts::load(self.store.project_dir()).await;
        let generated = self
            .generate_with_retries(
                task_id,
                &log,
                "Plan Generation",
                prompts.plan_generation_prompt(&task),
                parse_plan,
                plan_fix_prompt,
                |dir| {
                    let (plan, file) = read_plan_artifact(dir)?;
                    tracing::info!(task_id = %task_id, "Using plan found in {}", file);
                    Some(plan)
                },
            )
            .await?;

        let Generated::Ready(plan) = generated else {
            return Ok(());
        };

        self.store
            .update(task_id, |task| {
                task.plan_content = Some(plan);
                task.planning_status = Some(PlanningStatus::PlanReady);
                task.status = TaskStatus::Pending;
                task.assigned_agent = AgentAssignment::Idle;
            })
            .await?;
        let project_dir = self.store.project_dir();
        clean_planning_artifacts(&task.working_dir(project_dir), project_dir).await;
        log.line("[Plan Generated] Task updated").await;
        Ok(())
    }

    /// Generate subtasks from the approved plan and move the task to
    /// `in_progress`. Returns false when generation stopped without subtasks.
    pub(crate) async fn run_subtask_generation(&self, task_id: &str) -> crate::Result<bool> {
        let task = self
            .store
            .load(task_id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        let log = self.dev_log(task_id);
        log.start("Development started", &task.title).await;
        log.line("[Starting Subtask Generation Agent]").await;

        let prompts = ProjectPrompts::load(self.store.project_dir()).await;
        let generated = self
            .generate_with_retries(
                task_id,
                &log,
                "Subtask Generation",
                prompts.subtask_generation_prompt(&task),
                parse_subtasks,
                subtask_fix_prompt,
                |_| None,
            )
            .await?;

        let Generated::Ready(subtasks) = generated else {
            return Ok(false);
        };

        let subtasks = arrange_subtasks(subtasks);
        let dev_count = subtasks.iter().filter(|s| s.is_dev()).count();
        let qa_count = subtasks.len() - dev_count;

        let saved = self
            .store
            .try_update(task_id, |task| {
                task.set_phase(TaskPhase::InProgress)?;
                task.subtasks = subtasks;
                task.planning_status = None;
                task.status = TaskStatus::InProgress;
                Ok(())
            })
            .await;
        if let Err(e) = saved {
            log.error(format!("Failed to save subtasks: {}", e)).await;
            return Err(e);
        }

        log.line(format!(
            "[Validated {} subtasks] {} dev, {} qa",
            dev_count + qa_count,
            dev_count,
            qa_count
        ))
        .await;
        let project_dir = self.store.project_dir();
        clean_planning_artifacts(&task.working_dir(project_dir), project_dir).await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn dev(id: &str) -> Subtask {
        Subtask::new(id, SubtaskType::Dev, id, "work")
    }

    #[test]
    fn test_auto_qa_when_agent_gave_none() {
        let arranged = arrange_subtasks((1..=5).map(|n| dev(&format!("subtask-{}", n))).collect());
        let qa: Vec<_> = arranged.iter().filter(|s| s.is_qa()).collect();
        assert_eq!(qa.len(), 3);
        assert_eq!(qa[0].id, "subtask-qa-1");
        assert_eq!(qa[2].label, "Verify Step 3");
        assert!(qa[1].content.starts_with("[AUTO] Verify implementation step 2"));

        assert!(arrange_subtasks(vec![dev("only")]).iter().all(|s| s.is_dev()));
    }

    #[test]
    fn test_dev_before_qa_keeps_relative_order() {
        let qa = Subtask::new("subtask-qa-1", SubtaskType::Qa, "Verify", "check");
        let arranged = arrange_subtasks(vec![dev("a"), qa, dev("b")]);
        let ids: Vec<_> = arranged.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "subtask-qa-1"]);
    }

    #[test]
    fn test_plan_artifact_fallback() {
        let temp = tempdir().unwrap();
        assert!(read_plan_artifact(temp.path()).is_none());

        std::fs::write(temp.path().join("implementation-plan.json"), "{broken").unwrap();
        std::fs::write(
            temp.path().join("implementation_plan.json"),
            r##"{"plan": "# From disk"}"##,
        )
        .unwrap();
        assert_eq!(
            read_plan_artifact(temp.path()),
            Some(("# From disk".to_string(), "implementation_plan.json"))
        );
    }
}
