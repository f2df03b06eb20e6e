//! Task record and its lifecycle enums.
//!
//! Invariants enforced here:
//! - Phase changes go through [`Task::set_phase`], which rejects backward moves
//!   other than replanning and the rework step back from `ai_review`.
//! - The assigned agent is an explicit tagged state rather than an overloaded
//!   string, so the transient `Starting`/`Resuming` markers cannot be mistaken
//!   for a real invocation handle.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::subtask::{Subtask, SubtaskStatus};
use crate::error::{Error, Result};

/// Workflow column a task sits in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    #[default]
    Planning,
    InProgress,
    AiReview,
    HumanReview,
    Done,
}

impl TaskPhase {
    /// All phases in workflow order.
    pub const ALL: [TaskPhase; 5] = [
        TaskPhase::Planning,
        TaskPhase::InProgress,
        TaskPhase::AiReview,
        TaskPhase::HumanReview,
        TaskPhase::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::InProgress => "in_progress",
            Self::AiReview => "ai_review",
            Self::HumanReview => "human_review",
            Self::Done => "done",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Planning => 0,
            Self::InProgress => 1,
            Self::AiReview => 2,
            Self::HumanReview => 3,
            Self::Done => 4,
        }
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Forward moves are always fine. Going back is limited to replanning
    /// (anything except `done` may return to `planning`) and the rework step
    /// from `ai_review` back to `in_progress`.
    pub fn can_transition_to(&self, next: TaskPhase) -> bool {
        if *self == next || next.rank() > self.rank() {
            return true;
        }
        match (self, next) {
            (Self::Done, Self::Planning) => false,
            (_, Self::Planning) => true,
            (Self::AiReview, Self::InProgress) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    /// Needs an explicit resume from a human
    Blocked,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Sub-state of the `planning` phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningStatus {
    GeneratingPlan,
    PlanReady,
    GeneratingSubtasks,
}

/// Opaque handle of a running agent invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentHandle(String);

impl AgentHandle {
    /// Create a fresh handle.
    pub fn generate() -> Self {
        Self(format!("thread-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for AgentHandle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for AgentHandle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who (if anyone) is currently driving the task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "handle", rename_all = "snake_case")]
pub enum AgentAssignment {
    #[default]
    Idle,
    /// Placeholder while `start_development` spins up
    Starting,
    /// Placeholder while `resume` spins up
    Resuming,
    Running(AgentHandle),
}

impl AgentAssignment {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// True for the transient startup markers.
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Starting | Self::Resuming)
    }

    pub fn handle(&self) -> Option<&AgentHandle> {
        match self {
            Self::Running(handle) => Some(handle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaOutcome {
    Pass,
    Fail,
}

impl fmt::Display for QaOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => f.write_str("pass"),
            Self::Fail => f.write_str("fail"),
        }
    }
}

/// Outcome of the most recent automated-check run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaResult {
    pub overall: QaOutcome,
    pub summary: String,
    pub details: String,
}

/// A unit of work moving through planning, development and review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub phase: TaskPhase,
    #[serde(default)]
    pub status: TaskStatus,
    /// Ordered: execution order and display order
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    #[serde(default)]
    pub assigned_agent: AgentAssignment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planning_status: Option<PlanningStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_content: Option<String>,
    #[serde(default)]
    pub plan_approved: bool,
    #[serde(default)]
    pub rework_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa_failure_feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_qa_result: Option<QaResult>,
    /// Agent working directory; falls back to the project directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("task-{}", Uuid::new_v4().simple()),
            title: title.into(),
            description: description.into(),
            phase: TaskPhase::Planning,
            status: TaskStatus::Pending,
            subtasks: Vec::new(),
            assigned_agent: AgentAssignment::Idle,
            planning_status: None,
            plan_content: None,
            plan_approved: false,
            rework_count: 0,
            qa_failure_feedback: None,
            last_qa_result: None,
            worktree_path: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting transitions the workflow forbids.
    pub fn set_phase(&mut self, next: TaskPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn working_dir(&self, project_dir: &Path) -> PathBuf {
        self.worktree_path
            .clone()
            .unwrap_or_else(|| project_dir.to_path_buf())
    }

    pub fn subtask(&self, id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.id == id)
    }

    pub fn subtask_mut(&mut self, id: &str) -> Option<&mut Subtask> {
        self.subtasks.iter_mut().find(|s| s.id == id)
    }

    pub fn all_dev_completed(&self) -> bool {
        self.subtasks
            .iter()
            .filter(|s| s.is_dev())
            .all(|s| s.is_completed())
    }

    /// Put interrupted subtasks back in the queue. Returns how many were reset.
    pub fn reset_in_progress_subtasks(&mut self) -> usize {
        let mut reset = 0;
        for subtask in &mut self.subtasks {
            if subtask.status == SubtaskStatus::InProgress {
                subtask.status = SubtaskStatus::Pending;
                reset += 1;
            }
        }
        reset
    }

    pub fn in_progress_count(&self) -> usize {
        self.subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::InProgress)
            .count()
    }

    /// Bullet list of completed dev work, used to ground QA prompts.
    pub fn completed_dev_summary(&self) -> String {
        self.subtasks
            .iter()
            .filter(|s| s.is_dev() && s.is_completed())
            .map(|s| format!("- {}: {}", s.label, s.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
