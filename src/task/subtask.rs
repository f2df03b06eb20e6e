//! Subtasks: the unit of work handed to a single agent invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which phase of the loop executes a subtask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskType {
    /// Implementation work, executed while the task is `in_progress`
    #[default]
    Dev,
    /// Verification work, executed while the task is in `ai_review`
    Qa,
}

impl SubtaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Qa => "qa",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

/// A single step of a task.
///
/// Subtask ids are unique within their task for the task's whole lifetime;
/// rework subtasks are appended with fresh ids rather than reusing old ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: SubtaskType,
    /// Short label for display
    pub label: String,
    /// Detailed instruction for the agent
    pub content: String,
    /// Progress-display string ("Adding validation logic")
    pub active_form: String,
    #[serde(default)]
    pub status: SubtaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Subtask {
    pub fn new(
        id: impl Into<String>,
        kind: SubtaskType,
        label: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let label = label.into();
        Self {
            id: id.into(),
            kind,
            active_form: format!("Working on {}", label),
            label,
            content: content.into(),
            status: SubtaskStatus::Pending,
            completed_at: None,
        }
    }

    /// Build the dev subtask appended after a failed round of automated checks.
    pub fn rework(rework_count: u32, max_rework: u32, check_summary: &str) -> Self {
        let mut subtask = Self::new(
            format!("subtask-rework-{}", rework_count),
            SubtaskType::Dev,
            format!("Rework ({}/{})", rework_count, max_rework),
            format!(
                "Fix issues identified in QA automated checks (rework {}/{}):\n\n{}",
                rework_count, max_rework, check_summary
            ),
        );
        subtask.active_form = format!("Fixing QA issues ({}/{})", rework_count, max_rework);
        subtask
    }

    pub fn is_dev(&self) -> bool {
        self.kind == SubtaskType::Dev
    }

    pub fn is_qa(&self) -> bool {
        self.kind == SubtaskType::Qa
    }

    pub fn is_completed(&self) -> bool {
        self.status == SubtaskStatus::Completed
    }

    /// QA subtasks mentioning "manual" need a human checklist instead of code changes.
    pub fn is_manual_qa(&self) -> bool {
        format!("{} {}", self.label, self.content)
            .to_lowercase()
            .contains("manual")
    }

    pub fn mark_completed(&mut self) {
        self.status = SubtaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rework_subtask_shape() {
        let subtask = Subtask::rework(1, 2, "✗ lint failed");
        assert_eq!(subtask.id, "subtask-rework-1");
        assert_eq!(subtask.kind, SubtaskType::Dev);
        assert_eq!(subtask.label, "Rework (1/2)");
        assert!(subtask.content.ends_with("✗ lint failed"));
        assert_eq!(subtask.status, SubtaskStatus::Pending);
    }

    #[test]
    fn test_manual_detection_is_case_insensitive() {
        let manual = Subtask::new("qa-1", SubtaskType::Qa, "Manual UI check", "click around");
        let auto = Subtask::new("qa-2", SubtaskType::Qa, "Run tests", "cargo test");
        assert!(manual.is_manual_qa());
        assert!(!auto.is_manual_qa());
    }

    #[test]
    fn test_missing_type_defaults_to_dev() {
        let subtask: Subtask = serde_json::from_str(
            r#"{"id":"s1","label":"Add route","content":"...","activeForm":"Adding route"}"#,
        )
        .unwrap();
        assert_eq!(subtask.kind, SubtaskType::Dev);
        assert_eq!(subtask.status, SubtaskStatus::Pending);
    }
}
