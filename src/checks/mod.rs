//! Automated checks run against a task's working tree after QA.
//!
//! Which commands run is the runner's business; what the orchestrator relies
//! on is the pass/fail contract in [`QaCheckResult`] and the rework feedback
//! built from it.

mod script;

pub use script::ScriptChecks;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::task::{QaOutcome, QaResult};

/// Result of a single check command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutput {
    pub passed: bool,
    pub output: String,
}

/// Per-kind results; a check that was not applicable is `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typecheck: Option<CheckOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<CheckOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lint: Option<CheckOutput>,
}

/// Aggregate result: `overall` fails if any attempted check failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaCheckResult {
    pub overall: QaOutcome,
    pub summary: String,
    pub details: String,
    pub checks: CheckSet,
}

impl QaCheckResult {
    pub fn passed(&self) -> bool {
        self.overall == QaOutcome::Pass
    }

    /// The part persisted on the task as `lastQAResult`.
    pub fn to_qa_result(&self) -> QaResult {
        QaResult {
            overall: self.overall,
            summary: self.summary.clone(),
            details: self.details.clone(),
        }
    }
}

/// Runs verification in a working directory.
#[async_trait]
pub trait ChecksRunner: Send + Sync {
    async fn run(&self, working_dir: &Path) -> QaCheckResult;
}

pub type ChecksRef = Arc<dyn ChecksRunner>;

/// Turn a failed check result into the prompt context for a rework pass.
/// Each failing check's output is quoted verbatim under its own heading.
pub fn generate_rework_feedback(result: &QaCheckResult) -> String {
    let mut lines = vec![
        "Previous QA phase failed automated checks. Please address the following issues:"
            .to_string(),
        String::new(),
    ];

    let sections = [
        ("Typecheck Errors", &result.checks.typecheck),
        ("Build Errors", &result.checks.build),
        ("Lint Errors", &result.checks.lint),
    ];
    for (heading, check) in sections {
        if let Some(check) = check.as_ref().filter(|c| !c.passed) {
            lines.push(format!("## {}", heading));
            lines.push("```".to_string());
            lines.push(check.output.clone());
            lines.push("```".to_string());
            lines.push(String::new());
        }
    }

    lines.push(
        "Please fix these issues. The task will be re-verified after your fixes.".to_string(),
    );
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feedback_quotes_only_failing_checks() {
        let result = QaCheckResult {
            overall: QaOutcome::Fail,
            summary: "✓ typecheck passed, ✗ lint failed".to_string(),
            details: String::new(),
            checks: CheckSet {
                typecheck: Some(CheckOutput {
                    passed: true,
                    output: "fine".to_string(),
                }),
                build: None,
                lint: Some(CheckOutput {
                    passed: false,
                    output: "src/a.ts:1:1 no-unused-vars".to_string(),
                }),
            },
        };

        let feedback = generate_rework_feedback(&result);
        assert!(feedback.starts_with("Previous QA phase failed automated checks."));
        assert!(feedback.contains("## Lint Errors\n```\nsrc/a.ts:1:1 no-unused-vars\n```"));
        assert!(!feedback.contains("## Typecheck Errors"));
        assert!(!feedback.contains("## Build Errors"));
        assert!(feedback.ends_with("The task will be re-verified after your fixes."));
    }
}
