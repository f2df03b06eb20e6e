//! Turning free-form agent output into structured documents.
//!
//! Agents are asked for raw JSON but routinely wrap it in prose or code
//! fences. [`extract_json`] finds the first balanced JSON object that actually
//! parses; [`validate_subtasks`] checks the subtask document shape and
//! [`generate_feedback`] renders the problems so they can be fed back to a fix
//! agent verbatim.

use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::task::{Subtask, SubtaskType};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("No JSON found in output")]
    NoJson,

    #[error("Invalid JSON: {0}")]
    Parse(String),
}

/// Byte offset one past the `}` closing the object that opens at `start`,
/// skipping braces inside string literals.
fn balanced_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Locate and parse the first balanced JSON object in `raw`.
///
/// Candidates that do not parse (a `{placeholder}` in prose, say) are skipped.
/// When no candidate parses, the error of the first one is reported.
pub fn extract_json(raw: &str) -> Result<Value, ExtractError> {
    let mut first_error = None;

    for (start, _) in raw.match_indices('{') {
        let Some(end) = balanced_end(raw, start) else {
            if first_error.is_none() {
                first_error = Some(ExtractError::Parse(
                    "unbalanced braces, output looks truncated".to_string(),
                ));
            }
            continue;
        };

        match serde_json::from_str::<Value>(&raw[start..end]) {
            Ok(value @ Value::Object(_)) => return Ok(value),
            Ok(_) => {}
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(ExtractError::Parse(e.to_string()));
                }
            }
        }
    }

    Err(first_error.unwrap_or(ExtractError::NoJson))
}

/// Pull the plan markdown out of a plan-generation response.
pub fn parse_plan(raw: &str) -> Result<String, String> {
    let document = extract_json(raw).map_err(|e| e.to_string())?;
    match document.get("plan").and_then(Value::as_str) {
        Some(plan) if !plan.trim().is_empty() => Ok(plan.to_string()),
        _ => Err("Parsed JSON has no \"plan\" field".to_string()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subtask validation
// ─────────────────────────────────────────────────────────────────────────────

const REQUIRED_FIELDS: [&str; 3] = ["id", "content", "label"];

/// One problem with a subtask document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    MissingSubtasksArray,
    EmptySubtasks,
    /// Entry at `index` lacks non-empty values for `fields`
    MissingFields {
        index: usize,
        id: Option<String>,
        fields: Vec<&'static str>,
    },
    DuplicateId(String),
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSubtasksArray => {
                f.write_str("missing \"subtasks\" array at the top level of the JSON object")
            }
            Self::EmptySubtasks => f.write_str("\"subtasks\" array is empty"),
            Self::MissingFields { index, id, fields } => {
                write!(f, "subtasks[{}]", index)?;
                if let Some(id) = id {
                    write!(f, " (id \"{}\")", id)?;
                }
                write!(f, " is missing required field(s): {}", fields.join(", "))
            }
            Self::DuplicateId(id) => write!(f, "duplicate subtask id \"{}\"", id),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

fn non_empty_str<'a>(entry: &'a Value, field: &str) -> Option<&'a str> {
    entry
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Check a subtask document: a non-empty `subtasks` array whose entries all
/// carry non-empty `id`, `content` and `label`, with unique ids.
pub fn validate_subtasks(document: &Value) -> ValidationResult {
    let mut result = ValidationResult::default();

    let Some(entries) = document.get("subtasks").and_then(Value::as_array) else {
        result.issues.push(ValidationIssue::MissingSubtasksArray);
        return result;
    };
    if entries.is_empty() {
        result.issues.push(ValidationIssue::EmptySubtasks);
        return result;
    }

    let mut seen = HashSet::new();
    for (index, entry) in entries.iter().enumerate() {
        let fields: Vec<_> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|field| non_empty_str(entry, field).is_none())
            .collect();
        let id = non_empty_str(entry, "id");

        if !fields.is_empty() {
            result.issues.push(ValidationIssue::MissingFields {
                index,
                id: id.map(str::to_string),
                fields,
            });
        }
        if let Some(id) = id {
            if !seen.insert(id) {
                result.issues.push(ValidationIssue::DuplicateId(id.to_string()));
            }
        }
    }

    result
}

/// Describe validation problems for a human or a fix agent.
pub fn generate_feedback(result: &ValidationResult) -> String {
    if result.is_valid() {
        return "Subtasks are valid.".to_string();
    }
    let mut lines = vec![format!(
        "Subtask validation failed with {} issue(s):",
        result.issues.len()
    )];
    lines.extend(result.issues.iter().map(|issue| format!("- {}", issue)));
    lines.push(format!(
        "Every subtask needs non-empty string fields: {}.",
        REQUIRED_FIELDS.join(", ")
    ));
    lines.join("\n")
}

/// Words that mark a subtask as verification work.
static QA_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(validat(e|es|ion)|verif(y|ies|ication)|tests?|testing|lint(ing)?|build|review|qa|check(s|ing)?)\b",
    )
    .unwrap()
});

/// Classify a subtask that has no explicit type by its label and content.
pub fn infer_subtask_type(label: &str, content: &str) -> SubtaskType {
    if QA_KEYWORDS.is_match(label) || QA_KEYWORDS.is_match(content) {
        SubtaskType::Qa
    } else {
        SubtaskType::Dev
    }
}

/// Build subtasks from a validated document. Explicit `"dev"`/`"qa"` types
/// are kept; anything else is inferred. Status always starts as pending.
pub fn normalize_subtasks(document: &Value) -> Vec<Subtask> {
    let Some(entries) = document.get("subtasks").and_then(Value::as_array) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let id = non_empty_str(entry, "id")?;
            let label = non_empty_str(entry, "label")?;
            let content = non_empty_str(entry, "content")?;

            let kind = match entry.get("type").and_then(Value::as_str) {
                Some("qa") => SubtaskType::Qa,
                Some("dev") => SubtaskType::Dev,
                _ => infer_subtask_type(label, content),
            };

            let mut subtask = Subtask::new(id, kind, label, content);
            if let Some(active_form) = non_empty_str(entry, "activeForm") {
                subtask.active_form = active_form.to_string();
            }
            Some(subtask)
        })
        .collect()
}

/// Extract, validate and normalize a subtask-generation response.
/// The error string is suitable for a fix prompt.
pub fn parse_subtasks(raw: &str) -> Result<Vec<Subtask>, String> {
    let document = extract_json(raw).map_err(|e| e.to_string())?;
    let result = validate_subtasks(&document);
    if !result.is_valid() {
        return Err(generate_feedback(&result));
    }
    Ok(normalize_subtasks(&document))
}
