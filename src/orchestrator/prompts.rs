//! Prompt construction.
//!
//! Plan and subtask generation templates can be overridden per project in
//! `{project}/.code-automata/prompts.json`:
//!
//! ```json
//! { "planGeneration": { "custom": true, "template": "Plan {{task.title}} ..." } }
//! ```
//!
//! Only the editable body is replaceable; the JSON-format suffix that the
//! extractor depends on is always appended.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::task::{Subtask, Task, DATA_DIR};

const PROMPTS_FILE: &str = "prompts.json";
const MANUAL_QA_FOLDER: &str = "manual-qa-required";
/// How much of the approved plan is quoted in QA prompts.
const PLAN_SUMMARY_CHARS: usize = 500;

pub const PLAN_GENERATION_DEFAULT_TEMPLATE: &str = r#"You are an AI planning assistant. Your task is to help plan the implementation of the following task.

Title: {{task.title}}
Description: {{task.description}}

# PLANNING PHASE: Direct Plan Generation

Your goal is to create a comprehensive implementation plan for this task.

Create a detailed plan in EXACTLY this structure (required headings):
- ## Overview
- ## Technical Approach
- ## Implementation Steps (numbered list)
- ## Files to Modify (bullet list of file paths)
- ## Testing Strategy
- ## Potential Issues
- ## Success Criteria

Format your plan in Markdown with clear headings and bullet points."#;

const NO_FILES_IN_WORKTREE: &str = r#"
Do NOT create implementation-plan.json, planning-questions.json, plan.md, subtasks.json, or similar files in your working directory - they pollute the worktree and we cannot read them.
If you must write to a file for your workflow, use ONLY the project's .code-automata/scratch/ directory. You must still output the JSON in your chat message."#;

const PLAN_GENERATION_SUFFIX: &str = r##"

Return your plan in the following JSON format:
{
  "plan": "# Implementation Plan\n\n## Overview\n...full markdown plan here..."
}

CRITICAL - Your response MUST contain the raw JSON as plain text in your message:
- The system ONLY captures your text/chat output. We cannot read files you create.
- You MUST output the JSON directly in your final message - writing to a file does NOT work.
- No markdown code fences, no explanatory text before or after the JSON.
- Your last message must be the raw JSON object, e.g. {"plan":"# Implementation Plan\n\n## Overview\n..."}"##;

pub const SUBTASK_GENERATION_DEFAULT_TEMPLATE: &str = r#"You are an AI development assistant. Your task is to break down an implementation plan into actionable subtasks.

**Task:** {{task.title}}
**Description:** {{task.description}}

**Approved Implementation Plan:**
{{planContent}}

# SUBTASK GENERATION

Your goal is to break down this plan into 5-15 concrete, actionable subtasks that can be executed sequentially.

For each subtask, provide:
- **id**: Unique identifier (e.g., "subtask-1", "subtask-2")
- **content**: Detailed description of what needs to be done (be specific about files, logic, etc.)
- **label**: Short label (3-5 words) for UI display (e.g., "Create API endpoint", "Add validation logic")
- **activeForm**: Present continuous form for progress display (e.g., "Creating API endpoint")
- **type**: Either "dev" or "qa"

**Guidelines:**
1. Order subtasks logically (dependencies first)
2. Be specific about files, functions, and changes needed
3. Cap at 15 subtasks maximum
4. Include at least 2 QA subtasks ("type": "qa") that ONLY verify/test (run build/tests, validate behavior)
5. Put verification steps (build/test/lint/validate/verify) under QA, not dev
6. For QA subtasks that require manual human verification (UI testing, visual review), include "manual" in the label or content
7. Each QA subtask should reference the specific dev work it verifies (files, feature areas)"#;

const SUBTASK_GENERATION_SUFFIX: &str = r#"

Return your subtasks in the following JSON format:
{
  "subtasks": [
    {
      "id": "subtask-1",
      "content": "Create the API route file at src/api/example.rs with a POST handler",
      "label": "Create API endpoint",
      "activeForm": "Creating API endpoint",
      "type": "dev"
    },
    {
      "id": "subtask-qa-1",
      "content": "Verify the API endpoint in src/api/example.rs: review for errors, check it matches the plan, run the build",
      "label": "Verify API endpoint",
      "activeForm": "Verifying API endpoint",
      "type": "qa"
    }
  ]
}

CRITICAL - Your response MUST contain the raw JSON as plain text in your message:
- The system ONLY captures your text/chat output. We cannot read files you create.
- No markdown code fences, no explanatory text before or after.
- Your last message must be the raw JSON object."#;

// ─────────────────────────────────────────────────────────────────────────────
// Project overrides
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptOverride {
    #[serde(default)]
    pub custom: bool,
    #[serde(default)]
    pub template: String,
}

impl PromptOverride {
    fn active_template(&self) -> Option<&str> {
        let template = self.template.trim();
        (self.custom && !template.is_empty()).then_some(template)
    }
}

/// Contents of `prompts.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPrompts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_generation: Option<PromptOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_generation: Option<PromptOverride>,
}

impl ProjectPrompts {
    /// Load overrides for a project. A missing file is normal; an unreadable
    /// or invalid one is reported and ignored.
    pub async fn load(project_dir: &Path) -> Self {
        let path = project_dir.join(DATA_DIR).join(PROMPTS_FILE);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                tracing::warn!("Failed to read {}: {}, using default prompts", path.display(), e);
                return Self::default();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(prompts) => {
                tracing::debug!("Loaded prompt overrides from {}", path.display());
                prompts
            }
            Err(e) => {
                tracing::warn!("Invalid {}: {}, using default prompts", path.display(), e);
                Self::default()
            }
        }
    }

    fn plan_template(&self) -> &str {
        self.plan_generation
            .as_ref()
            .and_then(PromptOverride::active_template)
            .unwrap_or(PLAN_GENERATION_DEFAULT_TEMPLATE)
    }

    fn subtask_template(&self) -> &str {
        self.subtask_generation
            .as_ref()
            .and_then(PromptOverride::active_template)
            .unwrap_or(SUBTASK_GENERATION_DEFAULT_TEMPLATE)
    }

    pub fn plan_generation_prompt(&self, task: &Task) -> String {
        let body = replace_placeholders(self.plan_template(), task);
        format!("{}{}{}", body, PLAN_GENERATION_SUFFIX, NO_FILES_IN_WORKTREE)
    }

    pub fn subtask_generation_prompt(&self, task: &Task) -> String {
        let body = replace_placeholders(self.subtask_template(), task);
        format!("{}{}{}", body, SUBTASK_GENERATION_SUFFIX, NO_FILES_IN_WORKTREE)
    }
}

fn replace_placeholders(template: &str, task: &Task) -> String {
    template
        .replace("{{task.title}}", &task.title)
        .replace("{{task.description}}", &task.description)
        .replace("{{planContent}}", task.plan_content.as_deref().unwrap_or(""))
}

// ─────────────────────────────────────────────────────────────────────────────
// Fix prompts
// ─────────────────────────────────────────────────────────────────────────────

pub fn plan_fix_prompt(error: &str, previous_output: &str) -> String {
    format!(
        r#"Your previous response could not be parsed as valid JSON.

Parse error: {error}

Here is your previous output:
---
{previous_output}
---

Your task: Output ONLY valid JSON. The system ONLY captures your text output - we cannot read files.
Prefer extracting the plan from the output above. If you previously wrote to implementation-plan.json, you may read it and output its contents wrapped as: {{"plan": "<content>"}} - but do NOT write new files to the worktree.

Required format:
{{
  "plan": "<markdown string - the full implementation plan content>"
}}

Rules:
- Escape any quotes inside the plan string (use \" for literal quotes)
- Do not wrap the JSON in markdown code fences
- Your final message must be ONLY the JSON object"#
    )
}

pub fn subtask_fix_prompt(error: &str, previous_output: &str) -> String {
    format!(
        r#"Your previous subtask list could not be used.

Problem:
{error}

Here is your previous output:
---
{previous_output}
---

Your task: Output ONLY the corrected JSON. Keep the subtasks from the output above, fix the problems listed, and do not write files.

Required format:
{{
  "subtasks": [
    {{"id": "subtask-1", "content": "<detailed instruction>", "label": "<short label>", "activeForm": "<progress text>", "type": "dev"}}
  ]
}}

Rules:
- Every subtask needs non-empty "id", "content" and "label" strings, and ids must be unique
- "type" is "dev" or "qa"
- Do not wrap the JSON in markdown code fences
- Your final message must be ONLY the JSON object"#
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Execution prompts
// ─────────────────────────────────────────────────────────────────────────────

/// Prompt for a dev subtask. Pending QA feedback turns it into a rework prompt.
pub fn dev_subtask_prompt(subtask: &Subtask, qa_feedback: Option<&str>) -> String {
    match qa_feedback.filter(|f| !f.trim().is_empty()) {
        Some(feedback) => format!(
            "{}\n\n---\n\nNow execute the following rework subtask to address the issues above:\n\n**Subtask:** {}\n**Details:** {}\n\nPlease fix the issues identified in the QA feedback and implement this subtask.",
            feedback, subtask.label, subtask.content
        ),
        None => format!(
            "Execute the following subtask as part of the implementation plan:\n\n**Subtask:** {}\n**Details:** {}\n\nPlease implement this subtask following best practices.",
            subtask.label, subtask.content
        ),
    }
}

/// Path (relative to the working tree) of a manual QA subtask's checklist.
pub fn manual_qa_doc_path(subtask: &Subtask) -> String {
    format!("{}/{}.md", MANUAL_QA_FOLDER, subtask.id)
}

pub fn qa_subtask_prompt(subtask: &Subtask) -> String {
    if subtask.is_manual_qa() {
        return format!(
            r#"Execute the following QA verification subtask (requires manual human verification):

**QA Subtask:** {label}
**Details:** {content}

IMPORTANT - This is a MANUAL QA subtask. You must:
1. Create exactly ONE markdown file for human verification
2. Write it to: {path}
3. Keep the document CONCISE - only what the human needs to verify (checklist, steps, or brief notes)
4. Do NOT write multiple docs or change code
5. Create the {folder} folder if it does not exist

Verify and document what a human should check. Be brief."#,
            label = subtask.label,
            content = subtask.content,
            path = manual_qa_doc_path(subtask),
            folder = MANUAL_QA_FOLDER,
        );
    }

    format!(
        "Execute the following QA verification subtask:\n\n**QA Subtask:** {}\n**Details:** {}\n\nPlease verify and test this thoroughly following best practices.",
        subtask.label, subtask.content
    )
}

fn plan_summary(plan: Option<&str>) -> String {
    match plan.filter(|p| !p.trim().is_empty()) {
        Some(plan) => plan.chars().take(PLAN_SUMMARY_CHARS).collect(),
        None => "No plan content available".to_string(),
    }
}

/// QA prompt grounded in the completed dev work and the approved plan.
pub fn qa_prompt_with_context(subtask: &Subtask, task: &Task) -> String {
    let dev_summary = task.completed_dev_summary();
    format!(
        r#"{base}

---

**Context: Completed Development Work**

The following dev subtasks were completed for this task:

{dev_summary}

**Your QA Responsibilities:**

1. **Review code for errors:** Check for syntax issues, runtime problems, and logical errors
2. **Verify plan-code harmony:** Ensure the implementation matches the approved plan
3. **Run verification:** Execute any tests or checks relevant to this subtask

Approved Plan Summary:
{plan}...

Please verify thoroughly."#,
        base = qa_subtask_prompt(subtask),
        dev_summary = if dev_summary.is_empty() {
            "(none)".to_string()
        } else {
            dev_summary
        },
        plan = plan_summary(task.plan_content.as_deref()),
    )
}
