//! Human-readable per-task progress logs.
//!
//! Orchestration progress is written to plain-text files next to the task
//! document so people can follow what the agents did:
//! - `development-logs.txt`: planning, subtask generation and dev subtasks
//! - `review-logs.txt`: QA subtasks and automated checks
//!
//! Every line is mirrored to `tracing`. A failed log write is reported but
//! never interrupts orchestration.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Development,
    Review,
}

impl LogKind {
    fn file_name(&self) -> &'static str {
        match self {
            Self::Development => "development-logs.txt",
            Self::Review => "review-logs.txt",
        }
    }
}

/// Appends lines to one of a task's log files.
#[derive(Debug, Clone)]
pub struct TaskLog {
    task_id: String,
    path: PathBuf,
}

impl TaskLog {
    pub fn new(task_dir: &Path, task_id: &str, kind: LogKind) -> Self {
        Self {
            task_id: task_id.to_string(),
            path: task_dir.join(kind.file_name()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Append a line (a trailing newline is added).
    pub async fn line(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!(task_id = %self.task_id, "{}", message.trim());
        self.append(&format!("{}\n", message)).await;
    }

    /// Append a failure line. Also logged at warn level.
    pub async fn error(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::warn!(task_id = %self.task_id, "{}", message.trim());
        self.append(&format!("[Error] {}\n", message)).await;
    }

    /// Append a framed section header.
    pub async fn banner(&self, message: impl AsRef<str>) {
        let rule = "=".repeat(80);
        let message = message.as_ref();
        tracing::info!(task_id = %self.task_id, "{}", message);
        self.append(&format!("\n{}\n{}\n{}\n", rule, message, rule))
            .await;
    }

    /// Append raw agent output without mirroring it to tracing.
    pub async fn output(&self, output: &str) {
        self.append(&format!("[Output]\n{}\n", output)).await;
    }

    /// Start a new section with a header carrying task title and timestamp.
    pub async fn start(&self, heading: &str, title: &str) {
        let text = format!(
            "{} for task: {}\nTask ID: {}\nStarted at: {}\n{}\n\n",
            heading,
            title,
            self.task_id,
            Utc::now().to_rfc3339(),
            "=".repeat(80)
        );
        self.append(&text).await;
    }

    async fn append(&self, text: &str) {
        if let Err(e) = self.try_append(text).await {
            tracing::warn!("Failed to write log {}: {}", self.path.display(), e);
        }
    }

    async fn try_append(&self, text: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await
    }
}
