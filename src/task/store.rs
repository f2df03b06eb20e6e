//! File-backed task persistence.
//!
//! One JSON document per task at `{project}/.code-automata/tasks/{id}.json`,
//! plus a derived `{project}/.code-automata/implementation_plan.json` summary
//! (phase → tasks) that is rewritten on every save for external tooling.
//!
//! The store is the single source of truth. Mutations are read-modify-write
//! with last-write-wins semantics; in-process writers are serialized through
//! a mutex so a reload-mutate-save cycle is never interleaved with another.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tokio::fs;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use super::task::{Task, TaskPhase};

/// Directory name holding all orchestrator state inside a project.
pub const DATA_DIR: &str = ".code-automata";

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Persistent store for tasks with JSON file backing.
pub struct TaskStore {
    project_dir: PathBuf,
    tasks_dir: PathBuf,
    summary_path: PathBuf,
    write_lock: Mutex<()>,
    changes: broadcast::Sender<String>,
}

impl TaskStore {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        let data_dir = project_dir.join(DATA_DIR);
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            tasks_dir: data_dir.join("tasks"),
            summary_path: data_dir.join("implementation_plan.json"),
            project_dir,
            write_lock: Mutex::new(()),
            changes,
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Per-task directory for logs and other artifacts.
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.tasks_dir.join(task_id)
    }

    /// Receive the id of every task saved from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }

    fn task_path(&self, task_id: &str) -> Option<PathBuf> {
        if task_id.is_empty()
            || task_id.contains('/')
            || task_id.contains('\\')
            || task_id.contains("..")
        {
            return None;
        }
        Some(self.tasks_dir.join(format!("{}.json", task_id)))
    }

    /// Load a task. Missing and corrupted documents both come back as `None`
    /// so one bad file cannot take down listing.
    pub async fn load(&self, task_id: &str) -> Result<Option<Task>> {
        let Some(path) = self.task_path(task_id) else {
            return Ok(None);
        };

        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        match serde_json::from_str(&contents) {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                tracing::error!(
                    "Corrupted task document {} ({}), treating as missing",
                    path.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    /// Save a task as-is, then refresh the summary and notify subscribers.
    pub async fn save(&self, task: &Task) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_task(task).await
    }

    /// Reload, mutate and save a task in one serialized step.
    ///
    /// Returns `None` when the task no longer exists.
    pub async fn update<F, R>(&self, task_id: &str, f: F) -> Result<Option<R>>
    where
        F: FnOnce(&mut Task) -> R,
    {
        let _guard = self.write_lock.lock().await;
        let Some(mut task) = self.load(task_id).await? else {
            return Ok(None);
        };
        let result = f(&mut task);
        task.touch();
        self.write_task(&task).await?;
        Ok(Some(result))
    }

    /// Like [`update`](Self::update), but the closure may refuse the change.
    /// Nothing is written when it returns an error.
    pub async fn try_update<F, R>(&self, task_id: &str, f: F) -> crate::Result<R>
    where
        F: FnOnce(&mut Task) -> crate::Result<R>,
    {
        let _guard = self.write_lock.lock().await;
        let mut task = self
            .load(task_id)
            .await?
            .ok_or_else(|| crate::Error::TaskNotFound(task_id.to_string()))?;
        let result = f(&mut task)?;
        task.touch();
        self.write_task(&task).await?;
        Ok(result)
    }

    async fn write_task(&self, task: &Task) -> Result<()> {
        let path = self
            .task_path(&task.id)
            .with_context(|| format!("Invalid task id {:?}", task.id))?;

        fs::create_dir_all(&self.tasks_dir)
            .await
            .context("Failed to create tasks directory")?;

        let contents = serde_json::to_string_pretty(task)?;
        let tmp = path.with_extension(format!("json.tmp-{}", Uuid::new_v4().simple()));
        fs::write(&tmp, contents)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;

        self.write_summary().await;
        let _ = self.changes.send(task.id.clone());
        Ok(())
    }

    /// List all readable tasks, newest first.
    pub async fn list(&self) -> Result<Vec<Task>> {
        let mut entries = match fs::read_dir(&self.tasks_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to read tasks directory"),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }

        let mut tasks = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(task) = self.load(id).await? {
                tasks.push(task);
            }
        }

        let skipped = ids.len() - tasks.len();
        if skipped > 0 {
            tracing::warn!("Skipped {} corrupted task file(s)", skipped);
        }

        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    /// Delete a task document. Returns whether it existed.
    pub async fn delete(&self, task_id: &str) -> Result<bool> {
        let Some(path) = self.task_path(task_id) else {
            return Ok(false);
        };
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => {
                self.write_summary().await;
                let _ = self.changes.send(task_id.to_string());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }

    async fn write_summary(&self) {
        let tasks = match self.list().await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!("Failed to list tasks for summary: {}", e);
                return;
            }
        };

        let phases: Vec<_> = TaskPhase::ALL
            .iter()
            .map(|phase| {
                let entries: Vec<_> = tasks
                    .iter()
                    .filter(|t| t.phase == *phase)
                    .map(|t| {
                        json!({
                            "id": t.id,
                            "title": t.title,
                            "status": t.status,
                            "subtasks": t.subtasks.len(),
                            "assignedAgent": t.assigned_agent,
                        })
                    })
                    .collect();
                json!({ "name": phase.as_str(), "tasks": entries })
            })
            .collect();

        let summary = json!({
            "version": "1.0",
            "updated": Utc::now().to_rfc3339(),
            "totalTasks": tasks.len(),
            "phases": phases,
        });

        let result = match serde_json::to_string_pretty(&summary) {
            Ok(contents) => fs::write(&self.summary_path, contents).await,
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        };
        if let Err(e) = result {
            tracing::error!("Failed to update implementation plan summary: {}", e);
        }
    }
}
