//! Error types for orchestration operations.

use thiserror::Error;

use crate::task::TaskPhase;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Task {0} not found")]
    TaskNotFound(String),

    #[error("Subtask {subtask_id} not found in task {task_id}")]
    SubtaskNotFound { task_id: String, subtask_id: String },

    #[error("Orchestrator is already starting/resuming for task {0}")]
    Locked(String),

    #[error("Task {0} orchestrator is already running")]
    AlreadyRunning(String),

    #[error("Invalid task state: {0}")]
    InvalidState(String),

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidTransition { from: TaskPhase, to: TaskPhase },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
