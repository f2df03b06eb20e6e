//! Task module - tasks, subtasks, persistence and per-task logs.
//!
//! - `task`: the task record, its phase/status enums and the agent assignment
//! - `subtask`: ordered dev/QA work items
//! - `store`: JSON-file persistence, the single source of truth
//! - `log`: human-readable progress logs next to each task
//! - `cleanup`: recovery of agent assignments orphaned by a restart

mod cleanup;
mod log;
mod store;
mod subtask;
pub mod task;

pub use cleanup::clear_stale_agent;
pub use log::{LogKind, TaskLog};
pub use store::{TaskStore, DATA_DIR};
pub use subtask::{Subtask, SubtaskStatus, SubtaskType};
pub use task::{
    AgentAssignment, AgentHandle, PlanningStatus, QaOutcome, QaResult, Task, TaskPhase, TaskStatus,
};
