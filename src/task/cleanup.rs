//! Recovery of stale agent assignments.
//!
//! The orchestrator lock lives in memory, so a restarted process forgets which
//! tasks had a loop running while the task documents still name an agent.
//! These helpers detect such ghosts and clear them so the task can be resumed.

use super::task::{AgentAssignment, AgentHandle, Task};

/// Clear a stale assignment on `task`. Returns true if the task was modified.
///
/// An assignment is left alone while an orchestrator is active for the task
/// or while its agent is still live. The `Starting` and `Resuming` markers
/// only exist while a run holds the task, so outside one they are orphans.
pub fn clear_stale_agent(
    task: &mut Task,
    orchestrator_active: bool,
    is_live: impl Fn(&AgentHandle) -> bool,
) -> bool {
    if task.assigned_agent.is_idle() || orchestrator_active {
        return false;
    }

    if let AgentAssignment::Running(handle) = &task.assigned_agent {
        if is_live(handle) {
            return false;
        }
    }

    task.assigned_agent = AgentAssignment::Idle;
    let reset = task.reset_in_progress_subtasks();

    tracing::info!(
        "Cleared stale agent for task {}, reset {} in_progress subtask(s)",
        task.id,
        reset
    );

    true
}
