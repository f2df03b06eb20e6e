//! Orchestrator lock registry.
//!
//! Guarantees that at most one orchestrator loop is being started or resumed
//! for a given task. Entries older than the staleness threshold are treated as
//! abandoned and replaced on the next acquire.
//!
//! The registry is process-scoped and purely in-memory; it does not survive a
//! restart. Stale agent assignments left behind by a crash are handled by
//! [`crate::task::clear_stale_agent`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Entries older than this are considered abandoned.
pub const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// What the lock holder is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOperation {
    Starting,
    Resuming,
}

impl fmt::Display for LockOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => f.write_str("starting"),
            Self::Resuming => f.write_str("resuming"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    acquired_at: Instant,
    operation: LockOperation,
}

/// Per-task lock table. Acquire, release, query and sweep are the only
/// operations; the map itself is never exposed.
#[derive(Debug)]
pub struct OrchestratorLock {
    entries: Mutex<HashMap<String, LockEntry>>,
    stale_after: Duration,
}

pub type SharedLock = Arc<OrchestratorLock>;

impl Default for OrchestratorLock {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorLock {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            stale_after: LOCK_STALE_AFTER,
        }
    }

    /// Override the staleness threshold.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, LockEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Try to take the lock for `task_id`. Returns false if a fresh entry exists.
    pub fn acquire(&self, task_id: &str, operation: LockOperation) -> bool {
        let mut entries = self.entries();
        if let Some(existing) = entries.get(task_id) {
            if existing.acquired_at.elapsed() < self.stale_after {
                tracing::debug!(
                    "Lock for task {} already held ({})",
                    task_id,
                    existing.operation
                );
                return false;
            }
            tracing::warn!(
                "Replacing stale {} lock for task {}",
                existing.operation,
                task_id
            );
        }
        entries.insert(
            task_id.to_string(),
            LockEntry {
                acquired_at: Instant::now(),
                operation,
            },
        );
        true
    }

    pub fn release(&self, task_id: &str) {
        if self.entries().remove(task_id).is_some() {
            tracing::debug!("Released orchestrator lock for task {}", task_id);
        }
    }

    /// Whether a fresh lock is held. Stale entries are dropped as a side effect.
    pub fn is_locked(&self, task_id: &str) -> bool {
        let mut entries = self.entries();
        match entries.get(task_id) {
            Some(entry) if entry.acquired_at.elapsed() < self.stale_after => true,
            Some(_) => {
                entries.remove(task_id);
                false
            }
            None => false,
        }
    }

    /// Drop every stale entry. Returns how many were removed.
    pub fn sweep_stale(&self) -> usize {
        let stale_after = self.stale_after;
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| entry.acquired_at.elapsed() < stale_after);
        before - entries.len()
    }
}
