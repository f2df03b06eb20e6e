//! Working-tree hygiene.
//!
//! Planning agents sometimes write their plan or questions to files instead of
//! answering in text. Those files must not leak into the delivered tree, so
//! they are removed at every transition past planning.

use std::path::{Path, PathBuf};

use crate::task::DATA_DIR;

/// Files planning agents are known to leave behind.
pub const PLANNING_ARTIFACTS: &[&str] = &[
    "implementation-plan.json",
    "implementation_plan.json",
    "planning-questions.json",
    "planning_questions.json",
];

/// Scratch directory agents may use outside the working tree.
pub fn scratch_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(DATA_DIR).join("scratch")
}

/// Remove planning artifacts from `working_dir` and wipe the project scratch
/// directory. Missing files are fine; other failures are logged.
pub async fn clean_planning_artifacts(working_dir: &Path, project_dir: &Path) {
    for name in PLANNING_ARTIFACTS {
        let path = working_dir.join(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::debug!("Removed planning artifact {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
        }
    }

    let scratch = scratch_dir(project_dir);
    match tokio::fs::remove_dir_all(&scratch).await {
        Ok(()) => tracing::debug!("Removed scratch directory {}", scratch.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {}", scratch.display(), e),
    }
}
