//! # Code Automata
//!
//! A task orchestration engine that drives autonomous coding agents through a
//! fixed workflow.
//!
//! ## Architecture
//!
//! ```text
//!   planning ──→ in_progress ──→ ai_review ──→ human_review ──→ done
//!                    ↑               │
//!                    └── rework ─────┘
//! ```
//!
//! ## Task Flow
//! 1. Create a task and generate a plan with an agent
//! 2. Approve the plan; subtasks are generated from it
//! 3. Dev subtasks run one at a time, then QA subtasks verify them
//! 4. Automated checks decide between human review and a rework pass
//!
//! ## Modules
//! - `task`: Task model, JSON store and per-task logs
//! - `orchestrator`: Lock, generation pipeline, subtask executor, dev+QA loop
//! - `agent`: Agent gateway trait and the process-backed implementation
//! - `checks`: Automated typecheck/build/lint
//! - `api`: HTTP surface

pub mod agent;
pub mod api;
pub mod checks;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod task;
pub mod worktree;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
