//! Agent gateway - "run an agent with a prompt, get text back".
//!
//! The orchestrator never looks inside an agent. It starts one with a prompt and
//! a working directory, gets back a handle, and later receives exactly one
//! [`AgentCompletion`] through the run's completion channel.

mod command;

pub use command::CommandAgent;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::task::AgentHandle;

/// What to run.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub task_id: String,
    pub prompt: String,
    pub working_dir: PathBuf,
}

/// The three-field completion contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCompletion {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentCompletion {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }
}

/// A started agent invocation.
#[derive(Debug)]
pub struct AgentRun {
    pub handle: AgentHandle,
    pub completion: oneshot::Receiver<AgentCompletion>,
}

impl AgentRun {
    /// Wait for the completion signal. A gateway that drops the sender without
    /// reporting counts as a failed invocation.
    pub async fn finished(self) -> AgentCompletion {
        self.completion.await.unwrap_or_else(|_| {
            AgentCompletion::failure("Agent exited without reporting completion")
        })
    }
}

/// Trait for agent backends.
#[async_trait]
pub trait AgentGateway: Send + Sync {
    /// Start an agent. Returns as soon as the invocation is underway.
    async fn start_agent(&self, request: AgentRequest) -> anyhow::Result<AgentRun>;

    /// Whether the invocation behind `handle` is still running.
    fn is_active(&self, handle: &AgentHandle) -> bool;

    /// Stop a running invocation. Returns false if it was not running.
    async fn stop_agent(&self, handle: &AgentHandle) -> bool;
}

pub type AgentRef = Arc<dyn AgentGateway>;
