//! Common test utilities: a scripted agent gateway and checks runner.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use code_automata::agent::{AgentCompletion, AgentGateway, AgentRequest, AgentRun};
use code_automata::checks::{CheckOutput, CheckSet, ChecksRunner, QaCheckResult};
use code_automata::task::{AgentHandle, PlanningStatus, QaOutcome, Task};
use code_automata::{Config, Orchestrator};

/// What the scripted agent does for one invocation.
pub enum Reply {
    Output(String),
    Fail(String),
    /// Never completes until stopped
    Hang,
    /// Like `Hang`, but `start_agent` only returns after the delay
    SlowHang(Duration),
    /// `start_agent` itself errors
    StartError,
}

/// Agent gateway that replays queued replies and records every prompt.
/// Once the queue is empty each invocation succeeds with "done".
#[derive(Default)]
pub struct ScriptedAgent {
    replies: Mutex<VecDeque<Reply>>,
    prompts: Mutex<Vec<String>>,
    hanging: Mutex<HashMap<AgentHandle, oneshot::Sender<AgentCompletion>>>,
    started: AtomicUsize,
}

impl ScriptedAgent {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        })
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    /// Agents started and not yet stopped.
    pub fn hanging_count(&self) -> usize {
        self.hanging.lock().unwrap().len()
    }

    pub fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }
}

#[async_trait]
impl AgentGateway for ScriptedAgent {
    async fn start_agent(&self, request: AgentRequest) -> anyhow::Result<AgentRun> {
        self.prompts.lock().unwrap().push(request.prompt);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Reply::Output("done".to_string()));

        let n = self.started.fetch_add(1, Ordering::SeqCst);
        let handle = AgentHandle::from(format!("scripted-{}", n));
        let (tx, rx) = oneshot::channel();

        match reply {
            Reply::Output(output) => {
                let _ = tx.send(AgentCompletion::success(output));
            }
            Reply::Fail(error) => {
                let _ = tx.send(AgentCompletion::failure(error));
            }
            Reply::Hang => {
                self.hanging.lock().unwrap().insert(handle.clone(), tx);
            }
            Reply::SlowHang(delay) => {
                tokio::time::sleep(delay).await;
                self.hanging.lock().unwrap().insert(handle.clone(), tx);
            }
            Reply::StartError => anyhow::bail!("agent binary not found"),
        }

        Ok(AgentRun {
            handle,
            completion: rx,
        })
    }

    fn is_active(&self, handle: &AgentHandle) -> bool {
        self.hanging.lock().unwrap().contains_key(handle)
    }

    async fn stop_agent(&self, handle: &AgentHandle) -> bool {
        let sender = self.hanging.lock().unwrap().remove(handle);
        match sender {
            Some(tx) => {
                let _ = tx.send(AgentCompletion::failure("Agent stopped"));
                true
            }
            None => false,
        }
    }
}

/// Checks runner returning queued verdicts (pass once the queue is empty).
#[derive(Default)]
pub struct ScriptedChecks {
    verdicts: Mutex<VecDeque<bool>>,
    runs: AtomicUsize,
}

impl ScriptedChecks {
    pub fn new(verdicts: Vec<bool>) -> Arc<Self> {
        Arc::new(Self {
            verdicts: Mutex::new(verdicts.into()),
            runs: AtomicUsize::new(0),
        })
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChecksRunner for ScriptedChecks {
    async fn run(&self, _working_dir: &Path) -> QaCheckResult {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let passed = self.verdicts.lock().unwrap().pop_front().unwrap_or(true);
        let output = if passed {
            String::new()
        } else {
            "src/app.ts(3,1): error TS2304: Cannot find name 'foo'.".to_string()
        };
        QaCheckResult {
            overall: if passed { QaOutcome::Pass } else { QaOutcome::Fail },
            summary: if passed {
                "✓ typecheck passed".to_string()
            } else {
                "✗ typecheck failed".to_string()
            },
            details: format!("=== Typecheck ===\n{}", output),
            checks: CheckSet {
                typecheck: Some(CheckOutput { passed, output }),
                ..Default::default()
            },
        }
    }
}

/// Orchestrator over a temp project with short waits.
pub fn orchestrator(
    project_dir: &Path,
    agent: Arc<ScriptedAgent>,
    checks: Arc<ScriptedChecks>,
) -> Orchestrator {
    orchestrator_with_wait(project_dir, agent, checks, Duration::from_secs(5))
}

/// Like [`orchestrator`], with a custom bound on each subtask wait.
pub fn orchestrator_with_wait(
    project_dir: &Path,
    agent: Arc<ScriptedAgent>,
    checks: Arc<ScriptedChecks>,
    subtask_wait: Duration,
) -> Orchestrator {
    let mut config = Config::for_project(project_dir);
    config.subtask_wait = subtask_wait;
    config.poll_interval = Duration::from_millis(20);
    Orchestrator::new(config, agent, checks)
}

/// A task in planning with an approved plan.
pub async fn approved_task(orchestrator: &Orchestrator) -> Task {
    let task = orchestrator
        .create_task("Add login", "Users need to sign in", None)
        .await
        .expect("create task");
    orchestrator
        .store()
        .update(&task.id, |task| {
            task.plan_content = Some("# Plan\n1. Form\n2. Session".to_string());
            task.planning_status = Some(PlanningStatus::PlanReady);
        })
        .await
        .expect("store plan");
    orchestrator.approve_plan(&task.id).await.expect("approve")
}

/// Subtask generation output with the given dev and QA labels.
pub fn subtasks_json(dev: &[&str], qa: &[&str]) -> String {
    let mut entries = Vec::new();
    for (i, label) in dev.iter().enumerate() {
        entries.push(serde_json::json!({
            "id": format!("subtask-{}", i + 1),
            "content": format!("Implement {}", label),
            "label": label,
            "type": "dev",
        }));
    }
    for (i, label) in qa.iter().enumerate() {
        entries.push(serde_json::json!({
            "id": format!("subtask-verify-{}", i + 1),
            "content": format!("Verify {}", label),
            "label": label,
            "type": "qa",
        }));
    }
    format!(
        "Here are the subtasks:\n```json\n{}\n```",
        serde_json::json!({ "subtasks": entries })
    )
}

/// Poll until `done` holds for the stored task, or panic after 5s.
pub async fn wait_for(
    orchestrator: &Orchestrator,
    task_id: &str,
    done: impl Fn(&Task) -> bool,
) -> Task {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(task) = orchestrator.store().load(task_id).await.unwrap() {
            if done(&task) {
                return task;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for task {}",
            task_id
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn read_dev_log(orchestrator: &Orchestrator, task_id: &str) -> String {
    let path = orchestrator
        .store()
        .task_dir(task_id)
        .join("development-logs.txt");
    tokio::fs::read_to_string(path).await.unwrap_or_default()
}
