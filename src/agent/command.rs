//! Process-backed agent gateway.
//!
//! Runs a configured shell command (for example `claude -p`) in the task's
//! working directory, feeds the prompt on stdin and reports stdout as the
//! agent output once the process exits.

use std::collections::HashMap;
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::oneshot;

use super::{AgentCompletion, AgentGateway, AgentRequest, AgentRun};
use crate::task::AgentHandle;

/// Output beyond this many characters is truncated.
const MAX_OUTPUT_CHARS: usize = 200_000;

/// Sanitize process output so it can be stored and re-prompted.
/// Binary garbage is replaced by a note, control characters are dropped.
fn sanitize_output(bytes: &[u8]) -> String {
    let non_printable_count = bytes
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t')
        .count();

    // More than 10% non-printable (excluding newlines/tabs) is likely binary
    if bytes.len() > 100 && non_printable_count > bytes.len() / 10 {
        return format!(
            "[Binary output detected - {} bytes, {}% non-printable]",
            bytes.len(),
            non_printable_count * 100 / bytes.len()
        );
    }

    let text = String::from_utf8_lossy(bytes);
    let mut cleaned: String = text
        .chars()
        .filter(|&c| c == '\n' || c == '\r' || c == '\t' || (c >= ' ' && c != '\u{FFFD}'))
        .collect();

    if cleaned.chars().count() > MAX_OUTPUT_CHARS {
        cleaned = cleaned.chars().take(MAX_OUTPUT_CHARS).collect();
        cleaned.push_str("\n[output truncated]");
    }
    cleaned
}

fn completion_from_output(output: Output) -> AgentCompletion {
    let stdout = sanitize_output(&output.stdout);
    if output.status.success() {
        return AgentCompletion::success(stdout);
    }

    let stderr = sanitize_output(&output.stderr);
    let error = match output.status.code() {
        Some(code) if stderr.trim().is_empty() => format!("Agent exited with code {}", code),
        Some(code) => format!("Agent exited with code {}: {}", code, stderr.trim()),
        None => format!("Agent terminated by signal: {}", stderr.trim()),
    };
    AgentCompletion {
        success: false,
        output: stdout,
        error: Some(error),
    }
}

/// Gateway that runs each agent invocation as a child process.
#[derive(Clone)]
pub struct CommandAgent {
    command: String,
    running: Arc<Mutex<HashMap<AgentHandle, oneshot::Sender<()>>>>,
}

impl CommandAgent {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn running(&self) -> std::sync::MutexGuard<'_, HashMap<AgentHandle, oneshot::Sender<()>>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl AgentGateway for CommandAgent {
    async fn start_agent(&self, request: AgentRequest) -> anyhow::Result<AgentRun> {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&request.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "Failed to spawn agent command '{}' in {}",
                    self.command,
                    request.working_dir.display()
                )
            })?;

        // Feed stdin concurrently so a chatty child cannot deadlock on a full pipe.
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt;
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    tracing::warn!("Failed to write prompt to agent stdin: {}", e);
                }
            });
        }

        let handle = AgentHandle::generate();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        self.running().insert(handle.clone(), stop_tx);

        tracing::info!(
            task_id = %request.task_id,
            "Started agent {} ({})",
            handle,
            self.command
        );

        let running = Arc::clone(&self.running);
        let task_handle = handle.clone();
        tokio::spawn(async move {
            let completion = tokio::select! {
                result = child.wait_with_output() => match result {
                    Ok(output) => completion_from_output(output),
                    Err(e) => AgentCompletion::failure(format!("Failed to wait for agent: {}", e)),
                },
                // Dropping the wait future drops the child, which kills it.
                _ = stop_rx => AgentCompletion::failure("Agent stopped"),
            };

            running
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&task_handle);
            tracing::debug!("Agent {} finished (success: {})", task_handle, completion.success);
            let _ = done_tx.send(completion);
        });

        Ok(AgentRun {
            handle,
            completion: done_rx,
        })
    }

    fn is_active(&self, handle: &AgentHandle) -> bool {
        self.running().contains_key(handle)
    }

    async fn stop_agent(&self, handle: &AgentHandle) -> bool {
        match self.running().remove(handle) {
            Some(stop) => {
                let _ = stop.send(());
                tracing::info!("Stopped agent {}", handle);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn request(dir: &std::path::Path, prompt: &str) -> AgentRequest {
        AgentRequest {
            task_id: "task-1".to_string(),
            prompt: prompt.to_string(),
            working_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_sanitize_output_strips_control_chars() {
        assert_eq!(sanitize_output(b"ok\x00\x07 done\n"), "ok done\n");
        let binary = vec![0u8; 200];
        assert!(sanitize_output(&binary).starts_with("[Binary output detected"));
    }

    #[tokio::test]
    async fn test_prompt_is_echoed_back() {
        let temp = tempdir().unwrap();
        let agent = CommandAgent::new("cat");
        let run = agent
            .start_agent(request(temp.path(), "{\"plan\": \"x\"}"))
            .await
            .unwrap();
        let completion = run.finished().await;
        assert!(completion.success);
        assert_eq!(completion.output, "{\"plan\": \"x\"}");
    }

    #[tokio::test]
    async fn test_failing_command_reports_error() {
        let temp = tempdir().unwrap();
        let agent = CommandAgent::new("echo broken >&2; exit 3");
        let completion = agent
            .start_agent(request(temp.path(), ""))
            .await
            .unwrap()
            .finished()
            .await;
        assert!(!completion.success);
        assert_eq!(
            completion.error.as_deref(),
            Some("Agent exited with code 3: broken")
        );
    }

    #[tokio::test]
    async fn test_stop_agent() {
        let temp = tempdir().unwrap();
        let agent = CommandAgent::new("sleep 30");
        let run = agent.start_agent(request(temp.path(), "")).await.unwrap();
        assert!(agent.is_active(&run.handle));

        assert!(agent.stop_agent(&run.handle).await);
        let handle = run.handle.clone();
        let completion = run.finished().await;
        assert!(!completion.success);
        assert!(!agent.is_active(&handle));
        assert!(!agent.stop_agent(&handle).await);
    }
}
