//! package.json-driven checks: typecheck, build and lint.
//!
//! - typecheck: always attempted (`<pm> run typecheck` if the script exists,
//!   otherwise `npx tsc --noEmit`)
//! - build / lint: only when the script exists
//!
//! The package manager is picked from the lockfile present in the tree.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use super::{CheckOutput, CheckSet, ChecksRunner, QaCheckResult};
use crate::task::QaOutcome;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Output kept per check. Anything past it is read and discarded so the
/// child never blocks on a full pipe.
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;
const TRUNCATED: &str = "\n[output truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackageManager {
    Npm,
    Yarn,
    Pnpm,
}

impl PackageManager {
    fn detect(working_dir: &Path) -> Self {
        if working_dir.join("yarn.lock").exists() {
            Self::Yarn
        } else if working_dir.join("pnpm-lock.yaml").exists() {
            Self::Pnpm
        } else {
            Self::Npm
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::Yarn => "yarn",
            Self::Pnpm => "pnpm",
        }
    }
}

async fn read_scripts(working_dir: &Path) -> Value {
    let path = working_dir.join("package.json");
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => serde_json::from_str::<Value>(&contents)
            .ok()
            .and_then(|v| v.get("scripts").cloned())
            .unwrap_or(Value::Null),
        Err(_) => Value::Null,
    }
}

fn has_script(scripts: &Value, name: &str) -> bool {
    scripts
        .get(name)
        .and_then(|v| v.as_str())
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false)
}

fn cap_output(mut text: String) -> String {
    if text.len() > MAX_OUTPUT_BYTES {
        let mut cut = MAX_OUTPUT_BYTES;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str(TRUNCATED);
    }
    text
}

/// Read at most `limit` bytes, then drain the rest. Returns the kept bytes and
/// whether anything was dropped.
async fn read_capped<R>(reader: Option<R>, limit: usize) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok((Vec::new(), false));
    };
    let mut kept = Vec::new();
    (&mut reader).take(limit as u64).read_to_end(&mut kept).await?;
    let dropped = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    Ok((kept, dropped > 0))
}

async fn run_command(command: &str, working_dir: &Path, timeout: Duration) -> CheckOutput {
    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match child {
        Ok(child) => child,
        Err(e) => {
            return CheckOutput {
                passed: false,
                output: format!("Failed to run '{}': {}", command, e),
            }
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let collect = async {
        let ((out, out_cut), (err, err_cut)) = tokio::try_join!(
            read_capped(stdout, MAX_OUTPUT_BYTES),
            read_capped(stderr, MAX_OUTPUT_BYTES)
        )?;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((status, out, err, out_cut || err_cut))
    };

    // On timeout the child is dropped with the future and killed.
    match tokio::time::timeout(timeout, collect).await {
        Ok(Ok((status, out, err, truncated))) => {
            let mut text = format!(
                "{}\n{}",
                String::from_utf8_lossy(&out),
                String::from_utf8_lossy(&err)
            )
            .trim()
            .to_string();
            if truncated {
                text.push_str(TRUNCATED);
            }
            CheckOutput {
                passed: status.success(),
                output: cap_output(text),
            }
        }
        Ok(Err(e)) => CheckOutput {
            passed: false,
            output: format!("Failed to wait for '{}': {}", command, e),
        },
        Err(_) => CheckOutput {
            passed: false,
            output: format!("'{}' timed out after {}s", command, timeout.as_secs()),
        },
    }
}

/// Checks runner for Node-style projects.
#[derive(Debug, Clone)]
pub struct ScriptChecks {
    timeout: Duration,
    force_fail: bool,
}

impl Default for ScriptChecks {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            force_fail: false,
        }
    }
}

impl ScriptChecks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Always report a simulated failure without running anything.
    /// Used to exercise the rework path.
    pub fn with_force_fail(mut self, enabled: bool) -> Self {
        self.force_fail = enabled;
        self
    }
}

#[async_trait]
impl ChecksRunner for ScriptChecks {
    async fn run(&self, working_dir: &Path) -> QaCheckResult {
        if self.force_fail {
            return QaCheckResult {
                overall: QaOutcome::Fail,
                summary: "[SIMULATED FAILURE] CODE_AUTOMATA_QA_FORCE_FAIL=1 (for testing rework path)"
                    .to_string(),
                details: "This is a simulated failure for testing. Unset CODE_AUTOMATA_QA_FORCE_FAIL to run real checks."
                    .to_string(),
                checks: CheckSet::default(),
            };
        }

        let pm = PackageManager::detect(working_dir);
        let scripts = read_scripts(working_dir).await;

        let typecheck_cmd = if has_script(&scripts, "typecheck") {
            format!("{} run typecheck", pm.as_str())
        } else {
            "npx tsc --noEmit".to_string()
        };

        let mut plan = vec![("typecheck", "Typecheck", typecheck_cmd)];
        for name in ["build", "lint"] {
            if has_script(&scripts, name) {
                let title = if name == "build" { "Build" } else { "Lint" };
                plan.push((name, title, format!("{} run {}", pm.as_str(), name)));
            }
        }

        let mut checks = CheckSet::default();
        let mut summary = Vec::new();
        let mut details = Vec::new();
        let mut overall = QaOutcome::Pass;

        for (name, title, command) in plan {
            tracing::info!("Running {} check: {}", name, command);
            let result = run_command(&command, working_dir, self.timeout).await;

            details.push(format!("=== {} ===", title));
            if result.passed {
                summary.push(format!("✓ {} passed", name));
                let output = if result.output.is_empty() {
                    "(no output)"
                } else {
                    result.output.as_str()
                };
                details.push(format!("✓ {} passed\n{}", title, output));
            } else {
                overall = QaOutcome::Fail;
                summary.push(format!("✗ {} failed", name));
                details.push(format!("✗ {} failed\n{}", title, result.output));
            }

            match name {
                "typecheck" => checks.typecheck = Some(result),
                "build" => checks.build = Some(result),
                _ => checks.lint = Some(result),
            }
        }

        QaCheckResult {
            overall,
            summary: summary.join(", "),
            details: details.join("\n"),
            checks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_package_manager_detection() {
        let temp = tempdir().unwrap();
        assert_eq!(PackageManager::detect(temp.path()), PackageManager::Npm);
        std::fs::write(temp.path().join("pnpm-lock.yaml"), "").unwrap();
        assert_eq!(PackageManager::detect(temp.path()), PackageManager::Pnpm);
        std::fs::write(temp.path().join("yarn.lock"), "").unwrap();
        assert_eq!(PackageManager::detect(temp.path()), PackageManager::Yarn);
    }

    #[tokio::test]
    async fn test_force_fail_skips_commands() {
        let temp = tempdir().unwrap();
        let result = ScriptChecks::new().with_force_fail(true).run(temp.path()).await;
        assert!(!result.passed());
        assert!(result.summary.starts_with("[SIMULATED FAILURE]"));
        assert_eq!(result.checks, CheckSet::default());
    }

    #[tokio::test]
    async fn test_run_command_pass_fail_and_timeout() {
        let temp = tempdir().unwrap();
        let ok = run_command("echo fine", temp.path(), DEFAULT_TIMEOUT).await;
        assert!(ok.passed);
        assert_eq!(ok.output, "fine");

        let bad = run_command("echo nope >&2; exit 1", temp.path(), DEFAULT_TIMEOUT).await;
        assert!(!bad.passed);
        assert_eq!(bad.output, "nope");

        let slow = run_command("sleep 5", temp.path(), Duration::from_millis(50)).await;
        assert!(!slow.passed);
        assert!(slow.output.contains("timed out"));
    }

    #[tokio::test]
    async fn test_output_is_capped_while_reading() {
        let (kept, dropped) = read_capped(Some(&b"abcdefgh"[..]), 3).await.unwrap();
        assert_eq!(kept, b"abc");
        assert!(dropped);

        let (kept, dropped) = read_capped(Some(&b"abc"[..]), 3).await.unwrap();
        assert_eq!(kept, b"abc");
        assert!(!dropped);

        let temp = tempdir().unwrap();
        let flood = format!("head -c {} /dev/zero | tr '\\0' x", MAX_OUTPUT_BYTES * 2);
        let result = run_command(&flood, temp.path(), DEFAULT_TIMEOUT).await;
        assert!(result.passed);
        assert!(result.output.ends_with(TRUNCATED));
        assert_eq!(result.output.len(), MAX_OUTPUT_BYTES + TRUNCATED.len());
    }

    #[tokio::test]
    async fn test_scripts_drive_which_checks_run() {
        let temp = tempdir().unwrap();
        std::fs::write(
            temp.path().join("package.json"),
            r#"{"scripts": {"typecheck": "true", "lint": "false"}}"#,
        )
        .unwrap();
        // npm may be missing in the test environment; only the shape matters here.
        let result = ScriptChecks::new()
            .with_timeout(Duration::from_secs(30))
            .run(temp.path())
            .await;
        assert!(result.checks.typecheck.is_some());
        assert!(result.checks.build.is_none());
        assert!(result.checks.lint.is_some());
        assert_eq!(result.overall, QaOutcome::Fail);
        assert!(result.details.contains("=== Typecheck ==="));
        assert!(result.details.contains("=== Lint ==="));
    }
}
