//! Configuration management.
//!
//! All settings come from environment variables with sensible defaults:
//! - `CODE_AUTOMATA_PROJECT_DIR` - Project root (default: current directory)
//! - `CODE_AUTOMATA_HOST` / `CODE_AUTOMATA_PORT` - HTTP bind address (default: 127.0.0.1:3030)
//! - `CODE_AUTOMATA_SUBTASK_WAIT_MS` - Max wait for one subtask (default: 30 minutes)
//! - `CODE_AUTOMATA_POLL_INTERVAL_MS` - Fallback re-check interval while waiting (default: 1000)
//! - `CODE_AUTOMATA_AGENT_CMD` - Shell command that runs an agent (default: `claude -p`)
//! - `CODE_AUTOMATA_QA_FORCE_FAIL` - `1` to simulate failing automated checks
//! - `CODE_AUTOMATA_CHECK_TIMEOUT_SECS` - Timeout per check command (default: 300)
//!
//! The rework cap, the parse-retry cap and the lock staleness threshold are
//! fixed and live next to the code that enforces them.

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SUBTASK_WAIT: Duration = Duration::from_secs(30 * 60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);
const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct Config {
    /// Project root: holds `.code-automata/` and is the default working tree
    pub project_dir: PathBuf,
    pub host: String,
    pub port: u16,
    /// How long to wait for a single subtask before giving up on it
    pub subtask_wait: Duration,
    /// Fallback interval for re-reading task state while waiting
    pub poll_interval: Duration,
    /// Shell command used by the process-backed agent gateway
    pub agent_command: String,
    pub qa_force_fail: bool,
    pub check_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            host: "127.0.0.1".to_string(),
            port: 3030,
            subtask_wait: DEFAULT_SUBTASK_WAIT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            agent_command: "claude -p".to_string(),
            qa_force_fail: false,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }
}

/// Parse a positive millisecond count. Zero, negative and garbage are ignored.
fn positive_millis(value: Option<String>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let project_dir = match std::env::var("CODE_AUTOMATA_PROJECT_DIR") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => std::env::current_dir()?,
        };

        let port = match std::env::var("CODE_AUTOMATA_PORT") {
            Ok(port) => port
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid CODE_AUTOMATA_PORT '{}': {}", port, e))?,
            Err(_) => defaults.port,
        };

        let check_timeout = std::env::var("CODE_AUTOMATA_CHECK_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.check_timeout);

        Ok(Self {
            project_dir,
            host: std::env::var("CODE_AUTOMATA_HOST").unwrap_or(defaults.host),
            port,
            subtask_wait: positive_millis(std::env::var("CODE_AUTOMATA_SUBTASK_WAIT_MS").ok())
                .unwrap_or(defaults.subtask_wait),
            poll_interval: positive_millis(std::env::var("CODE_AUTOMATA_POLL_INTERVAL_MS").ok())
                .unwrap_or(defaults.poll_interval),
            agent_command: std::env::var("CODE_AUTOMATA_AGENT_CMD")
                .ok()
                .filter(|c| !c.trim().is_empty())
                .unwrap_or(defaults.agent_command),
            qa_force_fail: std::env::var("CODE_AUTOMATA_QA_FORCE_FAIL")
                .map(|v| v == "1")
                .unwrap_or(false),
            check_timeout,
        })
    }

    /// Config rooted at `project_dir` with every other field defaulted.
    pub fn for_project(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            ..Self::default()
        }
    }
}
