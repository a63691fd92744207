//! Core types and structures for duoshell
//!
//! This crate provides the foundational types shared by the terminal adapters
//! and the session coordination core.

mod error;

pub use error::{TerminalError, TerminalResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of entries kept in a session's command ring buffer
pub const MAX_RING_BUFFER_ENTRIES: usize = 500;

/// Default nuclear fallback window
pub const DEFAULT_NUCLEAR_TIMEOUT_MS: u64 = 30_000;

/// Default number of output records retained per session
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

pub const MIN_TERMINAL_DIMENSION: u16 = 1;
pub const MAX_TERMINAL_DIMENSION: u16 = 1000;

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

// ============================================================================
// Command Sources
// ============================================================================

/// Which caller category issued a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSource {
    /// Human operator driving the live terminal UI
    Interactive,
    /// Automated tool-calling agent
    Programmatic,
}

impl CommandSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandSource::Interactive => "interactive",
            CommandSource::Programmatic => "programmatic",
        }
    }
}

impl std::fmt::Display for CommandSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CommandSource {
    type Err = TerminalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interactive" => Ok(CommandSource::Interactive),
            "programmatic" => Ok(CommandSource::Programmatic),
            other => Err(TerminalError::validation(format!(
                "unknown command source '{}'; expected 'interactive' or 'programmatic'",
                other
            ))),
        }
    }
}

// ============================================================================
// Command Execution Types
// ============================================================================

/// The single command a session is currently executing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveCommand {
    pub command: String,
    pub id: String,
    pub source: CommandSource,
    pub started_at: DateTime<Utc>,
}

/// Outcome of a command that ran to completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub id: String,
    pub command: String,
    pub source: CommandSource,
    /// Raw command output, lossily decoded
    pub output: String,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Sequence number of the output record this command produced
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub record_seq: Option<u64>,
}

impl CommandResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn duration_ms(&self) -> i64 {
        self.finished_at
            .signed_duration_since(self.started_at)
            .num_milliseconds()
    }
}

/// What a submitter gets back
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Completed(CommandResult),
    /// The wait budget expired; the command keeps running as a background task
    Pending { task_id: String },
}

impl SubmitOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, SubmitOutcome::Pending { .. })
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            SubmitOutcome::Pending { task_id } => Some(task_id),
            SubmitOutcome::Completed(_) => None,
        }
    }

    pub fn into_result(self) -> Option<CommandResult> {
        match self {
            SubmitOutcome::Completed(result) => Some(result),
            SubmitOutcome::Pending { .. } => None,
        }
    }
}

/// Single-flight state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    WaitingForCommand,
    ExecutingCommand,
}

// ============================================================================
// Background Tasks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackgroundTaskState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BackgroundTaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BackgroundTaskState::Running)
    }
}

/// A command whose caller stopped waiting before it finished
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundTask {
    pub id: String,
    pub command: String,
    pub source: CommandSource,
    pub state: BackgroundTaskState,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<CommandResult>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// Result of polling a background task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", content = "task", rename_all = "snake_case")]
pub enum TaskPoll {
    NotFound,
    Running(BackgroundTask),
    Settled(BackgroundTask),
}

impl TaskPoll {
    pub fn task(&self) -> Option<&BackgroundTask> {
        match self {
            TaskPoll::NotFound => None,
            TaskPoll::Running(task) | TaskPoll::Settled(task) => Some(task),
        }
    }
}

// ============================================================================
// Output Records
// ============================================================================

/// Attribution of an output record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    Interactive,
    Programmatic,
    /// Prompts and recovery notices synthesized by the session itself
    System,
}

impl From<CommandSource> for RecordSource {
    fn from(source: CommandSource) -> Self {
        match source {
            CommandSource::Interactive => RecordSource::Interactive,
            CommandSource::Programmatic => RecordSource::Programmatic,
        }
    }
}

/// One formatted unit of terminal output, shared by live delivery and history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub seq: u64,
    pub session: String,
    pub source: RecordSource,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub command_id: Option<String>,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Connection Parameters
// ============================================================================

/// Everything needed to (re-)establish a session's shell channel.
///
/// Only connection configuration lives here, never transient command state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub port: Option<u16>,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub key_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub working_dir: Option<String>,
    pub cols: u16,
    pub rows: u16,
}

impl ConnectionParams {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            user: user.into(),
            key_path: None,
            working_dir: None,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }

    /// Parameters for a shell on this machine
    pub fn local(user: impl Into<String>) -> Self {
        Self::new("localhost", user)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    pub fn is_local(&self) -> bool {
        matches!(self.host.as_str(), "" | "localhost" | "127.0.0.1" | "::1")
    }

    /// The ready-for-input prompt shown to observers
    pub fn prompt(&self) -> String {
        format!("{}@{}:~$", self.user, self.host)
    }
}

// ============================================================================
// Session Info
// ============================================================================

/// Snapshot of a session for transport layers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: String,
    pub host: String,
    pub user: String,
    pub state: ExecutionState,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub active_command: Option<ActiveCommand>,
    pub queued_commands: usize,
    pub healthy: bool,
    pub generation: u64,
    pub nuclear_timeout_active: bool,
    pub nuclear_fallback_triggered: bool,
    pub listeners: usize,
    pub history_len: usize,
    pub background_tasks: usize,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_command_source_parsing() {
        assert_eq!(
            "interactive".parse::<CommandSource>().unwrap(),
            CommandSource::Interactive
        );
        assert_eq!(
            "programmatic".parse::<CommandSource>().unwrap(),
            CommandSource::Programmatic
        );
        let err = "browser".parse::<CommandSource>().unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn test_prompt_uses_user_and_host() {
        let params = ConnectionParams::new("db01", "deploy");
        assert_eq!(params.prompt(), "deploy@db01:~$");
        assert!(!params.is_local());
        assert!(ConnectionParams::local("me").is_local());
    }

    #[test]
    fn test_task_poll_serializes_with_status_tag() {
        let poll = TaskPoll::NotFound;
        let json = serde_json::to_value(&poll).unwrap();
        assert_eq!(json["status"], "not_found");

        let task = BackgroundTask {
            id: "t1".to_string(),
            command: "make".to_string(),
            source: CommandSource::Programmatic,
            state: BackgroundTaskState::Running,
            started_at: Utc::now(),
            finished_at: None,
            result: None,
            error: None,
        };
        let json = serde_json::to_value(TaskPoll::Running(task)).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["task"]["state"], "RUNNING");
    }

    #[test]
    fn test_terminal_states() {
        assert!(!BackgroundTaskState::Running.is_terminal());
        assert!(BackgroundTaskState::Completed.is_terminal());
        assert!(BackgroundTaskState::Failed.is_terminal());
        assert!(BackgroundTaskState::Cancelled.is_terminal());
    }
}
