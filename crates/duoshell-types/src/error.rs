use thiserror::Error;

use crate::CommandSource;

/// Errors surfaced by the session coordination core.
///
/// Adapter failures arrive as `anyhow::Error` and are flattened into the
/// message of the matching variant so the error stays `Clone` and can be
/// stored on background tasks and ring buffer entries.
#[derive(Debug, Clone, Error)]
pub enum TerminalError {
    #[error("invalid parameter: {0}")]
    Validation(String),

    #[error("session '{session}' is busy executing '{command}' (id {id}, source {origin})")]
    SessionBusy {
        session: String,
        command: String,
        id: String,
        origin: CommandSource,
    },

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("task '{task_id}' not found in session '{session}'")]
    TaskNotFound { session: String, task_id: String },

    #[error("unsupported signal '{0}'")]
    UnsupportedSignal(String),

    #[error("no active programmatic command in session '{0}'")]
    NoActiveProgrammaticCommand(String),

    #[error("command '{id}' failed in session '{session}': {message}")]
    Execution {
        session: String,
        id: String,
        message: String,
    },

    #[error("failed to connect session '{session}': {message}")]
    Connection { session: String, message: String },

    #[error("failed to re-establish session '{session}': {message}")]
    Reestablishment { session: String, message: String },

    #[error("failed to resize session '{session}': {message}")]
    Resize { session: String, message: String },

    #[error("command '{id}' in session '{session}' was cancelled")]
    Cancelled { session: String, id: String },

    #[error("session '{0}' is unhealthy; reconnect before submitting commands")]
    SessionUnhealthy(String),
}

impl TerminalError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn execution(session: &str, id: &str, error: &anyhow::Error) -> Self {
        Self::Execution {
            session: session.to_string(),
            id: id.to_string(),
            message: format!("{:#}", error),
        }
    }

    pub fn connection(session: &str, error: &anyhow::Error) -> Self {
        Self::Connection {
            session: session.to_string(),
            message: format!("{:#}", error),
        }
    }

    pub fn reestablishment(session: &str, error: &anyhow::Error) -> Self {
        Self::Reestablishment {
            session: session.to_string(),
            message: format!("{:#}", error),
        }
    }

    pub fn resize(session: &str, error: &anyhow::Error) -> Self {
        Self::Resize {
            session: session.to_string(),
            message: format!("{:#}", error),
        }
    }

    /// Stable machine-readable code for transport layers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::SessionBusy { .. } => "session_busy",
            Self::SessionNotFound(_) => "session_not_found",
            Self::TaskNotFound { .. } => "task_not_found",
            Self::UnsupportedSignal(_) => "unsupported_signal",
            Self::NoActiveProgrammaticCommand(_) => "no_active_programmatic_command",
            Self::Execution { .. } => "execution",
            Self::Connection { .. } => "connection",
            Self::Reestablishment { .. } => "reestablishment",
            Self::Resize { .. } => "resize",
            Self::Cancelled { .. } => "cancelled",
            Self::SessionUnhealthy(_) => "session_unhealthy",
        }
    }
}

pub type TerminalResult<T> = std::result::Result<T, TerminalError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_busy_error_names_blocking_command() {
        let err = TerminalError::SessionBusy {
            session: "prod".to_string(),
            command: "sleep 10".to_string(),
            id: "c1".to_string(),
            origin: CommandSource::Programmatic,
        };
        let text = err.to_string();
        assert!(text.contains("sleep 10"));
        assert!(text.contains("c1"));
        assert!(text.contains("programmatic"));
        assert_eq!(err.code(), "session_busy");
    }

    #[test]
    fn test_execution_error_keeps_context_chain() {
        let inner: anyhow::Result<()> = Err(anyhow::anyhow!("broken pipe"));
        let err = inner.context("Failed to write to PTY").unwrap_err();
        let mapped = TerminalError::execution("prod", "c7", &err);
        let text = mapped.to_string();
        assert!(text.contains("Failed to write to PTY"));
        assert!(text.contains("broken pipe"));
    }
}
