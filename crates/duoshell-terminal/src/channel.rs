/// Shell channel abstraction shared by the PTY and scripted backends
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use duoshell_types::ConnectionParams;

/// Event emitted while a command runs on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Output bytes
    Data(Vec<u8>),
    /// The command finished; this is the completion side channel
    Exit(Option<i32>),
    /// The channel reported an error while the command was running
    Error(String),
}

/// Per-command event stream. The sender side is dropped after `Exit`; a stream
/// that ends without `Exit` means the channel closed underneath the command.
pub type CommandStream = mpsc::UnboundedReceiver<ChannelEvent>;

/// One live duplex channel to a command interpreter.
///
/// A channel runs at most one command at a time; callers serialize. `write`
/// delivers raw bytes (control characters included) to the interpreter and
/// whatever it is running, also between commands.
#[async_trait]
pub trait ShellChannel: Send + Sync {
    /// Start a command and return its event stream
    async fn exec(&self, command: &str) -> Result<CommandStream>;

    /// Write raw bytes to the interpreter
    async fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Resize the terminal (cols, rows)
    async fn resize(&self, cols: u16, rows: u16) -> Result<()>;

    /// Forcibly tear the channel down; any running command's stream ends
    async fn destroy(&self) -> Result<()>;

    /// Whether the channel still accepts commands
    fn is_open(&self) -> bool;

    /// Get backend name for debugging
    fn backend_name(&self) -> &str;
}

/// Establishes channels from connection parameters
#[async_trait]
pub trait ShellConnector: Send + Sync {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn ShellChannel>>;

    fn backend_name(&self) -> &str;
}

/// Configuration for which backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelBackendType {
    /// PTY-backed channel: local shell or the system ssh client (default)
    Pty,
    /// In-memory scripted shell
    Scripted,
}

impl Default for ChannelBackendType {
    fn default() -> Self {
        Self::Pty
    }
}

impl std::str::FromStr for ChannelBackendType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pty" | "ssh" => Ok(Self::Pty),
            "scripted" | "memory" => Ok(Self::Scripted),
            _ => Err(anyhow::anyhow!(
                "Invalid channel backend: '{}'. Valid options: 'pty', 'scripted'",
                s
            )),
        }
    }
}

impl std::fmt::Display for ChannelBackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pty => write!(f, "pty"),
            Self::Scripted => write!(f, "scripted"),
        }
    }
}
