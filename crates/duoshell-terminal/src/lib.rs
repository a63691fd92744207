// Shell channel adapters
//
// This crate is the seam between the session coordination core and whatever
// actually carries bytes to a command interpreter: a long-lived shell in a
// local PTY (directly or behind the system ssh client), or an in-memory
// scripted shell for tests.

pub mod channel;
mod pty_handler;
mod pty_channel;
pub mod scripted;

use std::sync::Arc;

// Re-export public API
pub use channel::{
    ChannelBackendType, ChannelEvent, CommandStream, ShellChannel, ShellConnector,
};
pub use pty_channel::{PtyChannel, PtyConnector};
pub use scripted::{Script, ScriptedChannel, ScriptedConnector, ScriptedReply};

// Constants
pub const READ_BUFFER_SIZE: usize = 4096;
pub const EXIT_DRAIN_TIMEOUT_MS: u64 = 500;
pub const SHELL_READY_TIMEOUT_SECS: u64 = 10;
pub const SSH_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Build the connector for a configured backend
pub fn connector_for(
    backend: ChannelBackendType,
    shell: Option<String>,
) -> Arc<dyn ShellConnector> {
    match backend {
        ChannelBackendType::Pty => Arc::new(PtyConnector::new(shell)),
        ChannelBackendType::Scripted => Arc::new(ScriptedConnector::new(Script::default())),
    }
}
