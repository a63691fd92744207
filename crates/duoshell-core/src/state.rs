use chrono::Utc;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Mutex;

use duoshell_types::{ActiveCommand, CommandSource, ExecutionState, TerminalError, TerminalResult};

use crate::lock;

#[derive(Debug, Default)]
struct SessionState {
    active: Option<ActiveCommand>,
}

impl SessionState {
    fn state(&self) -> ExecutionState {
        if self.active.is_some() {
            ExecutionState::ExecutingCommand
        } else {
            ExecutionState::WaitingForCommand
        }
    }
}

/// Single-flight state machine for every session.
///
/// Each session is either waiting for a command or executing exactly one.
/// Sessions are tracked lazily: an unknown session is idle.
#[derive(Debug, Default)]
pub struct TerminalStateManager {
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl TerminalStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_accept_command(&self, session: &str) -> bool {
        lock(&self.sessions)
            .get(session)
            .map_or(true, |s| s.active.is_none())
    }

    pub fn state(&self, session: &str) -> ExecutionState {
        lock(&self.sessions)
            .get(session)
            .map_or(ExecutionState::WaitingForCommand, SessionState::state)
    }

    /// Snapshot of the executing command, if any
    pub fn active_command(&self, session: &str) -> Option<ActiveCommand> {
        lock(&self.sessions)
            .get(session)
            .and_then(|s| s.active.clone())
    }

    /// Move a session into `ExecutingCommand`.
    ///
    /// Fails with `SessionBusy` naming the command already running.
    pub fn start_command_execution(
        &self,
        session: &str,
        command: &str,
        id: &str,
        source: CommandSource,
    ) -> TerminalResult<()> {
        let mut sessions = lock(&self.sessions);
        let state = sessions.entry(session.to_string()).or_default();

        if let Some(active) = &state.active {
            return Err(TerminalError::SessionBusy {
                session: session.to_string(),
                command: active.command.clone(),
                id: active.id.clone(),
                origin: active.source,
            });
        }

        state.active = Some(ActiveCommand {
            command: command.to_string(),
            id: id.to_string(),
            source,
            started_at: Utc::now(),
        });
        debug!("Session '{}' executing {} command {}", session, source, id);
        Ok(())
    }

    /// Return a session to `WaitingForCommand`
    pub fn complete_command_execution(&self, session: &str, id: &str) {
        let mut sessions = lock(&self.sessions);
        let Some(state) = sessions.get_mut(session) else {
            return;
        };

        match state.active.take() {
            Some(active) if active.id != id => {
                warn!(
                    "Session '{}' completed command {} but {} was active; resetting anyway",
                    session, id, active.id
                );
            }
            Some(_) => {}
            None => debug!("Session '{}' was already idle when {} completed", session, id),
        }
    }

    /// Unconditionally return a session to `WaitingForCommand`
    pub fn force_reset_session(&self, session: &str) {
        if let Some(state) = lock(&self.sessions).get_mut(session) {
            if let Some(active) = state.active.take() {
                warn!("Session '{}' force-reset while executing {}", session, active.id);
            }
        }
    }

    pub fn remove_session(&self, session: &str) {
        lock(&self.sessions).remove(session);
    }
}
