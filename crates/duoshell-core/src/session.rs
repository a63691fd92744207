use chrono::{DateTime, Utc};
use log::{info, warn};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use duoshell_logging::SessionTranscript;
use duoshell_terminal::{ShellChannel, ShellConnector};
use duoshell_types::{
    BackgroundTask, ConnectionParams, OutputRecord, SessionInfo, TaskPoll, TerminalError,
    TerminalResult, MAX_TERMINAL_DIMENSION, MIN_TERMINAL_DIMENSION,
};

use crate::background::BackgroundTaskRegistry;
use crate::config::CoreConfig;
use crate::executor::{resolve, QueuedCommand};
use crate::lock;
use crate::nuclear::NuclearController;
use crate::ring_buffer::{CommandRingBuffer, RingEntry};
use crate::state::TerminalStateManager;
use crate::unifier::{OutputUnifier, Subscription};

/// Per-session limits taken from the core configuration
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub ring_capacity: usize,
    pub history_limit: usize,
    pub nuclear_timeout: Duration,
    pub transcript_dir: Option<PathBuf>,
}

impl From<&CoreConfig> for SessionSettings {
    fn from(config: &CoreConfig) -> Self {
        Self {
            ring_capacity: config.ring_buffer_capacity,
            history_limit: config.history_limit,
            nuclear_timeout: config.nuclear_timeout(),
            transcript_dir: config.transcript_dir.clone(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&CoreConfig::default())
    }
}

/// One logical shell session shared by the interactive and programmatic
/// sources.
///
/// The name and connection parameters survive channel replacement; the
/// channel itself is swapped by recovery.
pub struct TerminalSession {
    pub(crate) name: String,
    pub(crate) params: Mutex<ConnectionParams>,
    pub(crate) connector: Arc<dyn ShellConnector>,
    pub(crate) channel: Mutex<Option<Arc<dyn ShellChannel>>>,
    /// Held while the channel is being replaced
    pub(crate) recovery: tokio::sync::Mutex<()>,
    pub(crate) states: Arc<TerminalStateManager>,
    pub(crate) ring: Mutex<CommandRingBuffer>,
    pub(crate) tasks: BackgroundTaskRegistry,
    pub(crate) unifier: Arc<OutputUnifier>,
    pub(crate) nuclear: NuclearController,
    pub(crate) queue: Mutex<VecDeque<QueuedCommand>>,
    pub(crate) wake: Notify,
    pub(crate) generation: AtomicU64,
    pub(crate) healthy: AtomicBool,
    pub(crate) closed: CancellationToken,
    created_at: DateTime<Utc>,
}

impl TerminalSession {
    /// Open the channel, start the worker and announce the prompt
    pub async fn connect(
        name: &str,
        params: ConnectionParams,
        connector: Arc<dyn ShellConnector>,
        states: Arc<TerminalStateManager>,
        settings: &SessionSettings,
    ) -> TerminalResult<Arc<Self>> {
        let channel = connector
            .connect(&params)
            .await
            .map_err(|e| TerminalError::connection(name, &e))?;

        let unifier = Arc::new(OutputUnifier::new(
            name,
            params.prompt(),
            settings.history_limit,
        ));
        if let Some(dir) = &settings.transcript_dir {
            match SessionTranscript::open(name, dir) {
                Ok(transcript) => unifier.attach_transcript(transcript),
                Err(e) => warn!("Session '{}' runs without a transcript: {:#}", name, e),
            }
        }

        let session = Arc::new(Self {
            name: name.to_string(),
            params: Mutex::new(params),
            connector,
            channel: Mutex::new(Some(channel)),
            recovery: tokio::sync::Mutex::new(()),
            states,
            ring: Mutex::new(CommandRingBuffer::new(settings.ring_capacity)),
            tasks: BackgroundTaskRegistry::new(name),
            unifier,
            nuclear: NuclearController::new(settings.nuclear_timeout),
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            generation: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            closed: CancellationToken::new(),
            created_at: Utc::now(),
        });

        tokio::spawn(Arc::clone(&session).run_worker());

        let params = session.params();
        info!(
            "Session '{}' connected to {}@{} via {}",
            name,
            params.user,
            params.host,
            session.connector.backend_name()
        );
        session
            .unifier
            .log_event("connected", &format!("{}@{}", params.user, params.host));
        session.unifier.emit_prompt();

        Ok(session)
    }

    /// Tear the session down: pending submissions are cancelled, listeners
    /// released and the channel destroyed
    pub async fn disconnect(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.nuclear.clear();
        self.healthy.store(false, Ordering::SeqCst);

        let pending: Vec<QueuedCommand> = lock(&self.queue).drain(..).collect();
        for queued in pending {
            resolve(
                &queued.delivery,
                &self.tasks,
                &queued.id,
                Err(TerminalError::Cancelled {
                    session: self.name.clone(),
                    id: queued.id.clone(),
                }),
            );
        }
        self.tasks.cancel_running();

        let channel = lock(&self.channel).take();
        if let Some(channel) = channel {
            if let Err(e) = channel.destroy().await {
                warn!("Session '{}' channel teardown failed: {:#}", self.name, e);
            }
        }
        self.states.remove_session(&self.name);

        self.unifier.log_event("disconnected", "");
        self.unifier.close_listeners();
        info!("Session '{}' disconnected", self.name);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> ConnectionParams {
        lock(&self.params).clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Number of channel replacements so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn current_channel(&self) -> Option<Arc<dyn ShellChannel>> {
        lock(&self.channel).clone()
    }

    pub(crate) fn ensure_open(&self) -> TerminalResult<()> {
        if self.closed.is_cancelled() {
            return Err(TerminalError::SessionNotFound(self.name.clone()));
        }
        Ok(())
    }

    /// Resize the terminal; the size is kept for future channels
    pub async fn resize(&self, cols: u16, rows: u16) -> TerminalResult<()> {
        for (label, value) in [("cols", cols), ("rows", rows)] {
            if !(MIN_TERMINAL_DIMENSION..=MAX_TERMINAL_DIMENSION).contains(&value) {
                return Err(TerminalError::validation(format!(
                    "{} must be between {} and {}, got {}",
                    label, MIN_TERMINAL_DIMENSION, MAX_TERMINAL_DIMENSION, value
                )));
            }
        }
        self.ensure_open()?;

        let channel = self
            .current_channel()
            .ok_or_else(|| TerminalError::SessionUnhealthy(self.name.clone()))?;
        channel
            .resize(cols, rows)
            .await
            .map_err(|e| TerminalError::resize(&self.name, &e))?;

        {
            let mut params = lock(&self.params);
            params.cols = cols;
            params.rows = rows;
        }
        self.unifier.log_resize(cols, rows);
        Ok(())
    }

    pub fn subscribe(&self) -> Subscription {
        self.unifier.subscribe()
    }

    pub fn history(&self) -> Vec<Arc<OutputRecord>> {
        self.unifier.history()
    }

    /// Snapshot of the command ring buffer, oldest first
    pub fn ring_entries(&self) -> Vec<RingEntry> {
        lock(&self.ring).entries()
    }

    pub fn poll_task(&self, task_id: &str) -> TaskPoll {
        self.tasks.poll(task_id)
    }

    pub fn get_task(&self, task_id: &str) -> TerminalResult<BackgroundTask> {
        self.tasks.get(task_id)
    }

    pub fn list_tasks(&self) -> Vec<BackgroundTask> {
        self.tasks.list()
    }

    pub fn remove_task(&self, task_id: &str) -> TerminalResult<BackgroundTask> {
        self.tasks.remove(task_id)
    }

    pub fn has_active_nuclear_timeout(&self) -> bool {
        self.nuclear.is_active()
    }

    pub fn has_triggered_nuclear_fallback(&self) -> bool {
        self.nuclear.has_triggered()
    }

    pub fn nuclear_timeout_duration(&self) -> Duration {
        self.nuclear.duration()
    }

    pub fn set_nuclear_timeout_duration(&self, duration: Duration) -> TerminalResult<()> {
        self.nuclear.set_duration(duration)
    }

    pub fn clear_nuclear_timeout(&self) -> bool {
        self.nuclear.clear()
    }

    pub fn info(&self) -> SessionInfo {
        let params = self.params();
        SessionInfo {
            name: self.name.clone(),
            host: params.host,
            user: params.user,
            state: self.states.state(&self.name),
            active_command: self.states.active_command(&self.name),
            queued_commands: lock(&self.queue).len(),
            healthy: self.is_healthy(),
            generation: self.generation(),
            nuclear_timeout_active: self.nuclear.is_active(),
            nuclear_fallback_triggered: self.nuclear.has_triggered(),
            listeners: self.unifier.listener_count(),
            history_len: self.unifier.history_len(),
            background_tasks: self.tasks.len(),
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duoshell_terminal::{Script, ScriptedConnector};
    use duoshell_types::{CommandSource, ExecutionState, RecordSource};
    use pretty_assertions::assert_eq;

    use crate::executor::SubmitOptions;

    async fn open(connector: Arc<ScriptedConnector>) -> Arc<TerminalSession> {
        TerminalSession::connect(
            "dev",
            ConnectionParams::new("box", "alice"),
            connector,
            Arc::new(TerminalStateManager::new()),
            &SessionSettings::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_connect_emits_single_prompt() {
        let session = open(Arc::new(ScriptedConnector::new(Script::new()))).await;
        let history = session.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].source, RecordSource::System);
        assert_eq!(history[0].payload, "alice@box:~$ ");

        let info = session.info();
        assert_eq!(info.state, ExecutionState::WaitingForCommand);
        assert!(info.healthy);
        assert_eq!(info.generation, 0);
    }

    #[tokio::test]
    async fn test_failed_connect_is_a_connection_error() {
        let connector = Arc::new(ScriptedConnector::new(Script::new()));
        connector.fail_next_connects(1);
        let err = TerminalSession::connect(
            "dev",
            ConnectionParams::new("box", "alice"),
            connector,
            Arc::new(TerminalStateManager::new()),
            &SessionSettings::default(),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.code(), "connection");
    }

    #[tokio::test]
    async fn test_resize_validates_and_remembers_size() {
        let connector = Arc::new(ScriptedConnector::new(Script::new()));
        let session = open(Arc::clone(&connector)).await;

        assert_eq!(session.resize(0, 24).await.unwrap_err().code(), "validation");
        assert_eq!(session.resize(80, 1001).await.unwrap_err().code(), "validation");

        session.resize(120, 40).await.unwrap();
        assert_eq!(connector.latest().unwrap().size(), (120, 40));
        assert_eq!(session.params().cols, 120);

        connector.latest().unwrap().set_reject_resize(true);
        assert_eq!(session.resize(100, 30).await.unwrap_err().code(), "resize");
        assert_eq!(session.params().cols, 120);
    }

    #[tokio::test]
    async fn test_disconnect_rejects_further_work() {
        let connector = Arc::new(ScriptedConnector::new(Script::new()));
        let session = open(Arc::clone(&connector)).await;
        session.disconnect().await;

        assert!(session.is_closed());
        assert!(!connector.latest().unwrap().is_open());
        let err = session
            .submit("ls", CommandSource::Interactive, "c1", SubmitOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "session_not_found");
    }
}
