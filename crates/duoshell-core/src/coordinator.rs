use anyhow::Result;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

use duoshell_terminal::{connector_for, ShellConnector};
use duoshell_types::{
    BackgroundTask, CommandSource, ConnectionParams, OutputRecord, SessionInfo, SubmitOutcome,
    TaskPoll, TerminalError, TerminalResult, MAX_TERMINAL_DIMENSION, MIN_TERMINAL_DIMENSION,
};

use crate::config::CoreConfig;
use crate::executor::SubmitOptions;
use crate::session::{SessionSettings, TerminalSession};
use crate::signal::Signal;
use crate::store::SessionStore;
use crate::unifier::Subscription;

/// Entry point for transport layers: every session operation, by name
pub struct TerminalCoordinator {
    config: CoreConfig,
    settings: SessionSettings,
    connector: Arc<dyn ShellConnector>,
    store: SessionStore,
}

impl std::fmt::Debug for TerminalCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalCoordinator")
            .field("backend", &self.connector.backend_name())
            .field("config", &self.config)
            .finish()
    }
}

impl TerminalCoordinator {
    /// Build a coordinator using the backend named in the configuration
    pub fn new(config: CoreConfig) -> Result<Self> {
        config.validate()?;
        let connector = connector_for(config.backend_type()?, config.shell.clone());
        Ok(Self::with_connector(config, connector))
    }

    pub fn with_connector(config: CoreConfig, connector: Arc<dyn ShellConnector>) -> Self {
        info!("Shell backend: {}", connector.backend_name());
        Self {
            settings: SessionSettings::from(&config),
            config,
            connector,
            store: SessionStore::new(),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Connection parameters with the configured default terminal size
    pub fn default_params(&self, host: &str, user: &str) -> ConnectionParams {
        ConnectionParams::new(host, user).with_size(self.config.default_cols, self.config.default_rows)
    }

    /// Create a session, or return the existing one with this name
    pub async fn connect(&self, name: &str, params: ConnectionParams) -> TerminalResult<SessionInfo> {
        if name.trim().is_empty() {
            return Err(TerminalError::validation("session name must not be empty"));
        }
        if params.user.trim().is_empty() {
            return Err(TerminalError::validation("user must not be empty"));
        }
        for value in [params.cols, params.rows] {
            if !(MIN_TERMINAL_DIMENSION..=MAX_TERMINAL_DIMENSION).contains(&value) {
                return Err(TerminalError::validation(format!(
                    "terminal size {}x{} out of range",
                    params.cols, params.rows
                )));
            }
        }

        if let Ok(existing) = self.store.get(name).await {
            debug!("Session '{}' already connected", name);
            return Ok(existing.info());
        }

        let session = TerminalSession::connect(
            name,
            params,
            Arc::clone(&self.connector),
            self.store.states(),
            &self.settings,
        )
        .await?;

        let (stored, inserted) = self.store.insert_if_absent(Arc::clone(&session)).await;
        if !inserted {
            // Lost a concurrent connect race; keep the first session
            session.disconnect().await;
        }
        Ok(stored.info())
    }

    pub async fn disconnect(&self, name: &str) -> TerminalResult<()> {
        let session = self
            .store
            .remove(name)
            .await
            .ok_or_else(|| TerminalError::SessionNotFound(name.to_string()))?;
        session.disconnect().await;
        Ok(())
    }

    pub async fn reconnect(&self, name: &str) -> TerminalResult<SessionInfo> {
        let session = self.store.get(name).await?;
        session.reconnect().await?;
        Ok(session.info())
    }

    /// Submit with an optional wait budget, queueing behind a busy session
    pub async fn submit(
        &self,
        name: &str,
        command: &str,
        source: CommandSource,
        id: &str,
        wait_budget: Option<Duration>,
    ) -> TerminalResult<SubmitOutcome> {
        let options = SubmitOptions {
            wait_budget,
            ..SubmitOptions::default()
        };
        self.submit_with(name, command, source, id, options).await
    }

    pub async fn submit_with(
        &self,
        name: &str,
        command: &str,
        source: CommandSource,
        id: &str,
        options: SubmitOptions,
    ) -> TerminalResult<SubmitOutcome> {
        let session = self.store.get(name).await?;
        session.submit(command, source, id, options).await
    }

    pub async fn deliver_signal(&self, name: &str, signal: &str) -> TerminalResult<Signal> {
        let session = self.store.get(name).await?;
        session.deliver_signal(signal).await
    }

    pub async fn cancel_programmatic(&self, name: &str) -> TerminalResult<usize> {
        let session = self.store.get(name).await?;
        session.cancel_programmatic().await
    }

    /// An unknown session polls as `NotFound`, like an unknown task
    pub async fn poll_task(&self, name: &str, task_id: &str) -> TaskPoll {
        match self.store.get(name).await {
            Ok(session) => session.poll_task(task_id),
            Err(_) => TaskPoll::NotFound,
        }
    }

    pub async fn get_task(&self, name: &str, task_id: &str) -> TerminalResult<BackgroundTask> {
        self.store.get(name).await?.get_task(task_id)
    }

    pub async fn list_tasks(&self, name: &str) -> TerminalResult<Vec<BackgroundTask>> {
        Ok(self.store.get(name).await?.list_tasks())
    }

    pub async fn remove_task(&self, name: &str, task_id: &str) -> TerminalResult<BackgroundTask> {
        self.store.get(name).await?.remove_task(task_id)
    }

    /// Live output with full history replay
    pub async fn subscribe(&self, name: &str) -> TerminalResult<Subscription> {
        Ok(self.store.get(name).await?.subscribe())
    }

    pub async fn get_history(&self, name: &str) -> TerminalResult<Vec<Arc<OutputRecord>>> {
        Ok(self.store.get(name).await?.history())
    }

    pub async fn resize(&self, name: &str, cols: u16, rows: u16) -> TerminalResult<()> {
        self.store.get(name).await?.resize(cols, rows).await
    }

    pub async fn session_info(&self, name: &str) -> TerminalResult<SessionInfo> {
        Ok(self.store.get(name).await?.info())
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.store
            .list()
            .await
            .iter()
            .map(|session| session.info())
            .collect()
    }

    pub async fn has_active_nuclear_timeout(&self, name: &str) -> TerminalResult<bool> {
        Ok(self.store.get(name).await?.has_active_nuclear_timeout())
    }

    pub async fn has_triggered_nuclear_fallback(&self, name: &str) -> TerminalResult<bool> {
        Ok(self.store.get(name).await?.has_triggered_nuclear_fallback())
    }

    pub async fn nuclear_timeout_duration(&self, name: &str) -> TerminalResult<Duration> {
        Ok(self.store.get(name).await?.nuclear_timeout_duration())
    }

    pub async fn set_nuclear_timeout_duration(
        &self,
        name: &str,
        duration: Duration,
    ) -> TerminalResult<()> {
        self.store
            .get(name)
            .await?
            .set_nuclear_timeout_duration(duration)
    }

    /// Returns whether a timeout was armed
    pub async fn clear_nuclear_timeout(&self, name: &str) -> TerminalResult<bool> {
        Ok(self.store.get(name).await?.clear_nuclear_timeout())
    }

    /// Disconnect every session
    pub async fn shutdown(&self) {
        for session in self.store.list().await {
            self.store.remove(session.name()).await;
            session.disconnect().await;
        }
    }
}
