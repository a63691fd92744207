//! Source-scoped cancellation and the nuclear fallback.
//!
//! An interrupt is only a request; if the session does not complete a command
//! within the nuclear window, its channel is destroyed and re-established
//! from the original connection parameters under the same session name.

use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use duoshell_types::{CommandSource, TerminalError, TerminalResult};

use crate::executor::{resolve, QueuedCommand};
use crate::lock;
use crate::session::TerminalSession;
use crate::signal::Signal;

const RECOVERY_NOTICE: &str =
    "\r\n[duoshell] session stopped responding and was reconnected\r\n";

impl TerminalSession {
    /// Write a control signal to the running command.
    ///
    /// An interrupt also forgets interactive ring entries and arms the nuclear
    /// timeout unless one is already active.
    pub async fn deliver_signal(self: &Arc<Self>, name: &str) -> TerminalResult<Signal> {
        let signal: Signal = name.parse()?;
        self.ensure_open()?;

        if signal == Signal::Interrupt {
            let evicted = lock(&self.ring).remove_source(CommandSource::Interactive);
            if evicted > 0 {
                debug!("Session '{}' dropped {} interactive ring entries", self.name, evicted);
            }
            self.arm_nuclear();
        }

        self.write_control(signal.byte()).await?;
        self.unifier.log_event("signal", signal.as_str());
        info!("Session '{}' received {}", self.name, signal);
        Ok(signal)
    }

    /// Cancel everything the programmatic source has pending.
    ///
    /// Returns the number of ring entries removed. Interactive work is never
    /// touched.
    pub async fn cancel_programmatic(self: &Arc<Self>) -> TerminalResult<usize> {
        self.ensure_open()?;

        let (removed, cancelled) = {
            let mut queue = lock(&self.queue);
            let mut ring = lock(&self.ring);
            let removed = ring.remove_pending(CommandSource::Programmatic);
            if removed.is_empty() {
                return Err(TerminalError::NoActiveProgrammaticCommand(self.name.clone()));
            }
            let (cancelled, kept): (VecDeque<QueuedCommand>, VecDeque<QueuedCommand>) = queue
                .drain(..)
                .partition(|q| q.source == CommandSource::Programmatic);
            *queue = kept;
            (removed.len(), cancelled)
        };

        for queued in cancelled {
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

        if let Some(active) = self
            .states
            .active_command(&self.name)
            .filter(|a| a.source == CommandSource::Programmatic)
        {
            self.tasks.cancel(&active.id);
            self.arm_nuclear();
            self.write_control(Signal::Interrupt.byte()).await?;
        }

        info!(
            "Session '{}' cancelled {} programmatic command(s)",
            self.name, removed
        );
        Ok(removed)
    }

    /// Replace the channel on request; also the way out of an unhealthy state
    pub async fn reconnect(self: &Arc<Self>) -> TerminalResult<()> {
        self.ensure_open()?;
        let _recovery = self.recovery.lock().await;

        self.nuclear.clear();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cancel_interrupted_task();

        self.reestablish().await?;
        self.unifier.log_event("reconnected", "");
        self.unifier.emit_prompt();
        info!("Session '{}' reconnected", self.name);
        Ok(())
    }

    async fn write_control(&self, byte: u8) -> TerminalResult<()> {
        let channel = self
            .current_channel()
            .ok_or_else(|| TerminalError::SessionUnhealthy(self.name.clone()))?;
        channel.write(&[byte]).await.map_err(|e| {
            let id = self
                .states
                .active_command(&self.name)
                .map(|a| a.id)
                .unwrap_or_else(|| "-".to_string());
            TerminalError::execution(&self.name, &id, &e)
        })
    }

    /// Arm the nuclear timeout unless one is already active
    pub(crate) fn arm_nuclear(self: &Arc<Self>) {
        let Some(armed) = self.nuclear.arm() else {
            return;
        };
        let session = Arc::downgrade(self);

        tokio::spawn(async move {
            tokio::select! {
                _ = armed.token.cancelled() => {}
                _ = tokio::time::sleep(armed.duration) => {
                    if let Some(session) = session.upgrade() {
                        session.nuclear_fallback(armed.id).await;
                    }
                }
            }
        });
    }

    async fn nuclear_fallback(&self, timeout_id: u64) {
        let _recovery = self.recovery.lock().await;
        if self.closed.is_cancelled() || !self.nuclear.begin_fire(timeout_id) {
            return;
        }

        warn!(
            "Session '{}' did not recover within {:?}; replacing its channel",
            self.name,
            self.nuclear.duration()
        );
        // Bump first so the interrupted command reports why it died, and cancel
        // before teardown so its late failure is ignored
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cancel_interrupted_task();

        match self.reestablish().await {
            Ok(()) => {
                info!(
                    "Session '{}' re-established (generation {})",
                    self.name,
                    self.generation()
                );
                self.unifier.log_event("nuclear_fallback", "channel re-established");
                self.unifier.emit_system(RECOVERY_NOTICE);
                self.unifier.emit_prompt();
            }
            Err(e) => {
                error!("{}", e);
                self.unifier.log_event("nuclear_fallback_failed", &e.to_string());
            }
        }
    }

    /// Cancel the task of the command caught executing by a teardown. Queued
    /// commands keep their tasks and run on the replacement channel.
    fn cancel_interrupted_task(&self) {
        if let Some(active) = self.states.active_command(&self.name) {
            if self.tasks.cancel(&active.id) {
                debug!("Session '{}' cancelled background task {}", self.name, active.id);
            }
        }
    }

    /// Destroy the current channel and connect a new one from the stored
    /// parameters. A failure leaves the session unhealthy.
    async fn reestablish(&self) -> TerminalResult<()> {
        // Reset before teardown: the worker may start the next queued command
        // as soon as the old stream ends
        self.states.force_reset_session(&self.name);
        lock(&self.ring).clear();

        let previous = lock(&self.channel).take();
        if let Some(previous) = previous {
            if let Err(e) = previous.destroy().await {
                warn!("Session '{}' old channel teardown failed: {:#}", self.name, e);
            }
        }

        let params = self.params();
        match self.connector.connect(&params).await {
            Ok(channel) => {
                *lock(&self.channel) = Some(channel);
                self.healthy.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.healthy.store(false, Ordering::SeqCst);
                Err(TerminalError::reestablishment(&self.name, &e))
            }
        }
    }
}
