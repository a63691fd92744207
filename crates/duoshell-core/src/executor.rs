//! Per-session command queue and worker.
//!
//! Every submission, from either source, goes through one FIFO queue served
//! by a single worker task, so commands never interleave on the channel. A
//! caller either gets the result or, once its wait budget runs out, a task id
//! whose outcome lands in the background registry.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

use duoshell_logging::safe_truncate;
use duoshell_terminal::ChannelEvent;
use duoshell_types::{
    CommandResult, CommandSource, SubmitOutcome, TerminalError, TerminalResult,
};

use crate::background::BackgroundTaskRegistry;
use crate::lock;
use crate::ring_buffer::RingEntry;
use crate::session::TerminalSession;

/// What to do when the session is already running a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusyPolicy {
    /// Wait in the FIFO queue
    #[default]
    Enqueue,
    /// Fail with `SessionBusy` naming the running command
    Reject,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitOptions {
    /// How long the caller waits before the command is handed to the
    /// background registry; `None` waits for completion
    pub wait_budget: Option<Duration>,
    pub when_busy: BusyPolicy,
}

impl SubmitOptions {
    pub fn with_budget(budget: Duration) -> Self {
        Self {
            wait_budget: Some(budget),
            ..Self::default()
        }
    }

    pub fn reject_when_busy(mut self) -> Self {
        self.when_busy = BusyPolicy::Reject;
        self
    }
}

/// Where a command's outcome goes: the waiting caller or, once the caller
/// gave up, the background registry. Both sides switch it under its lock.
pub(crate) enum Delivery {
    Waiting(oneshot::Sender<TerminalResult<CommandResult>>),
    Detached,
    Resolved,
}

pub(crate) type DeliverySlot = Arc<Mutex<Delivery>>;

pub(crate) fn resolve(
    slot: &DeliverySlot,
    tasks: &BackgroundTaskRegistry,
    id: &str,
    result: TerminalResult<CommandResult>,
) {
    let mut delivery = lock(slot);
    match std::mem::replace(&mut *delivery, Delivery::Resolved) {
        Delivery::Waiting(tx) => {
            let _ = tx.send(result);
        }
        Delivery::Detached => {
            tasks.settle(id, result);
        }
        Delivery::Resolved => {}
    }
}

/// A submission waiting for its turn
pub(crate) struct QueuedCommand {
    pub command: String,
    pub id: String,
    pub source: CommandSource,
    pub submitted_at: DateTime<Utc>,
    pub delivery: DeliverySlot,
}

impl TerminalSession {
    /// Queue a command and wait for it, up to the wait budget
    pub async fn submit(
        &self,
        command: &str,
        source: CommandSource,
        id: &str,
        options: SubmitOptions,
    ) -> TerminalResult<SubmitOutcome> {
        if command.trim().is_empty() {
            return Err(TerminalError::validation("command must not be empty"));
        }
        if id.trim().is_empty() {
            return Err(TerminalError::validation("command id must not be empty"));
        }
        self.ensure_open()?;
        if !self.is_healthy() {
            return Err(TerminalError::SessionUnhealthy(self.name.clone()));
        }

        let (tx, rx) = oneshot::channel();
        let delivery: DeliverySlot = Arc::new(Mutex::new(Delivery::Waiting(tx)));
        let submitted_at = Utc::now();

        {
            let mut queue = lock(&self.queue);

            if options.when_busy == BusyPolicy::Reject {
                let blocking = self
                    .states
                    .active_command(&self.name)
                    .map(|a| (a.command, a.id, a.source))
                    .or_else(|| {
                        queue
                            .front()
                            .map(|q| (q.command.clone(), q.id.clone(), q.source))
                    });
                if let Some((command, id, origin)) = blocking {
                    return Err(TerminalError::SessionBusy {
                        session: self.name.clone(),
                        command,
                        id,
                        origin,
                    });
                }
            }

            let mut ring = lock(&self.ring);
            if ring.contains_pending(id) {
                return Err(TerminalError::validation(format!(
                    "duplicate submission: command id '{}' is still pending",
                    id
                )));
            }
            if let Some(evicted) = ring.push(RingEntry::pending(command, id, source)) {
                debug!("Session '{}' ring buffer evicted {}", self.name, evicted.id);
            }
            drop(ring);

            queue.push_back(QueuedCommand {
                command: command.to_string(),
                id: id.to_string(),
                source,
                submitted_at,
                delivery: Arc::clone(&delivery),
            });
        }
        self.wake.notify_one();

        debug!(
            "Session '{}' queued {} command {}: {}",
            self.name,
            source,
            id,
            safe_truncate(command, 60)
        );
        self.unifier.log_input(id, source, command);

        self.await_outcome(rx, delivery, options.wait_budget, command, id, source, submitted_at)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn await_outcome(
        &self,
        mut rx: oneshot::Receiver<TerminalResult<CommandResult>>,
        delivery: DeliverySlot,
        wait_budget: Option<Duration>,
        command: &str,
        id: &str,
        source: CommandSource,
        submitted_at: DateTime<Utc>,
    ) -> TerminalResult<SubmitOutcome> {
        let received = match wait_budget {
            None => rx.await,
            Some(budget) => match tokio::time::timeout(budget, &mut rx).await {
                Ok(received) => received,
                Err(_) => {
                    {
                        let mut slot = lock(&delivery);
                        if matches!(*slot, Delivery::Waiting(_)) {
                            *slot = Delivery::Detached;
                            self.tasks.register(id, command, source, submitted_at);
                            return Ok(SubmitOutcome::Pending {
                                task_id: id.to_string(),
                            });
                        }
                    }
                    // Resolved while the budget expired; the result is already sent
                    rx.await
                }
            },
        };

        match received {
            Ok(result) => result.map(SubmitOutcome::Completed),
            Err(_) => Err(TerminalError::Cancelled {
                session: self.name.clone(),
                id: id.to_string(),
            }),
        }
    }

    /// Serve the queue until the session is closed
    pub(crate) async fn run_worker(self: Arc<Self>) {
        debug!("Session '{}' worker started", self.name);
        loop {
            if self.closed.is_cancelled() {
                break;
            }
            let next = lock(&self.queue).pop_front();
            match next {
                Some(queued) => self.execute(queued).await,
                None => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = self.closed.cancelled() => break,
                    }
                }
            }
        }
        debug!("Session '{}' worker stopped", self.name);
    }

    async fn execute(&self, queued: QueuedCommand) {
        let QueuedCommand {
            command,
            id,
            source,
            delivery,
            ..
        } = queued;

        if let Err(e) = self
            .states
            .start_command_execution(&self.name, &command, &id, source)
        {
            warn!("Session '{}' could not start {}: {}", self.name, id, e);
            resolve(&delivery, &self.tasks, &id, Err(e));
            return;
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let started_at = Utc::now();
        debug!("Session '{}' running {} command {}", self.name, source, id);

        let outcome = self.run_on_channel(&command).await;
        self.states.complete_command_execution(&self.name, &id);

        let result = match outcome {
            Ok((output, exit_code)) => {
                self.nuclear.clear();
                let record = self.unifier.emit(&output, source, &command, &id);
                Ok(CommandResult {
                    id: id.clone(),
                    command: command.clone(),
                    source,
                    output,
                    exit_code,
                    started_at,
                    finished_at: Utc::now(),
                    record_seq: Some(record.seq),
                })
            }
            Err(e) => {
                let e = if self.generation.load(Ordering::SeqCst) != generation {
                    e.context("command aborted by session recovery")
                } else {
                    e
                };
                warn!("Session '{}' command {} failed: {:#}", self.name, id, e);
                Err(TerminalError::execution(&self.name, &id, &e))
            }
        };

        lock(&self.ring).record_result(&id, result.clone());
        resolve(&delivery, &self.tasks, &id, result);
    }

    /// Run one command and collect its output until the exit side channel fires
    async fn run_on_channel(&self, command: &str) -> Result<(String, Option<i32>)> {
        // Wait out any recovery in progress
        drop(self.recovery.lock().await);

        let channel = self
            .current_channel()
            .context("Session has no open channel")?;
        let mut stream = channel.exec(command).await?;

        let mut output = Vec::new();
        while let Some(event) = stream.recv().await {
            match event {
                ChannelEvent::Data(bytes) => output.extend_from_slice(&bytes),
                ChannelEvent::Exit(code) => {
                    return Ok((String::from_utf8_lossy(&output).into_owned(), code));
                }
                ChannelEvent::Error(message) => bail!("{}", message),
            }
        }
        bail!("Channel closed before the command finished")
    }
}
