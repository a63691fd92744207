//! In-memory shell channel driven by a script of canned replies.
//!
//! Commands are answered from explicit script entries first, then from a few
//! builtins (`whoami`, `hostname`, `pwd`, `echo`, `sleep`, `true`, `false`,
//! `exit N`). Every write is recorded so callers can inspect the control bytes
//! a channel received.

use super::channel::{ChannelEvent, CommandStream, ShellChannel, ShellConnector};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use duoshell_types::ConnectionParams;

/// How the scripted shell answers one command
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    /// Print `output` and exit with `exit_code` after `delay`.
    /// Ctrl-C ends it early with status 130, Ctrl-Z with 148.
    Output {
        output: String,
        exit_code: i32,
        delay: Duration,
    },
    /// Never finishes and ignores every control byte; only `destroy` ends it
    Hang,
    /// `exec` itself fails
    Fail(String),
    /// The command starts, then the channel reports an error
    Error(String),
}

impl ScriptedReply {
    pub fn output(output: impl Into<String>) -> Self {
        Self::Output {
            output: output.into(),
            exit_code: 0,
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(output: impl Into<String>, delay: Duration) -> Self {
        Self::Output {
            output: output.into(),
            exit_code: 0,
            delay,
        }
    }

    pub fn exit(exit_code: i32) -> Self {
        Self::Output {
            output: String::new(),
            exit_code,
            delay: Duration::ZERO,
        }
    }
}

/// Command → reply table
#[derive(Debug, Clone, Default)]
pub struct Script {
    replies: HashMap<String, ScriptedReply>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, command: impl Into<String>, reply: ScriptedReply) -> Self {
        self.replies.insert(command.into(), reply);
        self
    }

    fn reply_for(&self, command: &str, params: &ConnectionParams) -> ScriptedReply {
        if let Some(reply) = self.replies.get(command) {
            return reply.clone();
        }

        let trimmed = command.trim();
        let (program, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((program, rest)) => (program, rest.trim()),
            None => (trimmed, ""),
        };

        match program {
            "whoami" => ScriptedReply::output(format!("{}\n", params.user)),
            "hostname" => ScriptedReply::output(format!("{}\n", params.host)),
            "pwd" => ScriptedReply::output(format!(
                "{}\n",
                params
                    .working_dir
                    .clone()
                    .unwrap_or_else(|| format!("/home/{}", params.user))
            )),
            "echo" => ScriptedReply::output(format!("{}\n", rest)),
            "true" => ScriptedReply::exit(0),
            "false" => ScriptedReply::exit(1),
            "exit" => ScriptedReply::exit(rest.parse().unwrap_or(0)),
            "sleep" => match rest.parse::<f64>() {
                Ok(secs) if secs >= 0.0 => {
                    ScriptedReply::delayed(String::new(), Duration::from_secs_f64(secs))
                }
                _ => ScriptedReply::Output {
                    output: "sleep: invalid time interval\n".to_string(),
                    exit_code: 1,
                    delay: Duration::ZERO,
                },
            },
            _ => ScriptedReply::Output {
                output: format!("sh: 1: {}: not found\n", program),
                exit_code: 127,
                delay: Duration::ZERO,
            },
        }
    }
}

/// Concurrency accounting shared by every channel of one connector
#[derive(Debug, Default)]
struct InFlight {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One scripted channel
pub struct ScriptedChannel {
    id: usize,
    params: ConnectionParams,
    script: Arc<Script>,
    open: AtomicBool,
    destroyed: CancellationToken,
    control: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    writes: Mutex<Vec<Vec<u8>>>,
    executed: Mutex<Vec<String>>,
    size: Mutex<(u16, u16)>,
    reject_resize: AtomicBool,
    in_flight: Arc<InFlight>,
}

impl ScriptedChannel {
    pub fn new(params: ConnectionParams, script: Script) -> Self {
        Self::with_accounting(0, params, Arc::new(script), Arc::new(InFlight::default()))
    }

    fn with_accounting(
        id: usize,
        params: ConnectionParams,
        script: Arc<Script>,
        in_flight: Arc<InFlight>,
    ) -> Self {
        let size = (params.cols, params.rows);
        Self {
            id,
            params,
            script,
            open: AtomicBool::new(true),
            destroyed: CancellationToken::new(),
            control: Mutex::new(None),
            writes: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
            size: Mutex::new(size),
            reject_resize: AtomicBool::new(false),
            in_flight,
        }
    }

    /// Position of this channel in its connector's connect order
    pub fn id(&self) -> usize {
        self.id
    }

    /// Every byte string written to the channel, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.writes).clone()
    }

    /// Commands started on this channel, in order
    pub fn executed_commands(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }

    pub fn size(&self) -> (u16, u16) {
        *lock(&self.size)
    }

    /// Make subsequent resizes fail
    pub fn set_reject_resize(&self, reject: bool) {
        self.reject_resize.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl ShellChannel for ScriptedChannel {
    async fn exec(&self, command: &str) -> Result<CommandStream> {
        if !self.is_open() {
            bail!("Scripted channel #{} is closed", self.id);
        }

        let reply = self.script.reply_for(command, &self.params);
        if let ScriptedReply::Fail(message) = &reply {
            bail!("{}", message);
        }
        lock(&self.executed).push(command.to_string());

        let (tx, rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        *lock(&self.control) = Some(control_tx);

        let destroyed = self.destroyed.clone();
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.enter();

        tokio::spawn(async move {
            let events = play(reply, destroyed, control_rx).await;
            // Leave before reporting so the next command never overlaps this one
            in_flight.leave();
            for event in events {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_open() {
            bail!("Scripted channel #{} is closed", self.id);
        }
        lock(&self.writes).push(bytes.to_vec());
        if let Some(control) = lock(&self.control).as_ref() {
            let _ = control.send(bytes.to_vec());
        }
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if self.reject_resize.load(Ordering::SeqCst) {
            bail!("Remote rejected window change to {}x{}", cols, rows);
        }
        *lock(&self.size) = (cols, rows);
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.destroyed.cancel();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn backend_name(&self) -> &str {
        "scripted"
    }
}

/// Run one reply to completion. An empty event list means the channel was
/// destroyed and the stream must close without an exit.
async fn play(
    reply: ScriptedReply,
    destroyed: CancellationToken,
    mut control: mpsc::UnboundedReceiver<Vec<u8>>,
) -> Vec<ChannelEvent> {
    match reply {
        ScriptedReply::Output {
            output,
            exit_code,
            delay,
        } => {
            let deadline = tokio::time::sleep(delay);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = destroyed.cancelled() => return Vec::new(),
                    _ = &mut deadline => {
                        let mut events = Vec::new();
                        if !output.is_empty() {
                            events.push(ChannelEvent::Data(output.into_bytes()));
                        }
                        events.push(ChannelEvent::Exit(Some(exit_code)));
                        return events;
                    }
                    Some(bytes) = control.recv() => {
                        if bytes.contains(&0x03) {
                            return vec![
                                ChannelEvent::Data(b"^C\r\n".to_vec()),
                                ChannelEvent::Exit(Some(130)),
                            ];
                        }
                        if bytes.contains(&0x1a) {
                            return vec![
                                ChannelEvent::Data(b"^Z\r\n".to_vec()),
                                ChannelEvent::Exit(Some(148)),
                            ];
                        }
                    }
                }
            }
        }
        ScriptedReply::Hang => {
            destroyed.cancelled().await;
            Vec::new()
        }
        ScriptedReply::Error(message) => vec![ChannelEvent::Error(message)],
        ScriptedReply::Fail(_) => Vec::new(),
    }
}

/// Connector producing [`ScriptedChannel`]s that share one script
pub struct ScriptedConnector {
    script: Arc<Script>,
    channels: Mutex<Vec<Arc<ScriptedChannel>>>,
    failures_remaining: AtomicUsize,
    in_flight: Arc<InFlight>,
}

impl ScriptedConnector {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
            channels: Mutex::new(Vec::new()),
            failures_remaining: AtomicUsize::new(0),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_next_connects(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.channels).len()
    }

    pub fn channels(&self) -> Vec<Arc<ScriptedChannel>> {
        lock(&self.channels).clone()
    }

    pub fn latest(&self) -> Option<Arc<ScriptedChannel>> {
        lock(&self.channels).last().cloned()
    }

    /// Highest number of commands ever running at once across all channels
    pub fn max_concurrent_commands(&self) -> usize {
        self.in_flight.max.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShellConnector for ScriptedConnector {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn ShellChannel>> {
        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            bail!("Connection to {}@{} refused", params.user, params.host);
        }

        let mut channels = lock(&self.channels);
        let channel = Arc::new(ScriptedChannel::with_accounting(
            channels.len(),
            params.clone(),
            Arc::clone(&self.script),
            Arc::clone(&self.in_flight),
        ));
        channels.push(Arc::clone(&channel));
        Ok(channel)
    }

    fn backend_name(&self) -> &str {
        "scripted"
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
