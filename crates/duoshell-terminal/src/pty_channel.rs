//! PTY-backed shell channel: one long-lived interactive shell per channel,
//! started locally or behind the system ssh client.
//!
//! Commands are written to the shell's input, so working directory, exported
//! variables and shell options carry over between them. The shell's prompt is
//! replaced by a frame carrying the tag of the last command and its `$?`; the
//! reader strips those frames out of the output and turns the current
//! command's frame into its `Exit` event.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use portable_pty::{Child, CommandBuilder};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use duoshell_types::ConnectionParams;

use super::channel::{ChannelEvent, CommandStream, ShellChannel, ShellConnector};
use super::pty_handler::PtyHandler;
use super::{
    EXIT_DRAIN_TIMEOUT_MS, READ_BUFFER_SIZE, SHELL_READY_TIMEOUT_SECS, SSH_CONNECT_TIMEOUT_SECS,
};

const FRAME_DELIMITER: u8 = 0x1e;
const FRAME_START: &[u8] = b"\x1eDS:";
/// Longer bodies are ordinary output that happens to contain the delimiter
const MAX_FRAME_BODY: usize = 96;

struct PendingCommand {
    tag: String,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

/// Splits the shell's output into command data and status frames
#[derive(Default)]
struct FrameReader {
    held: Vec<u8>,
    ready: Option<(String, oneshot::Sender<()>)>,
    current: Option<PendingCommand>,
}

impl FrameReader {
    fn feed(&mut self, chunk: &[u8]) {
        self.held.extend_from_slice(chunk);
        loop {
            let Some(start) = find(&self.held, FRAME_START) else {
                // Keep a possible frame prefix for the next read
                let keep = partial_suffix(&self.held, FRAME_START);
                let flush = self.held.len() - keep;
                let data: Vec<u8> = self.held.drain(..flush).collect();
                self.forward(data);
                return;
            };

            let body_start = start + FRAME_START.len();
            let body_len = self.held[body_start..]
                .iter()
                .position(|&b| b == FRAME_DELIMITER);
            match body_len {
                Some(len) if len <= MAX_FRAME_BODY => {
                    let before: Vec<u8> = self.held.drain(..start).collect();
                    self.forward(before);
                    let frame: Vec<u8> = self.held.drain(..FRAME_START.len() + len + 1).collect();
                    self.on_frame(&frame[FRAME_START.len()..FRAME_START.len() + len]);
                }
                None if self.held.len() - body_start <= MAX_FRAME_BODY => {
                    let before: Vec<u8> = self.held.drain(..start).collect();
                    self.forward(before);
                    return;
                }
                _ => {
                    let data: Vec<u8> = self.held.drain(..=start).collect();
                    self.forward(data);
                }
            }
        }
    }

    fn on_frame(&mut self, body: &[u8]) {
        let body = String::from_utf8_lossy(body);
        let Some((tag, code)) = body.rsplit_once(':') else {
            return;
        };

        if self.ready.as_ref().is_some_and(|(ready, _)| ready == tag) {
            if let Some((_, tx)) = self.ready.take() {
                let _ = tx.send(());
            }
        } else if self.current.as_ref().is_some_and(|pending| pending.tag == tag) {
            if let Some(pending) = self.current.take() {
                let _ = pending.tx.send(ChannelEvent::Exit(code.trim().parse().ok()));
            }
        } else {
            debug!("Ignoring prompt frame for inactive tag '{}'", tag);
        }
    }

    fn forward(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        match &self.current {
            Some(pending) => {
                let _ = pending.tx.send(ChannelEvent::Data(data));
            }
            None => debug!("Discarded {} byte(s) of shell output between commands", data.len()),
        }
    }

    /// The shell is gone: flush what is held and end the running stream
    fn close(&mut self) {
        let held = std::mem::take(&mut self.held);
        self.forward(held);
        self.current = None;
        self.ready = None;
    }
}

/// Channel backed by one interactive shell in a PTY.
///
/// Local hosts spawn the configured shell; remote hosts spawn the system
/// `ssh -tt` client running that shell, so authentication and transport stay
/// outside this crate.
pub struct PtyChannel {
    params: ConnectionParams,
    handler: Mutex<PtyHandler>,
    frames: Arc<Mutex<FrameReader>>,
    open: Arc<AtomicBool>,
}

impl PtyChannel {
    /// Spawn the shell and wait until it reports its first prompt frame
    pub async fn start(params: ConnectionParams, shell: Option<String>) -> Result<Self> {
        let shell = shell.unwrap_or_else(|| default_shell(params.is_local()));
        let spawned = PtyHandler::spawn(shell_command(&params, &shell), params.cols, params.rows)?;

        let ready_tag = new_tag();
        let (ready_tx, ready_rx) = oneshot::channel();
        let frames = Arc::new(Mutex::new(FrameReader {
            ready: Some((ready_tag.clone(), ready_tx)),
            ..FrameReader::default()
        }));
        let open = Arc::new(AtomicBool::new(true));

        spawn_reader(spawned.reader, Arc::clone(&frames), Arc::clone(&open), params.host.clone());
        spawn_waiter(spawned.child, Arc::clone(&frames), Arc::clone(&open), params.host.clone());

        let channel = Self {
            params,
            handler: Mutex::new(spawned.handler),
            frames,
            open,
        };
        channel.write_raw(init_script(&ready_tag, channel.params.working_dir.as_deref()).as_bytes())?;

        let mut wait = Duration::from_secs(SHELL_READY_TIMEOUT_SECS);
        if !channel.params.is_local() {
            wait += Duration::from_secs(SSH_CONNECT_TIMEOUT_SECS);
        }
        match tokio::time::timeout(wait, ready_rx).await {
            Ok(Ok(())) => {
                debug!("PTY shell '{}' ready on {}", shell, channel.params.host);
                Ok(channel)
            }
            Ok(Err(_)) => bail!(
                "Shell '{}' on {}@{} exited before it was ready",
                shell,
                channel.params.user,
                channel.params.host
            ),
            Err(_) => bail!(
                "Timed out after {:?} waiting for shell '{}' on {}",
                wait,
                shell,
                channel.params.host
            ),
        }
    }

    fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        lock(&self.handler).write(bytes)
    }
}

#[async_trait]
impl ShellChannel for PtyChannel {
    async fn exec(&self, command: &str) -> Result<CommandStream> {
        if !self.is_open() {
            bail!("Channel to {} is closed", self.params.host);
        }

        let tag = new_tag();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut frames = lock(&self.frames);
            let pending = PendingCommand {
                tag: tag.clone(),
                tx,
            };
            if let Some(previous) = frames.current.replace(pending) {
                warn!(
                    "PTY channel to {} replaced still-running command {}",
                    self.params.host, previous.tag
                );
            }
        }

        // eval keeps a multi-line command one unit, so one prompt follows it
        let line = format!("__ds={}; eval {}\n", tag, shell_quote(command));
        if let Err(e) = self.write_raw(line.as_bytes()) {
            lock(&self.frames).current = None;
            return Err(e.context(format!("Failed to send command to {}", self.params.host)));
        }

        debug!("PTY channel to {} started command {}", self.params.host, tag);
        Ok(rx)
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_open() {
            bail!("Channel to {} is closed", self.params.host);
        }
        self.write_raw(bytes)
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        lock(&self.handler).resize(cols, rows)
    }

    async fn destroy(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        lock(&self.frames).close();
        if let Err(e) = lock(&self.handler).kill() {
            debug!("Shell on {} was already gone: {:#}", self.params.host, e);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn backend_name(&self) -> &str {
        "pty"
    }
}

impl Drop for PtyChannel {
    fn drop(&mut self) {
        let _ = lock(&self.handler).kill();
    }
}

/// Background reader: feeds PTY output to the frame reader until EOF
fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    frames: Arc<Mutex<FrameReader>>,
    open: Arc<AtomicBool>,
    host: String,
) {
    thread::spawn(move || {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => lock(&frames).feed(&buffer[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                // EIO once the slave side is gone
                Err(_) => break,
            }
        }

        open.store(false, Ordering::SeqCst);
        lock(&frames).close();
        debug!("PTY shell output on {} ended", host);
    });
}

/// Reaps the shell and closes the channel once it exits
fn spawn_waiter(
    mut child: Box<dyn Child + Send + Sync>,
    frames: Arc<Mutex<FrameReader>>,
    open: Arc<AtomicBool>,
    host: String,
) {
    thread::spawn(move || {
        let status = child.wait();
        // Background jobs may keep the terminal open; give the reader a moment
        thread::sleep(Duration::from_millis(EXIT_DRAIN_TIMEOUT_MS));

        open.store(false, Ordering::SeqCst);
        lock(&frames).close();
        match status {
            Ok(status) => debug!("Shell on {} exited with {}", host, status.exit_code()),
            Err(e) => warn!("Failed to wait for shell on {}: {}", host, e),
        }
    });
}

/// Connector producing [`PtyChannel`]s
pub struct PtyConnector {
    shell: Option<String>,
}

impl PtyConnector {
    pub fn new(shell: Option<String>) -> Self {
        Self { shell }
    }
}

#[async_trait]
impl ShellConnector for PtyConnector {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn ShellChannel>> {
        if params.is_local() {
            if let Some(dir) = &params.working_dir {
                if !Path::new(dir).is_dir() {
                    bail!("Working directory '{}' does not exist", dir);
                }
            }
        }
        let channel = PtyChannel::start(params.clone(), self.shell.clone())
            .await
            .with_context(|| format!("Failed to open a shell for {}@{}", params.user, params.host))?;
        Ok(Arc::new(channel))
    }

    fn backend_name(&self) -> &str {
        "pty"
    }
}

fn shell_command(params: &ConnectionParams, shell: &str) -> CommandBuilder {
    let mut cmd = if params.is_local() {
        let mut cmd = CommandBuilder::new(shell);
        if let Some(dir) = &params.working_dir {
            cmd.cwd(dir);
        }
        cmd
    } else {
        let mut cmd = CommandBuilder::new("ssh");
        cmd.args(ssh_args(params));
        cmd.arg(shell);
        cmd
    };
    cmd.args(interactive_args(shell));
    cmd.env("TERM", "dumb");
    cmd
}

/// Run the shell interactively without line editing, so the terminal's own
/// echo setting decides what is echoed
fn interactive_args(shell: &str) -> Vec<&'static str> {
    let name = Path::new(shell)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(shell);
    if name == "bash" {
        vec!["--noediting", "--noprofile", "--norc", "-i"]
    } else {
        vec!["-i"]
    }
}

/// First input line: silence echo and prompts, then install the frame prompt.
/// The options a shell does not know fail quietly.
fn init_script(ready_tag: &str, working_dir: Option<&str>) -> String {
    let mut script = String::from(
        "stty -echo 2>/dev/null; unset PROMPT_COMMAND; setopt PROMPT_SUBST 2>/dev/null; \
         unsetopt ZLE 2>/dev/null; set -o ignoreeof 2>/dev/null; PS2=''; ",
    );
    if let Some(dir) = working_dir {
        script.push_str(&format!("cd {} || exit 1; ", shell_quote(dir)));
    }
    script.push_str(&format!(
        "__ds={}; PS1=\"$(printf '\\036')DS:\"'${{__ds}}:$?'\"$(printf '\\036')\"\n",
        ready_tag
    ));
    script
}

fn ssh_args(params: &ConnectionParams) -> Vec<String> {
    let mut args = vec![
        "-tt".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", SSH_CONNECT_TIMEOUT_SECS),
    ];
    if let Some(port) = params.port {
        args.push("-p".to_string());
        args.push(port.to_string());
    }
    if let Some(key) = &params.key_path {
        args.push("-i".to_string());
        args.push(key.display().to_string());
    }
    args.push(format!("{}@{}", params.user, params.host));
    args
}

fn default_shell(local: bool) -> String {
    if local && !Path::new("/bin/bash").exists() {
        "/bin/sh".to_string()
    } else if local {
        "/bin/bash".to_string()
    } else {
        "bash".to_string()
    }
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "'\\''"))
}

fn new_tag() -> String {
    Uuid::new_v4().simple().to_string()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Length of the longest proper prefix of `needle` that ends `haystack`
fn partial_suffix(haystack: &[u8], needle: &[u8]) -> usize {
    (1..needle.len())
        .rev()
        .find(|&len| haystack.ends_with(&needle[..len]))
        .unwrap_or(0)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
