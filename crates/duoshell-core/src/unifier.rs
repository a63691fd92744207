use chrono::Utc;
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use uuid::Uuid;

use duoshell_logging::SessionTranscript;
use duoshell_types::{CommandSource, OutputRecord, RecordSource};

use crate::lock;

/// Normalize bare `\n` line endings to `\r\n`, leaving existing `\r\n` alone
pub fn normalize_newlines(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + raw.len() / 16);
    let mut previous = None;
    for ch in raw.chars() {
        if ch == '\n' && previous != Some('\r') {
            out.push('\r');
        }
        out.push(ch);
        previous = Some(ch);
    }
    out
}

/// Format one command's output for observers.
///
/// Programmatic commands get a synthesized echo of the command line because
/// nobody typed it; interactive output already contains the operator's echo.
pub fn format_output(prompt: &str, raw: &str, source: CommandSource, command: &str) -> String {
    let mut body = normalize_newlines(raw);
    if !body.is_empty() && !body.ends_with('\n') {
        if body.ends_with('\r') {
            body.push('\n');
        } else {
            body.push_str("\r\n");
        }
    }

    match source {
        CommandSource::Programmatic => format!("{} {}\r\n{}{} ", prompt, command, body, prompt),
        CommandSource::Interactive => format!("{}{} ", body, prompt),
    }
}

struct UnifierInner {
    prompt: String,
    next_seq: u64,
    history: VecDeque<Arc<OutputRecord>>,
    history_limit: usize,
    listeners: HashMap<Uuid, mpsc::UnboundedSender<Arc<OutputRecord>>>,
    transcript: Option<SessionTranscript>,
}

/// Single formatting point feeding live listeners and history.
///
/// Every emit produces exactly one record; the same `Arc` goes to every
/// listener and into history, so replay is byte-identical to live delivery.
pub struct OutputUnifier {
    session: String,
    inner: Mutex<UnifierInner>,
}

impl OutputUnifier {
    pub fn new(session: impl Into<String>, prompt: impl Into<String>, history_limit: usize) -> Self {
        Self {
            session: session.into(),
            inner: Mutex::new(UnifierInner {
                prompt: prompt.into(),
                next_seq: 1,
                history: VecDeque::new(),
                history_limit: history_limit.max(1),
                listeners: HashMap::new(),
                transcript: None,
            }),
        }
    }

    /// Mirror records and session events to a JSONL transcript
    pub fn attach_transcript(&self, transcript: SessionTranscript) {
        debug!(
            "Session '{}' transcript at {}",
            self.session,
            transcript.path().display()
        );
        lock(&self.inner).transcript = Some(transcript);
    }

    pub fn prompt(&self) -> String {
        lock(&self.inner).prompt.clone()
    }

    /// Format and publish one command's output
    pub fn emit(
        &self,
        raw_output: &str,
        source: CommandSource,
        command: &str,
        command_id: &str,
    ) -> Arc<OutputRecord> {
        let mut inner = lock(&self.inner);
        let payload = format_output(&inner.prompt, raw_output, source, command);
        self.publish(&mut inner, source.into(), Some(command_id.to_string()), payload)
    }

    /// Publish a system record (prompt, recovery notice) verbatim
    pub fn emit_system(&self, text: &str) -> Arc<OutputRecord> {
        let mut inner = lock(&self.inner);
        self.publish(&mut inner, RecordSource::System, None, text.to_string())
    }

    /// Publish the ready-for-input prompt
    pub fn emit_prompt(&self) -> Arc<OutputRecord> {
        let mut inner = lock(&self.inner);
        let payload = format!("{} ", inner.prompt);
        self.publish(&mut inner, RecordSource::System, None, payload)
    }

    fn publish(
        &self,
        inner: &mut UnifierInner,
        source: RecordSource,
        command_id: Option<String>,
        payload: String,
    ) -> Arc<OutputRecord> {
        let record = Arc::new(OutputRecord {
            seq: inner.next_seq,
            session: self.session.clone(),
            source,
            command_id,
            payload,
            created_at: Utc::now(),
        });
        inner.next_seq += 1;

        inner.history.push_back(Arc::clone(&record));
        while inner.history.len() > inner.history_limit {
            inner.history.pop_front();
        }

        inner
            .listeners
            .retain(|_, listener| listener.send(Arc::clone(&record)).is_ok());

        if let Some(transcript) = inner.transcript.as_mut() {
            if let Err(e) = transcript.log_record(&record) {
                warn!("Session '{}' transcript write failed: {:#}", self.session, e);
            }
        }

        record
    }

    /// Register a listener. History is replayed into the subscription under the
    /// same lock that registers it, so nothing is missed or duplicated.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        let mut inner = lock(&self.inner);
        for record in &inner.history {
            let _ = tx.send(Arc::clone(record));
        }
        inner.listeners.insert(id, tx);
        debug!(
            "Session '{}' listener {} subscribed ({} records replayed)",
            self.session,
            id,
            inner.history.len()
        );

        Subscription {
            id,
            receiver: rx,
            unifier: Arc::downgrade(self),
            active: true,
        }
    }

    pub fn unsubscribe(&self, id: Uuid) -> bool {
        lock(&self.inner).listeners.remove(&id).is_some()
    }

    pub fn history(&self) -> Vec<Arc<OutputRecord>> {
        lock(&self.inner).history.iter().cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        lock(&self.inner).history.len()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner).listeners.len()
    }

    /// Drop every listener; their streams end once drained
    pub fn close_listeners(&self) {
        lock(&self.inner).listeners.clear();
    }

    pub fn log_input(&self, id: &str, source: CommandSource, command: &str) {
        self.with_transcript(|t| t.log_input(id, source, command));
    }

    pub fn log_resize(&self, cols: u16, rows: u16) {
        self.with_transcript(|t| t.log_resize(cols, rows));
    }

    pub fn log_event(&self, event: &str, detail: &str) {
        self.with_transcript(|t| t.log_event(event, detail));
    }

    fn with_transcript<F>(&self, f: F)
    where
        F: FnOnce(&mut SessionTranscript) -> anyhow::Result<()>,
    {
        if let Some(transcript) = lock(&self.inner).transcript.as_mut() {
            if let Err(e) = f(transcript) {
                warn!("Session '{}' transcript write failed: {:#}", self.session, e);
            }
        }
    }
}

/// Live record stream of one listener; unsubscribes when dropped
pub struct Subscription {
    id: Uuid,
    receiver: mpsc::UnboundedReceiver<Arc<OutputRecord>>,
    unifier: Weak<OutputUnifier>,
    active: bool,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next record; `None` once unsubscribed and drained, or when the session closes
    pub async fn recv(&mut self) -> Option<Arc<OutputRecord>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<OutputRecord>> {
        self.receiver.try_recv().ok()
    }

    /// Every record already delivered and not yet read
    pub fn drain(&mut self) -> Vec<Arc<OutputRecord>> {
        let mut records = Vec::new();
        while let Ok(record) = self.receiver.try_recv() {
            records.push(record);
        }
        records
    }

    /// Stop receiving new records
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(unifier) = self.unifier.upgrade() {
            unifier.unsubscribe(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
