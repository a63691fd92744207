use std::collections::VecDeque;

use duoshell_types::{CommandResult, CommandSource, TerminalResult};

/// One recently submitted command
#[derive(Debug, Clone)]
pub struct RingEntry {
    pub command: String,
    pub id: String,
    pub source: CommandSource,
    /// Filled in once the command resolves
    pub result: Option<TerminalResult<CommandResult>>,
}

impl RingEntry {
    pub fn pending(command: &str, id: &str, source: CommandSource) -> Self {
        Self {
            command: command.to_string(),
            id: id.to_string(),
            source,
            result: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.result.is_none()
    }
}

/// Bounded record of recent submissions, oldest evicted first.
///
/// Drives source-aware cancellation and duplicate detection.
#[derive(Debug, Clone)]
pub struct CommandRingBuffer {
    entries: VecDeque<RingEntry>,
    capacity: usize,
}

impl CommandRingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, returning the evicted one when full
    pub fn push(&mut self, entry: RingEntry) -> Option<RingEntry> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    pub fn contains_pending(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id == id && e.is_pending())
    }

    pub fn has_pending(&self, source: CommandSource) -> bool {
        self.entries.iter().any(|e| e.source == source && e.is_pending())
    }

    /// Attach a result to the pending entry with this id
    pub fn record_result(&mut self, id: &str, result: TerminalResult<CommandResult>) -> bool {
        match self
            .entries
            .iter_mut()
            .rev()
            .find(|e| e.id == id && e.is_pending())
        {
            Some(entry) => {
                entry.result = Some(result);
                true
            }
            None => false,
        }
    }

    /// Remove pending entries of one source
    pub fn remove_pending(&mut self, source: CommandSource) -> Vec<RingEntry> {
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| e.source == source && e.is_pending());
        self.entries = kept.into();
        removed
    }

    /// Remove every entry of one source, resolved or not
    pub fn remove_source(&mut self, source: CommandSource) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.source != source);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> Vec<RingEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
