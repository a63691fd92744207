use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;

use duoshell_types::{CommandSource, OutputRecord};

/// Append-only JSONL transcript of one session.
///
/// Every output record the session emits is written here verbatim, alongside
/// submitted commands, resizes and recovery events.
pub struct SessionTranscript {
    session: String,
    path: PathBuf,
    file: File,
    records_written: u64,
}

impl SessionTranscript {
    /// Open (or continue) the transcript for `session` inside `dir`
    pub fn open(session: &str, dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .context("Failed to create transcript directory")?;

        let path = dir.join(format!("session-{}.jsonl", file_safe_name(session)));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open transcript {}", path.display()))?;

        Ok(Self {
            session: session.to_string(),
            path,
            file,
            records_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Persist an output record exactly as it was broadcast
    pub fn log_record(&mut self, record: &OutputRecord) -> Result<()> {
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "session_id": self.session,
            "event": "record",
            "record": record,
        });
        self.write_entry(&entry)?;
        self.records_written += 1;
        Ok(())
    }

    /// Log a command submission
    pub fn log_input(&mut self, id: &str, source: CommandSource, command: &str) -> Result<()> {
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "session_id": self.session,
            "event": "input",
            "id": id,
            "source": source,
            "command": command,
        });
        self.write_entry(&entry)
    }

    /// Log resize event
    pub fn log_resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "session_id": self.session,
            "event": "resize",
            "cols": cols,
            "rows": rows,
        });
        self.write_entry(&entry)
    }

    /// Log a lifecycle event such as a nuclear fallback
    pub fn log_event(&mut self, event: &str, detail: &str) -> Result<()> {
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "session_id": self.session,
            "event": event,
            "detail": detail,
        });
        self.write_entry(&entry)
    }

    fn write_entry(&mut self, entry: &serde_json::Value) -> Result<()> {
        writeln!(self.file, "{}", entry)
            .context("Failed to write to transcript")?;
        self.file.flush()?;
        Ok(())
    }
}

/// Read back the output records of a transcript file, in order
pub fn read_records(path: &Path) -> Result<Vec<OutputRecord>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read transcript {}", path.display()))?;

    let mut records = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let value: serde_json::Value = serde_json::from_str(line)
            .context("Malformed transcript line")?;
        if value["event"] == "record" {
            let record: OutputRecord = serde_json::from_value(value["record"].clone())
                .context("Malformed output record in transcript")?;
            records.push(record);
        }
    }
    Ok(records)
}

fn file_safe_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
