use anyhow::{bail, Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use duoshell_terminal::ChannelBackendType;
use duoshell_types::{
    DEFAULT_COLS, DEFAULT_HISTORY_LIMIT, DEFAULT_NUCLEAR_TIMEOUT_MS, DEFAULT_ROWS,
    MAX_RING_BUFFER_ENTRIES, MAX_TERMINAL_DIMENSION, MIN_TERMINAL_DIMENSION,
};

/// Core configuration, loaded from TOML with environment overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// How long an interrupted session may stay unresponsive before its channel is replaced
    pub nuclear_timeout_ms: u64,
    pub ring_buffer_capacity: usize,
    /// Output records retained per session
    pub history_limit: usize,
    /// `pty` or `scripted`
    pub backend: String,
    /// Shell used for local sessions; `/bin/bash` (or `/bin/sh`) when unset
    pub shell: Option<String>,
    pub default_cols: u16,
    pub default_rows: u16,
    /// Mirror every session's output to JSONL transcripts in this directory
    pub transcript_dir: Option<PathBuf>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            nuclear_timeout_ms: DEFAULT_NUCLEAR_TIMEOUT_MS,
            ring_buffer_capacity: MAX_RING_BUFFER_ENTRIES,
            history_limit: DEFAULT_HISTORY_LIMIT,
            backend: ChannelBackendType::default().to_string(),
            shell: None,
            default_cols: DEFAULT_COLS,
            default_rows: DEFAULT_ROWS,
            transcript_dir: None,
        }
    }
}

impl CoreConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CoreConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Startup configuration: the TOML file when given, defaults otherwise,
    /// then `.env` and environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `DUOSHELL_*` settings from the process environment and from a
    /// `.env` file in the working directory or its parents, if one exists
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        let file_values = match dotenvy::dotenv_iter() {
            Ok(iter) => collect_env_file(iter).context("Invalid .env file")?,
            Err(_) => HashMap::new(),
        };
        self.apply_env_layers(file_values)
    }

    /// Like [`CoreConfig::apply_env_overrides`], reading the given env file
    pub fn apply_env_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let iter = dotenvy::from_path_iter(path)
            .with_context(|| format!("Failed to read env file {}", path.display()))?;
        let file_values =
            collect_env_file(iter).with_context(|| format!("Invalid env file {}", path.display()))?;
        self.apply_env_layers(file_values)
    }

    // The process environment wins over the file, as dotenvy does
    fn apply_env_layers(&mut self, file_values: HashMap<String, String>) -> Result<()> {
        if !file_values.is_empty() {
            debug!("Env file provides {} setting(s)", file_values.len());
        }
        self.apply_overrides_from(|key| {
            std::env::var(key)
                .ok()
                .or_else(|| file_values.get(key).cloned())
        })
    }

    fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("DUOSHELL_NUCLEAR_TIMEOUT_MS") {
            self.nuclear_timeout_ms = value
                .trim()
                .parse()
                .with_context(|| format!("DUOSHELL_NUCLEAR_TIMEOUT_MS is not a number: {}", value))?;
        }
        if let Some(value) = lookup("DUOSHELL_RING_CAPACITY") {
            self.ring_buffer_capacity = value
                .trim()
                .parse()
                .with_context(|| format!("DUOSHELL_RING_CAPACITY is not a number: {}", value))?;
        }
        if let Some(value) = lookup("DUOSHELL_HISTORY_LIMIT") {
            self.history_limit = value
                .trim()
                .parse()
                .with_context(|| format!("DUOSHELL_HISTORY_LIMIT is not a number: {}", value))?;
        }
        if let Some(value) = lookup("DUOSHELL_BACKEND") {
            self.backend = value.trim().to_string();
        }
        if let Some(value) = lookup("DUOSHELL_SHELL") {
            if !value.trim().is_empty() {
                self.shell = Some(value.trim().to_string());
            }
        }
        if let Some(value) = lookup("DUOSHELL_TRANSCRIPT_DIR") {
            if !value.trim().is_empty() {
                self.transcript_dir = Some(PathBuf::from(value.trim()));
            }
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.nuclear_timeout_ms == 0 {
            bail!("nuclear_timeout_ms must be greater than zero");
        }
        if self.ring_buffer_capacity == 0 {
            bail!("ring_buffer_capacity must be greater than zero");
        }
        if self.history_limit == 0 {
            bail!("history_limit must be greater than zero");
        }
        for (name, value) in [("default_cols", self.default_cols), ("default_rows", self.default_rows)] {
            if !(MIN_TERMINAL_DIMENSION..=MAX_TERMINAL_DIMENSION).contains(&value) {
                bail!(
                    "{} must be between {} and {}, got {}",
                    name,
                    MIN_TERMINAL_DIMENSION,
                    MAX_TERMINAL_DIMENSION,
                    value
                );
            }
        }
        self.backend_type()?;
        Ok(())
    }

    pub fn backend_type(&self) -> Result<ChannelBackendType> {
        self.backend.parse()
    }

    pub fn nuclear_timeout(&self) -> Duration {
        Duration::from_millis(self.nuclear_timeout_ms)
    }
}

fn collect_env_file<I>(iter: I) -> Result<HashMap<String, String>>
where
    I: Iterator<Item = Result<(String, String), dotenvy::Error>>,
{
    let mut values = HashMap::new();
    for item in iter {
        let (key, value) = item?;
        values.insert(key, value);
    }
    Ok(values)
}
