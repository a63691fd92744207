use chrono::{DateTime, Utc};
use log::debug;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use duoshell_types::{TerminalError, TerminalResult};

use crate::lock;

/// Handle to an armed nuclear timeout, given to the task that waits it out
#[derive(Debug, Clone)]
pub struct ArmedTimeout {
    pub id: u64,
    pub token: CancellationToken,
    pub duration: Duration,
    pub armed_at: DateTime<Utc>,
}

#[derive(Debug)]
struct NuclearState {
    active: Option<ArmedTimeout>,
    triggered: bool,
    fallback_count: u64,
    next_id: u64,
    duration: Duration,
}

/// Per-session nuclear timeout: at most one armed at a time.
///
/// Clearing cancels the armed token; a firing timer only proceeds while its
/// own token is still the armed one.
#[derive(Debug)]
pub struct NuclearController {
    state: Mutex<NuclearState>,
}

impl NuclearController {
    pub fn new(duration: Duration) -> Self {
        Self {
            state: Mutex::new(NuclearState {
                active: None,
                triggered: false,
                fallback_count: 0,
                next_id: 1,
                duration,
            }),
        }
    }

    /// Arm a timeout unless one is already active
    pub fn arm(&self) -> Option<ArmedTimeout> {
        let mut state = lock(&self.state);
        if state.active.is_some() {
            return None;
        }
        let armed = ArmedTimeout {
            id: state.next_id,
            token: CancellationToken::new(),
            duration: state.duration,
            armed_at: Utc::now(),
        };
        state.next_id += 1;
        state.active = Some(armed.clone());
        debug!("Nuclear timeout #{} armed for {:?}", armed.id, armed.duration);
        Some(armed)
    }

    /// Disarm the active timeout, if any
    pub fn clear(&self) -> bool {
        match lock(&self.state).active.take() {
            Some(armed) => {
                armed.token.cancel();
                debug!("Nuclear timeout #{} cleared", armed.id);
                true
            }
            None => false,
        }
    }

    /// Claim the firing of timeout `id`. Returns false if it was cleared or
    /// replaced in the meantime.
    pub fn begin_fire(&self, id: u64) -> bool {
        let mut state = lock(&self.state);
        match &state.active {
            Some(armed) if armed.id == id && !armed.token.is_cancelled() => {
                state.active = None;
                state.triggered = true;
                state.fallback_count += 1;
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.state).active.is_some()
    }

    /// Whether a fallback has ever fired for this session
    pub fn has_triggered(&self) -> bool {
        lock(&self.state).triggered
    }

    pub fn fallback_count(&self) -> u64 {
        lock(&self.state).fallback_count
    }

    pub fn duration(&self) -> Duration {
        lock(&self.state).duration
    }

    /// Change the window used by future arms; an armed timeout keeps its own
    pub fn set_duration(&self, duration: Duration) -> TerminalResult<()> {
        if duration.is_zero() {
            return Err(TerminalError::validation("nuclear timeout must be greater than zero"));
        }
        lock(&self.state).duration = duration;
        Ok(())
    }
}
