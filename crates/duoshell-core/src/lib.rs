// Session coordination core
//
// One shell session, two command sources: the interactive operator and the
// programmatic agent. This crate serializes their commands, attributes
// cancellation to the source that issued it, recovers wedged sessions, and
// formats output once for every observer.

pub mod background;
pub mod config;
pub mod coordinator;
pub mod executor;
pub mod nuclear;
mod recovery;
pub mod ring_buffer;
pub mod session;
pub mod signal;
pub mod state;
pub mod store;
pub mod unifier;

use std::sync::{Mutex, MutexGuard};

// Re-export public API
pub use background::BackgroundTaskRegistry;
pub use config::CoreConfig;
pub use coordinator::TerminalCoordinator;
pub use executor::{BusyPolicy, SubmitOptions};
pub use nuclear::NuclearController;
pub use ring_buffer::{CommandRingBuffer, RingEntry};
pub use session::{SessionSettings, TerminalSession};
pub use signal::Signal;
pub use state::TerminalStateManager;
pub use store::SessionStore;
pub use unifier::{format_output, OutputUnifier, Subscription};

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
