//! Snare Common - types shared by the daemon and the control CLI.

pub mod config;
pub mod decoy;
pub mod error;
pub mod event_log;
pub mod state_store;

pub use config::Config;
pub use decoy::{ActualState, DecoyKind, DesiredState};
pub use error::SnareError;
pub use event_log::{EventLevel, EventRecord};
pub use state_store::{
    atomic_write, DecoyEntry, DesiredStateRecord, FileStateStore, MemoryStateStore, StateStore,
};
