//! Snare daemon library - exposes modules for testing.

pub mod daemon;
pub mod decoys;
pub mod events;
pub mod shell;
pub mod supervisor;
