//! Snare control surface library - exposes modules for testing.

pub mod cli;
pub mod commands;
pub mod output;
