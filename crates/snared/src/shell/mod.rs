//! Windows command prompt emulation for the shell decoy.
//!
//! - [`vfs`]: fixed per-identity directory tree
//! - [`session`]: per-connection state and command dispatch
//! - [`canned`]: static text blocks

pub mod canned;
pub mod session;
pub mod vfs;

pub use session::{CommandOutcome, HostProfile, ShellSession};
pub use vfs::VirtualFilesystem;
