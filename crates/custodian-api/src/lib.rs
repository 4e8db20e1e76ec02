//! Shared types and protocol for custodian
//!
//! This crate defines:
//! - Condition vocabulary (power source, reachability, target identity)
//! - Structured block reasons and the controller phase
//! - The read-only status snapshot
//! - IPC commands, responses and events

mod commands;
mod events;
mod types;

pub use commands::*;
pub use events::*;
pub use types::*;

/// Current API version
pub const API_VERSION: u32 = 1;
