//! Shared utilities for custodian
//!
//! This crate provides:
//! - Client identifiers for the control socket
//! - Wall-clock helpers and seconds/duration conversion
//! - Error types
//! - The minimum-gap action throttle
//! - Default paths for the socket and configuration file

mod error;
mod ids;
mod paths;
mod throttle;
mod time;

pub use error::*;
pub use ids::*;
pub use paths::*;
pub use throttle::*;
pub use time::*;
