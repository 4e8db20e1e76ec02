//! Host trait interfaces for custodian
//!
//! This crate defines the interface between the controller core and
//! platform-specific implementations: sensor reads, process control and
//! event sources. It contains no platform code itself.

mod handle;
mod mock;
mod traits;

pub use handle::*;
pub use mock::*;
pub use traits::*;
