//! Linux host adapter for custodiand
//!
//! Provides:
//! - Power source detection from sysfs
//! - Wi-Fi, Ethernet and default route sensors
//! - HTTP reachability probe and netlink change monitor
//! - Process enumeration, detached launch, SIGTERM/SIGKILL
//! - Polling event sources and a suspend/wake detector

mod adapter;
mod connectivity;
mod desktop;
mod network;
mod power;
mod process;
mod watchers;

pub use adapter::*;
pub use connectivity::*;
pub use desktop::*;
pub use network::*;
pub use power::*;
pub use process::*;
pub use watchers::*;
