//! Process handles and interface details

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Identity of one process instance.
///
/// The PID alone is not enough: once a process exits its PID can be handed
/// to an unrelated process. The start time (seconds since boot on Linux)
/// distinguishes the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub start_time: u64,
}

impl ProcessIdentity {
    pub fn new(pid: u32, start_time: u64) -> Self {
        Self { pid, start_time }
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pid, self.start_time)
    }
}

/// A running process that matched the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    identity: ProcessIdentity,

    /// Process name as reported by the host
    pub name: String,
}

impl ProcessHandle {
    pub fn new(identity: ProcessIdentity, name: impl Into<String>) -> Self {
        Self {
            identity,
            name: name.into(),
        }
    }

    pub fn identity(&self) -> ProcessIdentity {
        self.identity
    }

    pub fn pid(&self) -> u32 {
        self.identity.pid
    }
}

/// What the host knows about one candidate Ethernet interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDetails {
    pub name: String,

    /// Any IPv4 address is assigned, link-local included
    pub has_ipv4: bool,

    /// Wireless hardware presenting itself as an Ethernet device
    pub wireless_emulated: bool,

    /// First routable IPv4 address, if any
    pub ipv4: Option<Ipv4Addr>,
}

impl InterfaceDetails {
    /// Routable IPv4 on real wired hardware.
    ///
    /// Link-local (169.254/16) addresses never count.
    pub fn usable_ipv4(&self) -> Option<Ipv4Addr> {
        if self.wireless_emulated || !self.has_ipv4 {
            return None;
        }
        self.ipv4
            .filter(|ip| !ip.is_link_local() && !ip.is_unspecified() && !ip.is_loopback())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(ipv4: Option<Ipv4Addr>, wireless_emulated: bool) -> InterfaceDetails {
        InterfaceDetails {
            name: "eth0".into(),
            has_ipv4: ipv4.is_some(),
            wireless_emulated,
            ipv4,
        }
    }

    #[test]
    fn link_local_is_not_usable() {
        let d = details(Some(Ipv4Addr::new(169, 254, 10, 2)), false);
        assert_eq!(d.usable_ipv4(), None);
    }

    #[test]
    fn wireless_emulation_is_not_usable() {
        let d = details(Some(Ipv4Addr::new(192, 168, 1, 20)), true);
        assert_eq!(d.usable_ipv4(), None);
    }

    #[test]
    fn routable_address_is_usable() {
        let ip = Ipv4Addr::new(10, 0, 0, 7);
        assert_eq!(details(Some(ip), false).usable_ipv4(), Some(ip));
    }

    #[test]
    fn handle_serialization() {
        let handle = ProcessHandle::new(ProcessIdentity::new(1234, 99), "sync-agent");
        let json = serde_json::to_string(&handle).unwrap();
        let parsed: ProcessHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.identity(), handle.identity());
        assert_eq!(parsed.pid(), 1234);
    }
}
