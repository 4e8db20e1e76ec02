//! Shared types for the custodian API

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Canonical label for mains power
pub const AC_POWER: &str = "AC Power";
/// Canonical label for battery power
pub const BATTERY_POWER: &str = "Battery Power";
/// Canonical label for an uninterruptible power supply
pub const UPS_POWER: &str = "UPS Power";

/// Power source, as reported by the host or required by the rules.
///
/// Labels are matched case-insensitively; `"AC"`, `"ac power"` and
/// `"AC Power"` all parse to [`PowerSource::Ac`]. Labels outside the
/// canonical set are kept verbatim in [`PowerSource::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PowerSource {
    Ac,
    Battery,
    Ups,
    Other(String),
    Unknown,
}

impl PowerSource {
    pub fn parse(label: &str) -> Self {
        let trimmed = label.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" | "unknown" => PowerSource::Unknown,
            "ac" | "ac power" => PowerSource::Ac,
            "battery" | "battery power" => PowerSource::Battery,
            "ups" | "ups power" => PowerSource::Ups,
            _ => PowerSource::Other(trimmed.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            PowerSource::Ac => AC_POWER,
            PowerSource::Battery => BATTERY_POWER,
            PowerSource::Ups => UPS_POWER,
            PowerSource::Other(label) => label,
            PowerSource::Unknown => "unknown",
        }
    }

    /// One of AC Power, Battery Power or UPS Power
    pub fn is_canonical(&self) -> bool {
        matches!(self, PowerSource::Ac | PowerSource::Battery | PowerSource::Ups)
    }

    /// Whether this (current) source meets `required`.
    ///
    /// An unknown current source never satisfies anything.
    pub fn satisfies(&self, required: &PowerSource) -> bool {
        match (self, required) {
            (PowerSource::Unknown, _) | (_, PowerSource::Unknown) => false,
            (PowerSource::Other(current), PowerSource::Other(required)) => {
                current.eq_ignore_ascii_case(required)
            }
            (current, required) => current == required,
        }
    }
}

impl From<String> for PowerSource {
    fn from(label: String) -> Self {
        PowerSource::parse(&label)
    }
}

impl From<PowerSource> for String {
    fn from(source: PowerSource) -> Self {
        source.label().to_string()
    }
}

impl fmt::Display for PowerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Internet reachability tri-state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    Reachable,
    Unreachable,
    Unknown,
}

impl Reachability {
    pub fn from_option(value: Option<bool>) -> Self {
        match value {
            Some(true) => Reachability::Reachable,
            Some(false) => Reachability::Unreachable,
            None => Reachability::Unknown,
        }
    }

    /// Only a definitive positive answer counts
    pub fn is_reachable(self) -> bool {
        self == Reachability::Reachable
    }

    pub fn label(self) -> &'static str {
        match self {
            Reachability::Reachable => "reachable",
            Reachability::Unreachable => "unreachable",
            Reachability::Unknown => "unknown",
        }
    }
}

/// The one process custodian manages.
///
/// An identifier (reverse-domain application id such as
/// `org.example.SyncAgent`) always wins over a plain process name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TargetIdentity {
    Identifier(String),
    Name(String),
}

impl TargetIdentity {
    /// Build a target from the two optional settings.
    ///
    /// Blank values are ignored. Returns `None` when neither is set, which is
    /// the valid "not configured" state.
    pub fn from_parts(identifier: Option<&str>, name: Option<&str>) -> Option<Self> {
        let identifier = identifier.map(str::trim).filter(|s| !s.is_empty());
        let name = name.map(str::trim).filter(|s| !s.is_empty());

        match (identifier, name) {
            (Some(id), _) => Some(TargetIdentity::Identifier(id.to_string())),
            (None, Some(name)) => Some(TargetIdentity::Name(name.to_string())),
            (None, None) => None,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            TargetIdentity::Identifier(id) => id,
            TargetIdentity::Name(name) => name,
        }
    }

    pub fn is_identifier(&self) -> bool {
        matches!(self, TargetIdentity::Identifier(_))
    }

    /// Shallow syntax check. Launch is attempted even when this fails.
    pub fn looks_well_formed(&self) -> bool {
        match self {
            TargetIdentity::Identifier(id) => {
                let segments: Vec<&str> = id.split('.').collect();
                segments.len() >= 2
                    && segments.iter().all(|s| {
                        !s.is_empty()
                            && s.chars()
                                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
                    })
            }
            TargetIdentity::Name(name) => !name.contains('/'),
        }
    }
}

impl fmt::Display for TargetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetIdentity::Identifier(id) => write!(f, "{}", id),
            TargetIdentity::Name(name) => write!(f, "\"{}\"", name),
        }
    }
}

/// Wired link state as seen by the sensors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthernetStatus {
    /// An Ethernet interface has carrier and a routable IPv4 address
    pub active: bool,
    /// The interface that satisfied the check
    pub interface: Option<String>,
    pub ipv4: Option<Ipv4Addr>,
}

impl EthernetStatus {
    pub fn inactive() -> Self {
        Self::default()
    }

    pub fn active(interface: impl Into<String>, ipv4: Ipv4Addr) -> Self {
        Self {
            active: true,
            interface: Some(interface.into()),
            ipv4: Some(ipv4),
        }
    }
}

/// One coherent reading of every sensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub power_source: PowerSource,
    /// Wireless network name; `None` when disconnected or unreadable
    pub network_identity: Option<String>,
    pub ethernet: EthernetStatus,
    pub default_route_interface: Option<String>,
    pub reachability: Reachability,
}

impl SensorSnapshot {
    /// Snapshot in which nothing is known
    pub fn unknown() -> Self {
        Self {
            power_source: PowerSource::Unknown,
            network_identity: None,
            ethernet: EthernetStatus::inactive(),
            default_route_interface: None,
            reachability: Reachability::Unknown,
        }
    }

    /// Observed facts for diagnostics, e.g.
    /// `power=AC Power, network=HomeNet, ethernet=none, route=wlan0, internet=reachable`
    pub fn facts(&self) -> String {
        format!(
            "power={}, network={}, ethernet={}, route={}, internet={}",
            self.power_source,
            self.network_identity.as_deref().unwrap_or("none"),
            if self.ethernet.active {
                self.ethernet.interface.as_deref().unwrap_or("active")
            } else {
                "none"
            },
            self.default_route_interface.as_deref().unwrap_or("none"),
            self.reachability.label(),
        )
    }
}

/// Structured reason why the target must not run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum BlockReason {
    NotConfigured,
    PowerMismatch {
        required: PowerSource,
        current: PowerSource,
    },
    Unreachable,
    ReachabilityUnknown,
    EthernetInactive,
    DefaultRouteMismatch {
        ethernet: String,
        route: Option<String>,
    },
    NetworkMismatch {
        required: String,
        current: Option<String>,
    },
    NoNetwork,
}

impl BlockReason {
    pub fn summary(&self) -> String {
        match self {
            BlockReason::NotConfigured => "not configured".to_string(),
            BlockReason::PowerMismatch { required, current } => {
                format!("power source is {}, requires {}", current, required)
            }
            BlockReason::Unreachable => "internet unreachable".to_string(),
            BlockReason::ReachabilityUnknown => "internet reachability unknown".to_string(),
            BlockReason::EthernetInactive => "ethernet required but not active".to_string(),
            BlockReason::DefaultRouteMismatch { ethernet, route } => format!(
                "default route is on {}, not ethernet {}",
                route.as_deref().unwrap_or("no interface"),
                ethernet
            ),
            BlockReason::NetworkMismatch { required, current } => format!(
                "network {} is not trusted network {}",
                current.as_deref().unwrap_or("none"),
                required
            ),
            BlockReason::NoNetwork => "no network connection".to_string(),
        }
    }
}

/// Where the controller stands with respect to the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerPhase {
    /// No target identity configured
    Unconfigured,
    /// Target configured but automation switched off
    Disabled,
    /// Evaluation scheduled or in progress
    Evaluating,
    /// Conditions allow and the target is running
    RunningAllowed,
    /// Conditions allow; launch issued or deferred
    WaitingToLaunch,
    /// Conditions block; graceful quit in flight
    RunningBlocked,
    /// Graceful quit sent; forced kill armed
    ForceKillPending,
    /// Conditions block and the target is stopped
    StoppedBlocked,
}

impl ControllerPhase {
    /// Desired and observed state agree; nothing to do until the next trigger
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            ControllerPhase::RunningAllowed | ControllerPhase::StoppedBlocked
        )
    }
}

impl fmt::Display for ControllerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ControllerPhase::Unconfigured => "unconfigured",
            ControllerPhase::Disabled => "disabled",
            ControllerPhase::Evaluating => "evaluating",
            ControllerPhase::RunningAllowed => "running (allowed)",
            ControllerPhase::WaitingToLaunch => "waiting to launch",
            ControllerPhase::RunningBlocked => "running (blocked, quit requested)",
            ControllerPhase::ForceKillPending => "running (blocked, forced kill pending)",
            ControllerPhase::StoppedBlocked => "stopped (blocked)",
        };
        write!(f, "{}", label)
    }
}

/// Physical action taken on the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Launch,
    GracefulQuit,
    ForceKill,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ActionKind::Launch => "launch",
            ActionKind::GracefulQuit => "graceful quit",
            ActionKind::ForceKill => "force kill",
        };
        write!(f, "{}", label)
    }
}

/// Outcome of the most recent physical action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub kind: ActionKind,
    pub at: DateTime<Local>,
    pub pid: Option<u32>,
    /// The host primitive accepted the request
    pub accepted: bool,
    /// Result of the delayed re-check; `None` until it runs
    pub verified: Option<bool>,
    pub detail: Option<String>,
}

/// Forced kill waiting for its deadline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingForceKillView {
    pub pid: u32,
    pub deadline: DateTime<Local>,
}

/// Read-only view of the controller, as exposed to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub api_version: u32,
    pub automation_enabled: bool,
    pub target: Option<TargetIdentity>,
    pub required_network: Option<String>,
    pub phase: ControllerPhase,
    /// `None` until the first evaluation completes
    pub desired_run: Option<bool>,
    pub observed_run: bool,
    pub last_reason: String,
    pub last_block: Option<BlockReason>,
    pub last_trigger: Option<String>,
    pub last_evaluation_at: Option<DateTime<Local>>,
    pub sensors: Option<SensorSnapshot>,
    pub last_action: Option<ActionRecord>,
    pub pending_force_kill: Option<PendingForceKillView>,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_source_parses_case_insensitively() {
        assert_eq!(PowerSource::parse("ac power"), PowerSource::Ac);
        assert_eq!(PowerSource::parse("AC"), PowerSource::Ac);
        assert_eq!(PowerSource::parse(" Battery Power "), PowerSource::Battery);
        assert_eq!(PowerSource::parse("UPS"), PowerSource::Ups);
        assert_eq!(PowerSource::parse(""), PowerSource::Unknown);
    }

    #[test]
    fn non_canonical_power_label_is_kept() {
        let source = PowerSource::parse("Solar");
        assert_eq!(source, PowerSource::Other("Solar".into()));
        assert!(!source.is_canonical());
        assert!(source.satisfies(&PowerSource::parse("solar")));
    }

    #[test]
    fn unknown_power_never_satisfies() {
        assert!(!PowerSource::Unknown.satisfies(&PowerSource::Ac));
        assert!(!PowerSource::Ac.satisfies(&PowerSource::Unknown));
        assert!(PowerSource::Ac.satisfies(&PowerSource::Ac));
        assert!(!PowerSource::Battery.satisfies(&PowerSource::Ac));
    }

    #[test]
    fn power_source_serializes_as_label() {
        let json = serde_json::to_string(&PowerSource::Ups).unwrap();
        assert_eq!(json, "\"UPS Power\"");
        let parsed: PowerSource = serde_json::from_str("\"battery\"").unwrap();
        assert_eq!(parsed, PowerSource::Battery);
    }

    #[test]
    fn identifier_takes_precedence_over_name() {
        let target = TargetIdentity::from_parts(Some("org.example.Agent"), Some("agent"));
        assert_eq!(
            target,
            Some(TargetIdentity::Identifier("org.example.Agent".into()))
        );

        let target = TargetIdentity::from_parts(Some("  "), Some("agent"));
        assert_eq!(target, Some(TargetIdentity::Name("agent".into())));

        assert_eq!(TargetIdentity::from_parts(None, Some("")), None);
    }

    #[test]
    fn identifier_shape_check() {
        assert!(TargetIdentity::Identifier("org.example.Agent".into()).looks_well_formed());
        assert!(!TargetIdentity::Identifier("agent".into()).looks_well_formed());
        assert!(!TargetIdentity::Identifier("org..Agent".into()).looks_well_formed());
    }

    #[test]
    fn facts_include_every_sensor() {
        let snapshot = SensorSnapshot {
            power_source: PowerSource::Ac,
            network_identity: Some("HomeNet".into()),
            ethernet: EthernetStatus::inactive(),
            default_route_interface: Some("wlan0".into()),
            reachability: Reachability::Reachable,
        };
        assert_eq!(
            snapshot.facts(),
            "power=AC Power, network=HomeNet, ethernet=none, route=wlan0, internet=reachable"
        );
    }

    #[test]
    fn block_reason_serialization() {
        let reason = BlockReason::DefaultRouteMismatch {
            ethernet: "eth0".into(),
            route: Some("wlan0".into()),
        };
        let json = serde_json::to_string(&reason).unwrap();
        assert!(json.contains("\"code\":\"default_route_mismatch\""));
        let parsed: BlockReason = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, reason);
    }
}
