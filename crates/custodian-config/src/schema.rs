//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    #[serde(default)]
    pub service: RawServiceConfig,

    /// The managed process
    #[serde(default)]
    pub target: RawTarget,

    /// Conditions under which the target may run
    #[serde(default)]
    pub rules: RawRules,

    #[serde(default)]
    pub timing: RawTiming,

    /// Sensor cache lifetimes
    #[serde(default)]
    pub sensors: RawSensors,

    #[serde(default)]
    pub connectivity: RawConnectivity,

    /// Poll intervals for the event sources
    #[serde(default)]
    pub watchers: RawWatchers,
}

/// A scalar setting that may have been written with the wrong type.
///
/// Anything that does not deserialize as `T` is kept as the raw TOML value
/// so validation can report it and fall back to the default.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RawSetting<T> {
    Value(T),
    Invalid(toml::Value),
}

/// Service-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServiceConfig {
    /// IPC socket path (default: $XDG_RUNTIME_DIR/custodian/custodian.sock)
    pub socket_path: Option<RawSetting<PathBuf>>,

    /// Whether the controller acts at all (default: true)
    pub automation_enabled: Option<RawSetting<bool>>,
}

/// Target identity. `identifier` wins when both are set.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawTarget {
    /// Reverse-domain application id, e.g. "org.example.SyncAgent"
    pub identifier: Option<RawSetting<String>>,

    /// Process name, e.g. "sync-agent"
    pub name: Option<RawSetting<String>>,
}

/// Launch rules
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawRules {
    /// "AC Power", "Battery Power", "UPS Power", or empty for any
    pub required_power_source: Option<RawSetting<String>>,

    /// Trusted wireless network name, or empty for any
    pub required_network: Option<RawSetting<String>>,

    /// Only run on a wired connection
    pub require_ethernet_only: Option<RawSetting<bool>>,

    /// Accept a wired connection when the network name does not match
    pub allow_ethernet_fallback: Option<RawSetting<bool>>,

    /// The wired interface must also carry the default route
    pub require_ethernet_default_route: Option<RawSetting<bool>>,
}

/// Scheduler and orchestrator timing, in seconds
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawTiming {
    pub debounce_seconds: Option<RawSetting<f64>>,
    pub wake_debounce_seconds: Option<RawSetting<f64>>,
    pub min_action_gap_seconds: Option<RawSetting<f64>>,
    pub force_kill_timeout_seconds: Option<RawSetting<f64>>,
    pub verify_delay_seconds: Option<RawSetting<f64>>,
    pub safety_interval_seconds: Option<RawSetting<f64>>,
}

/// Sensor cache TTLs in seconds (0 = always refresh)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawSensors {
    pub power_ttl_seconds: Option<RawSetting<f64>>,
    pub network_ttl_seconds: Option<RawSetting<f64>>,
    pub ethernet_ttl_seconds: Option<RawSetting<f64>>,
    pub route_ttl_seconds: Option<RawSetting<f64>>,
    pub reachability_ttl_seconds: Option<RawSetting<f64>>,
}

/// Internet reachability probe
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawConnectivity {
    /// URL expected to answer 204 or 2xx
    pub check_url: Option<RawSetting<String>>,
    pub check_timeout_seconds: Option<RawSetting<f64>>,
}

/// Event source poll intervals in seconds
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawWatchers {
    pub power_poll_seconds: Option<RawSetting<f64>>,
    pub process_poll_seconds: Option<RawSetting<f64>>,
    pub reachability_poll_seconds: Option<RawSetting<f64>>,
    pub wake_check_seconds: Option<RawSetting<f64>>,
}
