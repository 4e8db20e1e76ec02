//! Validated settings

use crate::schema::{
    RawConfig, RawConnectivity, RawRules, RawSensors, RawServiceConfig, RawTarget, RawTiming,
    RawWatchers,
};
use crate::validation::{resolve_bool, resolve_seconds, resolve_text, ConfigIssue, SecondsRange};
use custodian_api::{PowerSource, TargetIdentity};
use custodian_util::default_socket_path;
use std::path::PathBuf;
use std::time::Duration;

/// Default reachability probe URL
pub const DEFAULT_CHECK_URL: &str = "http://connectivitycheck.gstatic.com/generate_204";

const DEBOUNCE: SecondsRange = SecondsRange::new(2.0, 0.0, 300.0);
const WAKE_DEBOUNCE: SecondsRange = SecondsRange::new(8.0, 0.0, 600.0);
const MIN_ACTION_GAP: SecondsRange = SecondsRange::new(10.0, 0.0, 3600.0);
const FORCE_KILL_TIMEOUT: SecondsRange = SecondsRange::new(10.0, 1.0, 600.0);
const VERIFY_DELAY: SecondsRange = SecondsRange::new(3.0, 0.5, 120.0);
const SAFETY_INTERVAL: SecondsRange = SecondsRange::new(60.0, 5.0, 86400.0);

const POWER_TTL: SecondsRange = SecondsRange::new(0.0, 0.0, 3600.0);
const NETWORK_TTL: SecondsRange = SecondsRange::new(5.0, 0.0, 3600.0);
const ETHERNET_TTL: SecondsRange = SecondsRange::new(5.0, 0.0, 3600.0);
const ROUTE_TTL: SecondsRange = SecondsRange::new(5.0, 0.0, 3600.0);
const REACHABILITY_TTL: SecondsRange = SecondsRange::new(30.0, 0.0, 3600.0);

const CHECK_TIMEOUT: SecondsRange = SecondsRange::new(5.0, 1.0, 60.0);

const POWER_POLL: SecondsRange = SecondsRange::new(5.0, 1.0, 600.0);
const PROCESS_POLL: SecondsRange = SecondsRange::new(2.0, 0.5, 60.0);
const REACHABILITY_POLL: SecondsRange = SecondsRange::new(30.0, 5.0, 3600.0);
const WAKE_CHECK: SecondsRange = SecondsRange::new(5.0, 1.0, 60.0);

/// Validated settings ready for use by the controller
#[derive(Debug, Clone)]
pub struct Settings {
    pub service: ServiceConfig,
    /// `None` is the valid "not configured" state
    pub target: Option<TargetIdentity>,
    pub rules: RuleConfig,
    pub timing: TimingConfig,
    pub cache: CacheTtls,
    pub connectivity: ProbeConfig,
    pub watchers: WatcherConfig,
}

impl Settings {
    /// Convert from raw config, correcting whatever is out of range
    pub fn from_raw(raw: RawConfig) -> (Self, Vec<ConfigIssue>) {
        let mut issues = Vec::new();

        let service = ServiceConfig::from_raw(raw.service, &mut issues);
        let target = convert_target(raw.target, &mut issues);
        let rules = RuleConfig::from_raw(raw.rules, &mut issues);
        let timing = TimingConfig::from_raw(raw.timing, &mut issues);
        let cache = CacheTtls::from_raw(raw.sensors, &mut issues);
        let connectivity = ProbeConfig::from_raw(raw.connectivity, &mut issues);
        let watchers = WatcherConfig::from_raw(raw.watchers, &mut issues);

        let settings = Self {
            service,
            target,
            rules,
            timing,
            cache,
            connectivity,
            watchers,
        };

        (settings, issues)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            target: None,
            rules: RuleConfig::default(),
            timing: TimingConfig::default(),
            cache: CacheTtls::default(),
            connectivity: ProbeConfig::default(),
            watchers: WatcherConfig::default(),
        }
    }
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub socket_path: PathBuf,
    pub automation_enabled: bool,
}

impl ServiceConfig {
    fn from_raw(raw: RawServiceConfig, issues: &mut Vec<ConfigIssue>) -> Self {
        Self {
            socket_path: resolve_text(
                "service.socket_path",
                raw.socket_path.as_ref(),
                "the runtime directory socket",
                issues,
            )
            .unwrap_or_else(default_socket_path),
            automation_enabled: resolve_bool(
                "service.automation_enabled",
                raw.automation_enabled.as_ref(),
                true,
                issues,
            ),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            automation_enabled: true,
        }
    }
}

fn convert_target(raw: RawTarget, issues: &mut Vec<ConfigIssue>) -> Option<TargetIdentity> {
    let identifier = resolve_text("target.identifier", raw.identifier.as_ref(), "none", issues);
    let name = resolve_text("target.name", raw.name.as_ref(), "none", issues);
    let target = TargetIdentity::from_parts(identifier.as_deref(), name.as_deref())?;

    if let TargetIdentity::Identifier(id) = &target {
        if !target.looks_well_formed() {
            issues.push(ConfigIssue::MalformedIdentifier(id.clone()));
        }
        if let Some(name) = name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            issues.push(ConfigIssue::NameIgnored(name.to_string()));
        }
    }

    Some(target)
}

/// Conditions under which the target may run.
///
/// Immutable for the duration of one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleConfig {
    /// `None` means any power source
    pub required_power_source: Option<PowerSource>,
    /// `None` means any non-empty network
    pub required_network: Option<String>,
    pub require_ethernet_only: bool,
    pub allow_ethernet_fallback: bool,
    pub require_ethernet_default_route: bool,
}

impl RuleConfig {
    fn from_raw(raw: RawRules, issues: &mut Vec<ConfigIssue>) -> Self {
        let required_power_source = resolve_text(
            "rules.required_power_source",
            raw.required_power_source.as_ref(),
            "any",
            issues,
        );
        let required_network = resolve_text(
            "rules.required_network",
            raw.required_network.as_ref(),
            "any",
            issues,
        );

        let required_power_source = required_power_source
            .as_deref()
            .map(str::trim)
            .filter(|s| {
                !s.is_empty() && !s.eq_ignore_ascii_case("none") && !s.eq_ignore_ascii_case("any")
            })
            .map(PowerSource::parse);

        if let Some(source) = &required_power_source {
            if !source.is_canonical() {
                issues.push(ConfigIssue::NonCanonicalPowerSource(source.label().to_string()));
            }
        }

        let rules = Self {
            required_power_source,
            required_network: normalize_network(required_network.as_deref()),
            require_ethernet_only: resolve_bool(
                "rules.require_ethernet_only",
                raw.require_ethernet_only.as_ref(),
                false,
                issues,
            ),
            allow_ethernet_fallback: resolve_bool(
                "rules.allow_ethernet_fallback",
                raw.allow_ethernet_fallback.as_ref(),
                false,
                issues,
            ),
            require_ethernet_default_route: resolve_bool(
                "rules.require_ethernet_default_route",
                raw.require_ethernet_default_route.as_ref(),
                false,
                issues,
            ),
        };

        if let (true, Some(network)) = (rules.require_ethernet_only, &rules.required_network) {
            issues.push(ConfigIssue::NetworkIgnoredInEthernetOnly(network.clone()));
        }

        rules
    }
}

/// Trim a network name; blank means "any network"
pub fn normalize_network(network: Option<&str>) -> Option<String> {
    network
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Scheduler and orchestrator timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingConfig {
    /// Default delay between a trigger and the evaluation it schedules
    pub debounce: Duration,
    /// Delay used for system wake triggers
    pub wake_debounce: Duration,
    /// Minimum time between two physical actions
    pub min_action_gap: Duration,
    /// Time between graceful quit and forced kill
    pub force_kill_timeout: Duration,
    /// Delay before re-checking an action's outcome
    pub verify_delay: Duration,
    /// Periodic safety evaluation interval
    pub safety_interval: Duration,
}

impl TimingConfig {
    fn from_raw(raw: RawTiming, issues: &mut Vec<ConfigIssue>) -> Self {
        Self {
            debounce: resolve_seconds(
                "timing.debounce_seconds",
                raw.debounce_seconds.as_ref(),
                DEBOUNCE,
                issues,
            ),
            wake_debounce: resolve_seconds(
                "timing.wake_debounce_seconds",
                raw.wake_debounce_seconds.as_ref(),
                WAKE_DEBOUNCE,
                issues,
            ),
            min_action_gap: resolve_seconds(
                "timing.min_action_gap_seconds",
                raw.min_action_gap_seconds.as_ref(),
                MIN_ACTION_GAP,
                issues,
            ),
            force_kill_timeout: resolve_seconds(
                "timing.force_kill_timeout_seconds",
                raw.force_kill_timeout_seconds.as_ref(),
                FORCE_KILL_TIMEOUT,
                issues,
            ),
            verify_delay: resolve_seconds(
                "timing.verify_delay_seconds",
                raw.verify_delay_seconds.as_ref(),
                VERIFY_DELAY,
                issues,
            ),
            safety_interval: resolve_seconds(
                "timing.safety_interval_seconds",
                raw.safety_interval_seconds.as_ref(),
                SAFETY_INTERVAL,
                issues,
            ),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            debounce: DEBOUNCE.default_duration(),
            wake_debounce: WAKE_DEBOUNCE.default_duration(),
            min_action_gap: MIN_ACTION_GAP.default_duration(),
            force_kill_timeout: FORCE_KILL_TIMEOUT.default_duration(),
            verify_delay: VERIFY_DELAY.default_duration(),
            safety_interval: SAFETY_INTERVAL.default_duration(),
        }
    }
}

/// Per-sensor cache lifetimes; zero means always refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub power: Duration,
    pub network: Duration,
    pub ethernet: Duration,
    pub route: Duration,
    pub reachability: Duration,
}

impl CacheTtls {
    fn from_raw(raw: RawSensors, issues: &mut Vec<ConfigIssue>) -> Self {
        Self {
            power: resolve_seconds(
                "sensors.power_ttl_seconds",
                raw.power_ttl_seconds.as_ref(),
                POWER_TTL,
                issues,
            ),
            network: resolve_seconds(
                "sensors.network_ttl_seconds",
                raw.network_ttl_seconds.as_ref(),
                NETWORK_TTL,
                issues,
            ),
            ethernet: resolve_seconds(
                "sensors.ethernet_ttl_seconds",
                raw.ethernet_ttl_seconds.as_ref(),
                ETHERNET_TTL,
                issues,
            ),
            route: resolve_seconds(
                "sensors.route_ttl_seconds",
                raw.route_ttl_seconds.as_ref(),
                ROUTE_TTL,
                issues,
            ),
            reachability: resolve_seconds(
                "sensors.reachability_ttl_seconds",
                raw.reachability_ttl_seconds.as_ref(),
                REACHABILITY_TTL,
                issues,
            ),
        }
    }

    /// Every sensor re-read on every evaluation
    pub fn always_refresh() -> Self {
        Self {
            power: Duration::ZERO,
            network: Duration::ZERO,
            ethernet: Duration::ZERO,
            route: Duration::ZERO,
            reachability: Duration::ZERO,
        }
    }
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            power: POWER_TTL.default_duration(),
            network: NETWORK_TTL.default_duration(),
            ethernet: ETHERNET_TTL.default_duration(),
            route: ROUTE_TTL.default_duration(),
            reachability: REACHABILITY_TTL.default_duration(),
        }
    }
}

/// Reachability probe settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub check_url: String,
    pub check_timeout: Duration,
}

impl ProbeConfig {
    fn from_raw(raw: RawConnectivity, issues: &mut Vec<ConfigIssue>) -> Self {
        let check_url = resolve_text(
            "connectivity.check_url",
            raw.check_url.as_ref(),
            DEFAULT_CHECK_URL,
            issues,
        );
        let check_url = match check_url.as_deref().map(str::trim) {
            None => DEFAULT_CHECK_URL.to_string(),
            Some("") => {
                issues.push(ConfigIssue::EmptyCheckUrl(DEFAULT_CHECK_URL.to_string()));
                DEFAULT_CHECK_URL.to_string()
            }
            Some(url) => url.to_string(),
        };

        Self {
            check_url,
            check_timeout: resolve_seconds(
                "connectivity.check_timeout_seconds",
                raw.check_timeout_seconds.as_ref(),
                CHECK_TIMEOUT,
                issues,
            ),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            check_url: DEFAULT_CHECK_URL.to_string(),
            check_timeout: CHECK_TIMEOUT.default_duration(),
        }
    }
}

/// Event source poll intervals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherConfig {
    pub power_poll: Duration,
    pub process_poll: Duration,
    pub reachability_poll: Duration,
    pub wake_check: Duration,
}

impl WatcherConfig {
    fn from_raw(raw: RawWatchers, issues: &mut Vec<ConfigIssue>) -> Self {
        Self {
            power_poll: resolve_seconds(
                "watchers.power_poll_seconds",
                raw.power_poll_seconds.as_ref(),
                POWER_POLL,
                issues,
            ),
            process_poll: resolve_seconds(
                "watchers.process_poll_seconds",
                raw.process_poll_seconds.as_ref(),
                PROCESS_POLL,
                issues,
            ),
            reachability_poll: resolve_seconds(
                "watchers.reachability_poll_seconds",
                raw.reachability_poll_seconds.as_ref(),
                REACHABILITY_POLL,
                issues,
            ),
            wake_check: resolve_seconds(
                "watchers.wake_check_seconds",
                raw.wake_check_seconds.as_ref(),
                WAKE_CHECK,
                issues,
            ),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            power_poll: POWER_POLL.default_duration(),
            process_poll: PROCESS_POLL.default_duration(),
            reachability_poll: REACHABILITY_POLL.default_duration(),
            wake_check: WAKE_CHECK.default_duration(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_config;

    #[test]
    fn empty_power_requirement_means_any() {
        let loaded = parse_config(
            r#"
            config_version = 1
            [rules]
            required_power_source = "  "
            "#,
        )
        .unwrap();
        assert_eq!(loaded.settings.rules.required_power_source, None);
    }

    #[test]
    fn non_canonical_power_label_is_accepted_and_flagged() {
        let loaded = parse_config(
            r#"
            config_version = 1
            [rules]
            required_power_source = "Solar"
            "#,
        )
        .unwrap();
        assert_eq!(
            loaded.settings.rules.required_power_source,
            Some(PowerSource::Other("Solar".into()))
        );
        assert_eq!(
            loaded.issues,
            vec![ConfigIssue::NonCanonicalPowerSource("Solar".into())]
        );
    }

    #[test]
    fn canonical_power_label_is_case_insensitive() {
        let loaded = parse_config(
            r#"
            config_version = 1
            [rules]
            required_power_source = "ac power"
            "#,
        )
        .unwrap();
        assert_eq!(loaded.settings.rules.required_power_source, Some(PowerSource::Ac));
        assert!(loaded.issues.is_empty());
    }

    #[test]
    fn malformed_identifier_is_kept() {
        let loaded = parse_config(
            r#"
            config_version = 1
            [target]
            identifier = "not an id"
            name = "agent"
            "#,
        )
        .unwrap();
        assert_eq!(
            loaded.settings.target,
            Some(TargetIdentity::Identifier("not an id".into()))
        );
        assert!(loaded
            .issues
            .contains(&ConfigIssue::MalformedIdentifier("not an id".into())));
        assert!(loaded.issues.contains(&ConfigIssue::NameIgnored("agent".into())));
    }

    #[test]
    fn timing_is_clamped() {
        let loaded = parse_config(
            r#"
            config_version = 1
            [timing]
            force_kill_timeout_seconds = 0
            min_action_gap_seconds = -5
            "#,
        )
        .unwrap();
        assert_eq!(loaded.settings.timing.force_kill_timeout, Duration::from_secs(1));
        assert_eq!(loaded.settings.timing.min_action_gap, Duration::ZERO);
        assert_eq!(loaded.issues.len(), 2);
    }

    #[test]
    fn blank_network_means_any() {
        assert_eq!(normalize_network(Some("   ")), None);
        assert_eq!(normalize_network(Some(" HomeNet ")), Some("HomeNet".into()));
    }

    #[test]
    fn ethernet_only_flags_unused_network() {
        let loaded = parse_config(
            r#"
            config_version = 1
            [rules]
            require_ethernet_only = true
            required_network = "HomeNet"
            "#,
        )
        .unwrap();
        assert!(loaded.settings.rules.require_ethernet_only);
        assert_eq!(
            loaded.issues,
            vec![ConfigIssue::NetworkIgnoredInEthernetOnly("HomeNet".into())]
        );
    }

    #[test]
    fn empty_check_url_is_defaulted() {
        let loaded = parse_config(
            r#"
            config_version = 1
            [connectivity]
            check_url = ""
            "#,
        )
        .unwrap();
        assert_eq!(loaded.settings.connectivity.check_url, DEFAULT_CHECK_URL);
        assert_eq!(loaded.issues.len(), 1);
    }

    #[test]
    fn wrong_typed_text_settings_fall_back() {
        let loaded = parse_config(
            r#"
            config_version = 1
            [service]
            socket_path = 7
            [target]
            name = 42
            [rules]
            required_power_source = true
            required_network = 5
            [connectivity]
            check_url = 1
            "#,
        )
        .unwrap();

        let settings = &loaded.settings;
        assert_eq!(settings.service.socket_path, default_socket_path());
        assert_eq!(settings.target, None);
        assert_eq!(settings.rules, RuleConfig::default());
        assert_eq!(settings.connectivity.check_url, DEFAULT_CHECK_URL);

        let keys: Vec<&str> = loaded
            .issues
            .iter()
            .filter_map(|issue| match issue {
                ConfigIssue::WrongType { key, .. } => Some(*key),
                _ => None,
            })
            .collect();
        assert_eq!(
            keys,
            vec![
                "service.socket_path",
                "target.name",
                "rules.required_power_source",
                "rules.required_network",
                "connectivity.check_url",
            ]
        );
    }

    #[test]
    fn wrong_typed_name_does_not_hide_identifier() {
        let loaded = parse_config(
            r#"
            config_version = 1
            [target]
            identifier = "org.example.SyncAgent"
            name = 42
            "#,
        )
        .unwrap();
        assert_eq!(
            loaded.settings.target,
            Some(TargetIdentity::Identifier("org.example.SyncAgent".into()))
        );
        assert_eq!(loaded.issues.len(), 1);
    }
}
