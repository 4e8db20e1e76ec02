//! Configuration validation
//!
//! Nothing here rejects a configuration. Every problem is corrected (clamped
//! or defaulted) and reported as a [`ConfigIssue`] so the controller always
//! starts with usable settings.

use crate::schema::{RawConfig, RawSetting};
use crate::settings::Settings;
use custodian_util::seconds_to_duration;
use std::time::Duration;
use thiserror::Error;

/// A corrected configuration problem
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigIssue {
    #[error("{key} = {value} is outside {min}..={max}, clamped to {clamped}")]
    OutOfRange {
        key: &'static str,
        value: f64,
        min: f64,
        max: f64,
        clamped: f64,
    },

    #[error("{key} has the wrong type ({found}), using default {default}")]
    WrongType {
        key: &'static str,
        found: String,
        default: String,
    },

    #[error("Power source '{0}' is not one of AC Power, Battery Power, UPS Power")]
    NonCanonicalPowerSource(String),

    #[error("Target identifier '{0}' is not a reverse-domain id; launch will still be attempted")]
    MalformedIdentifier(String),

    #[error("Both identifier and name are set; name '{0}' is ignored")]
    NameIgnored(String),

    #[error("connectivity.check_url is empty, using {0}")]
    EmptyCheckUrl(String),

    #[error("required_network '{0}' has no effect while require_ethernet_only is set")]
    NetworkIgnoredInEthernetOnly(String),

    #[error("{0} changed; it takes effect after a restart")]
    RestartRequired(&'static str),
}

/// Allowed range and default for a seconds setting
#[derive(Debug, Clone, Copy)]
pub struct SecondsRange {
    pub default: f64,
    pub min: f64,
    pub max: f64,
}

impl SecondsRange {
    pub const fn new(default: f64, min: f64, max: f64) -> Self {
        Self { default, min, max }
    }

    pub fn default_duration(&self) -> Duration {
        seconds_to_duration(self.default)
    }
}

/// Resolve a seconds setting, clamping into `range`.
pub fn resolve_seconds(
    key: &'static str,
    raw: Option<&RawSetting<f64>>,
    range: SecondsRange,
    issues: &mut Vec<ConfigIssue>,
) -> Duration {
    let value = match raw {
        None => return range.default_duration(),
        Some(RawSetting::Invalid(found)) => {
            issues.push(ConfigIssue::WrongType {
                key,
                found: found.type_str().to_string(),
                default: format!("{}", range.default),
            });
            return range.default_duration();
        }
        Some(RawSetting::Value(value)) => *value,
    };

    if !value.is_finite() {
        issues.push(ConfigIssue::OutOfRange {
            key,
            value,
            min: range.min,
            max: range.max,
            clamped: range.default,
        });
        return range.default_duration();
    }

    if value < range.min || value > range.max {
        let clamped = value.clamp(range.min, range.max);
        issues.push(ConfigIssue::OutOfRange {
            key,
            value,
            min: range.min,
            max: range.max,
            clamped,
        });
        return seconds_to_duration(clamped);
    }

    seconds_to_duration(value)
}

/// Resolve a boolean setting, defaulting on wrong types.
pub fn resolve_bool(
    key: &'static str,
    raw: Option<&RawSetting<bool>>,
    default: bool,
    issues: &mut Vec<ConfigIssue>,
) -> bool {
    match raw {
        None => default,
        Some(RawSetting::Value(value)) => *value,
        Some(RawSetting::Invalid(found)) => {
            issues.push(ConfigIssue::WrongType {
                key,
                found: found.type_str().to_string(),
                default: default.to_string(),
            });
            default
        }
    }
}

/// Resolve a text setting. A wrong type is reported and treated as unset,
/// so the caller's default applies; `default` only labels the issue.
pub fn resolve_text<T: Clone>(
    key: &'static str,
    raw: Option<&RawSetting<T>>,
    default: &str,
    issues: &mut Vec<ConfigIssue>,
) -> Option<T> {
    match raw {
        None => None,
        Some(RawSetting::Value(value)) => Some(value.clone()),
        Some(RawSetting::Invalid(found)) => {
            issues.push(ConfigIssue::WrongType {
                key,
                found: found.type_str().to_string(),
                default: default.to_string(),
            });
            None
        }
    }
}

/// Changes in a reloaded configuration that a running service cannot pick
/// up: the socket it listens on and the event source poll intervals.
pub fn restart_required(running: &Settings, reloaded: &Settings) -> Vec<ConfigIssue> {
    let (was, now) = (&running.watchers, &reloaded.watchers);
    [
        (
            "service.socket_path",
            running.service.socket_path != reloaded.service.socket_path,
        ),
        ("watchers.power_poll_seconds", was.power_poll != now.power_poll),
        ("watchers.process_poll_seconds", was.process_poll != now.process_poll),
        (
            "watchers.reachability_poll_seconds",
            was.reachability_poll != now.reachability_poll,
        ),
        ("watchers.wake_check_seconds", was.wake_check != now.wake_check),
    ]
    .into_iter()
    .filter(|(_, changed)| *changed)
    .map(|(key, _)| ConfigIssue::RestartRequired(key))
    .collect()
}

/// Validate a raw configuration, returning every correction that loading it
/// would apply.
pub fn validate_config(config: &RawConfig) -> Vec<ConfigIssue> {
    let (_, issues) = Settings::from_raw(config.clone());
    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    const RANGE: SecondsRange = SecondsRange::new(10.0, 1.0, 600.0);

    #[test]
    fn missing_value_uses_default() {
        let mut issues = Vec::new();
        let d = resolve_seconds("timing.x", None, RANGE, &mut issues);
        assert_eq!(d, Duration::from_secs(10));
        assert!(issues.is_empty());
    }

    #[test]
    fn out_of_range_is_clamped() {
        let mut issues = Vec::new();
        let d = resolve_seconds("timing.x", Some(&RawSetting::Value(0.2)), RANGE, &mut issues);
        assert_eq!(d, Duration::from_secs(1));
        assert!(matches!(
            issues[0],
            ConfigIssue::OutOfRange { key: "timing.x", clamped, .. } if clamped == 1.0
        ));

        let mut issues = Vec::new();
        let d = resolve_seconds("timing.x", Some(&RawSetting::Value(9999.0)), RANGE, &mut issues);
        assert_eq!(d, Duration::from_secs(600));
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn non_finite_falls_back_to_default() {
        let mut issues = Vec::new();
        let d = resolve_seconds(
            "timing.x",
            Some(&RawSetting::Value(f64::INFINITY)),
            RANGE,
            &mut issues,
        );
        assert_eq!(d, Duration::from_secs(10));
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn wrong_type_reports_found_type() {
        let mut issues = Vec::new();
        let raw = RawSetting::Invalid(toml::Value::Boolean(true));
        let d = resolve_seconds("timing.x", Some(&raw), RANGE, &mut issues);
        assert_eq!(d, Duration::from_secs(10));
        assert!(matches!(
            &issues[0],
            ConfigIssue::WrongType { found, .. } if found == "boolean"
        ));
    }

    #[test]
    fn text_wrong_type_is_unset() {
        let mut issues = Vec::new();
        let raw: RawSetting<String> = RawSetting::Invalid(toml::Value::Integer(5));
        assert_eq!(resolve_text("rules.required_network", Some(&raw), "any", &mut issues), None);
        assert!(matches!(
            &issues[0],
            ConfigIssue::WrongType { key: "rules.required_network", found, default }
                if found == "integer" && default == "any"
        ));

        let raw = RawSetting::Value("HomeNet".to_string());
        assert_eq!(
            resolve_text("rules.required_network", Some(&raw), "any", &mut issues),
            Some("HomeNet".to_string())
        );
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn only_startup_bound_changes_need_restart() {
        let running = Settings::default();
        let mut reloaded = Settings::default();
        reloaded.timing.debounce = Duration::from_secs(9);
        reloaded.connectivity.check_timeout = Duration::from_secs(9);
        assert!(restart_required(&running, &reloaded).is_empty());

        reloaded.watchers.process_poll = Duration::from_secs(9);
        assert_eq!(
            restart_required(&running, &reloaded),
            vec![ConfigIssue::RestartRequired("watchers.process_poll_seconds")]
        );
    }

    #[test]
    fn bool_wrong_type_uses_default() {
        let mut issues = Vec::new();
        let raw = RawSetting::Invalid(toml::Value::Integer(1));
        assert!(resolve_bool("rules.flag", Some(&raw), true, &mut issues));
        assert_eq!(issues.len(), 1);
    }
}
