//! Configuration parsing and validation for custodian
//!
//! Supports TOML configuration with:
//! - Versioned schema
//! - Target identity and launch rules
//! - Timing, sensor cache and watcher settings
//! - Clamping of out-of-range values instead of failing

mod schema;
mod settings;
mod validation;

pub use schema::*;
pub use settings::*;
pub use validation::*;

use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Unsupported config version: {0}")]
    UnsupportedVersion(u32),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Settings together with everything that had to be corrected to produce them
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub settings: Settings,
    pub issues: Vec<ConfigIssue>,
}

/// Load configuration from a TOML file
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<LoadedConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse configuration from a TOML string.
///
/// Out-of-range and wrong-typed values are corrected and reported as
/// issues; only malformed TOML or an unknown version is an error.
pub fn parse_config(content: &str) -> ConfigResult<LoadedConfig> {
    let raw: RawConfig = toml::from_str(content)?;

    if raw.config_version != CURRENT_CONFIG_VERSION {
        return Err(ConfigError::UnsupportedVersion(raw.config_version));
    }

    let (settings, issues) = Settings::from_raw(raw);
    for issue in &issues {
        warn!(issue = %issue, "Configuration corrected");
    }

    Ok(LoadedConfig { settings, issues })
}

/// Current supported config version
pub const CURRENT_CONFIG_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;
    use custodian_api::TargetIdentity;
    use std::io::Write;

    #[test]
    fn parse_minimal_config() {
        let config = r#"
            config_version = 1

            [target]
            name = "sync-agent"
        "#;

        let loaded = parse_config(config).unwrap();
        assert!(loaded.issues.is_empty());
        assert_eq!(
            loaded.settings.target,
            Some(TargetIdentity::Name("sync-agent".into()))
        );
        assert!(loaded.settings.service.automation_enabled);
    }

    #[test]
    fn reject_wrong_version() {
        let result = parse_config("config_version = 99");
        assert!(matches!(result, Err(ConfigError::UnsupportedVersion(99))));
    }

    #[test]
    fn wrong_types_do_not_fail_the_load() {
        let config = r#"
            config_version = 1

            [timing]
            debounce_seconds = "soon"

            [rules]
            require_ethernet_only = "yes"
        "#;

        let loaded = parse_config(config).unwrap();
        assert_eq!(loaded.issues.len(), 2);
        assert_eq!(loaded.settings.timing, TimingConfig::default());
        assert!(!loaded.settings.rules.require_ethernet_only);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "config_version = 1\n[target]\nidentifier = \"org.example.Agent\""
        )
        .unwrap();

        let loaded = load_config(file.path()).unwrap();
        assert!(loaded.settings.target.is_some());
    }

    #[test]
    fn missing_file_is_read_error() {
        let result = load_config("/nonexistent/custodian/config.toml");
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }
}
