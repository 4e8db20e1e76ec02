//! Default paths for custodian components
//!
//! Paths are user-writable by default (no root required):
//! - Socket: `$XDG_RUNTIME_DIR/custodian/custodian.sock` or `/tmp/custodian-$USER/custodian.sock`
//! - Config: `$XDG_CONFIG_HOME/custodian/config.toml` or `~/.config/custodian/config.toml`

use std::path::PathBuf;

/// Environment variable for overriding the socket path
pub const CUSTODIAN_SOCKET_ENV: &str = "CUSTODIAN_SOCKET";

/// Environment variable for overriding the config file path
pub const CUSTODIAN_CONFIG_ENV: &str = "CUSTODIAN_CONFIG";

const SOCKET_FILENAME: &str = "custodian.sock";
const CONFIG_FILENAME: &str = "config.toml";
const APP_DIR: &str = "custodian";

/// Get the default socket path.
///
/// Order of precedence:
/// 1. `$CUSTODIAN_SOCKET` environment variable (if set)
/// 2. `$XDG_RUNTIME_DIR/custodian/custodian.sock` (if XDG_RUNTIME_DIR is set)
/// 3. `/tmp/custodian-$USER/custodian.sock` (fallback)
pub fn default_socket_path() -> PathBuf {
    if let Ok(path) = std::env::var(CUSTODIAN_SOCKET_ENV) {
        return PathBuf::from(path);
    }

    socket_path_without_env()
}

/// Get the socket path without checking the CUSTODIAN_SOCKET env var.
pub fn socket_path_without_env() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(APP_DIR).join(SOCKET_FILENAME);
    }

    let username = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    PathBuf::from(format!("/tmp/{}-{}", APP_DIR, username)).join(SOCKET_FILENAME)
}

/// Get the default configuration file path.
///
/// Order of precedence:
/// 1. `$CUSTODIAN_CONFIG` environment variable (if set)
/// 2. `$XDG_CONFIG_HOME/custodian/config.toml`
/// 3. `~/.config/custodian/config.toml`
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CUSTODIAN_CONFIG_ENV) {
        return PathBuf::from(path);
    }

    if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(config_home).join(APP_DIR).join(CONFIG_FILENAME);
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join(CONFIG_FILENAME);
    }

    PathBuf::from("/etc").join(APP_DIR).join(CONFIG_FILENAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_contains_app_dir() {
        let path = socket_path_without_env();
        assert!(path.to_string_lossy().contains("custodian"));
        assert!(path.to_string_lossy().ends_with(".sock"));
    }

    #[test]
    fn config_path_is_toml() {
        let path = default_config_path();
        assert!(path.to_string_lossy().ends_with(".toml"));
    }
}
