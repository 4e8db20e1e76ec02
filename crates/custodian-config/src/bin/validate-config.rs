//! Config validation CLI tool
//!
//! Validates a custodiand configuration file and reports every correction
//! the service would apply when loading it.

use custodian_config::{ConfigError, Settings, CURRENT_CONFIG_VERSION};
use custodian_util::{default_config_path, format_seconds};
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let default_path = default_config_path();
            eprintln!("Usage: validate-config [config-file]");
            eprintln!();
            eprintln!("Validates a custodiand configuration file.");
            eprintln!();
            eprintln!("If no path is provided, uses: {}", default_path.display());
            eprintln!();
            eprintln!("Example:");
            eprintln!("  validate-config {}", default_path.display());
            eprintln!("  validate-config config.example.toml");
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match custodian_config::load_config(&config_path) {
        Ok(loaded) => {
            if loaded.issues.is_empty() {
                println!("✓ Configuration is valid");
            } else {
                println!("✓ Configuration loads with {} correction(s):", loaded.issues.len());
                for issue in &loaded.issues {
                    println!("  - {}", issue);
                }
            }
            println!();
            print_summary(&loaded.settings);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed");
            eprintln!();
            match &e {
                ConfigError::ReadError(io_err) => {
                    eprintln!("Failed to read file: {}", io_err);
                }
                ConfigError::ParseError(parse_err) => {
                    eprintln!("TOML parse error:");
                    eprintln!("  {}", parse_err);
                }
                ConfigError::UnsupportedVersion(ver) => {
                    eprintln!(
                        "Unsupported config version: {} (expected {})",
                        ver, CURRENT_CONFIG_VERSION
                    );
                }
            }
            ExitCode::from(1)
        }
    }
}

fn print_summary(settings: &Settings) {
    println!("Summary:");
    println!("  Config version: {}", CURRENT_CONFIG_VERSION);
    println!(
        "  Target: {}",
        settings
            .target
            .as_ref()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "(not configured)".into())
    );
    println!("  Automation: {}", if settings.service.automation_enabled { "on" } else { "off" });

    let rules = &settings.rules;
    println!();
    println!("Rules:");
    println!(
        "  Power source: {}",
        rules
            .required_power_source
            .as_ref()
            .map(|p| p.label().to_string())
            .unwrap_or_else(|| "any".into())
    );
    if rules.require_ethernet_only {
        println!("  Network: ethernet only");
    } else {
        println!(
            "  Network: {}",
            rules.required_network.as_deref().unwrap_or("any")
        );
        println!("  Ethernet fallback: {}", rules.allow_ethernet_fallback);
    }
    println!(
        "  Ethernet must carry default route: {}",
        rules.require_ethernet_default_route
    );

    let timing = &settings.timing;
    println!();
    println!("Timing:");
    println!("  Debounce: {}", format_seconds(timing.debounce));
    println!("  Wake debounce: {}", format_seconds(timing.wake_debounce));
    println!("  Minimum action gap: {}", format_seconds(timing.min_action_gap));
    println!("  Force kill timeout: {}", format_seconds(timing.force_kill_timeout));
    println!("  Verify delay: {}", format_seconds(timing.verify_delay));
    println!("  Safety interval: {}", format_seconds(timing.safety_interval));
}
