//! Power source detection via sysfs
//!
//! Reads `/sys/class/power_supply/*`. Each supply has a `type` file
//! (`Mains`, `USB`, `UPS`, `Battery`, ...) plus `online` for external
//! supplies and `status` for batteries.

use custodian_api::PowerSource;
use custodian_host_api::{HostError, HostResult};
use std::fs;
use std::path::Path;

/// Default location of the power supply class
pub const POWER_SUPPLY_DIR: &str = "/sys/class/power_supply";

/// What one supply directory reports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct SupplyState {
    mains_online: bool,
    ups_online: bool,
    battery_present: bool,
    battery_discharging: bool,
    battery_external: bool,
}

/// Read the current power source from a power supply directory.
///
/// A machine with no supplies at all (a typical desktop) is on AC power.
/// Batteries that report neither charging nor discharging and no online
/// external supply give [`PowerSource::Unknown`].
pub fn read_power_source(root: &Path) -> HostResult<PowerSource> {
    let entries = fs::read_dir(root).map_err(|e| {
        HostError::SensorFailed(format!("cannot read {}: {}", root.display(), e))
    })?;

    let mut state = SupplyState::default();
    for entry in entries.flatten() {
        let path = entry.path();
        let kind = read_trimmed(&path.join("type")).unwrap_or_default();
        let online = read_trimmed(&path.join("online")).is_some_and(|v| v == "1");

        match kind.as_str() {
            "Mains" | "USB" | "USB_C" | "USB_PD" => state.mains_online |= online,
            "UPS" => state.ups_online |= online,
            "Battery" => {
                // Peripheral batteries (mice, headsets) carry scope=Device
                if read_trimmed(&path.join("scope")).as_deref() == Some("Device") {
                    continue;
                }
                state.battery_present = true;
                match read_trimmed(&path.join("status")).as_deref() {
                    Some("Discharging") => state.battery_discharging = true,
                    Some("Charging") | Some("Full") | Some("Not charging") => {
                        state.battery_external = true
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    Ok(classify(&state))
}

fn classify(state: &SupplyState) -> PowerSource {
    if state.mains_online {
        PowerSource::Ac
    } else if state.ups_online {
        PowerSource::Ups
    } else if state.battery_discharging {
        PowerSource::Battery
    } else if !state.battery_present || state.battery_external {
        PowerSource::Ac
    } else {
        PowerSource::Unknown
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn supply(root: &Path, name: &str, files: &[(&str, &str)]) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for (file, content) in files {
            fs::write(dir.join(file), format!("{}\n", content)).unwrap();
        }
    }

    #[test]
    fn laptop_on_charger() {
        let tmp = TempDir::new().unwrap();
        supply(tmp.path(), "AC", &[("type", "Mains"), ("online", "1")]);
        supply(tmp.path(), "BAT0", &[("type", "Battery"), ("status", "Charging")]);
        assert_eq!(read_power_source(tmp.path()).unwrap(), PowerSource::Ac);
    }

    #[test]
    fn laptop_unplugged() {
        let tmp = TempDir::new().unwrap();
        supply(tmp.path(), "AC", &[("type", "Mains"), ("online", "0")]);
        supply(tmp.path(), "BAT0", &[("type", "Battery"), ("status", "Discharging")]);
        assert_eq!(read_power_source(tmp.path()).unwrap(), PowerSource::Battery);
    }

    #[test]
    fn ups_supply() {
        let tmp = TempDir::new().unwrap();
        supply(tmp.path(), "ups0", &[("type", "UPS"), ("online", "1")]);
        assert_eq!(read_power_source(tmp.path()).unwrap(), PowerSource::Ups);
    }

    #[test]
    fn desktop_without_supplies_is_ac() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(read_power_source(tmp.path()).unwrap(), PowerSource::Ac);
    }

    #[test]
    fn peripheral_batteries_are_ignored() {
        let tmp = TempDir::new().unwrap();
        supply(
            tmp.path(),
            "hidpp_battery_0",
            &[("type", "Battery"), ("scope", "Device"), ("status", "Discharging")],
        );
        assert_eq!(read_power_source(tmp.path()).unwrap(), PowerSource::Ac);
    }

    #[test]
    fn ambiguous_battery_is_unknown() {
        let tmp = TempDir::new().unwrap();
        supply(tmp.path(), "BAT0", &[("type", "Battery"), ("status", "Unknown")]);
        assert_eq!(read_power_source(tmp.path()).unwrap(), PowerSource::Unknown);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let result = read_power_source(&tmp.path().join("absent"));
        assert!(matches!(result, Err(HostError::SensorFailed(_))));
    }
}
