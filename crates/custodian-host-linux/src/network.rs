//! Network sensors
//!
//! - Wi-Fi network name via `iwgetid`, falling back to `nmcli`
//! - Wired interfaces from `/sys/class/net`
//! - IPv4 addresses via `getifaddrs`
//! - Default route from `/proc/net/route`

use custodian_host_api::{HostError, HostResult, InterfaceDetails};
use nix::ifaddrs::getifaddrs;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

pub const NET_CLASS_DIR: &str = "/sys/class/net";
pub const ROUTE_TABLE: &str = "/proc/net/route";

/// `type` value of Ethernet-framed interfaces
const ARPHRD_ETHER: &str = "1";
const RTF_UP: u32 = 0x1;
const TOOL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum ToolOutput {
    Missing,
    Failed,
    Success(String),
}

async fn run_tool(program: &str, args: &[&str]) -> ToolOutput {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    match tokio::time::timeout(TOOL_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) if output.status.success() => {
            ToolOutput::Success(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(Ok(output)) => {
            debug!(program, status = ?output.status, "Network tool exited unsuccessfully");
            ToolOutput::Failed
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => ToolOutput::Missing,
        Ok(Err(e)) => {
            debug!(program, error = %e, "Network tool failed to run");
            ToolOutput::Failed
        }
        Err(_) => {
            debug!(program, "Network tool timed out");
            ToolOutput::Failed
        }
    }
}

/// Name of the connected Wi-Fi network, if any.
///
/// Errors only when neither tool is installed.
pub async fn wifi_ssid() -> HostResult<Option<String>> {
    let iwgetid = run_tool("iwgetid", &["-r"]).await;
    if let ToolOutput::Success(out) = &iwgetid {
        let ssid = out.trim();
        if !ssid.is_empty() {
            return Ok(Some(ssid.to_string()));
        }
    }

    match run_tool("nmcli", &["-t", "-f", "active,ssid", "dev", "wifi"]).await {
        ToolOutput::Success(out) => Ok(parse_nmcli_wifi(&out)),
        ToolOutput::Missing if matches!(iwgetid, ToolOutput::Missing) => Err(
            HostError::SensorFailed("neither iwgetid nor nmcli is available".into()),
        ),
        _ => Ok(None),
    }
}

/// Pick the active network from `nmcli -t -f active,ssid dev wifi`.
///
/// Terse mode escapes `:` and `\` in values with a backslash.
pub fn parse_nmcli_wifi(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix("yes:"))
        .map(unescape_nmcli)
        .find(|ssid| !ssid.is_empty())
}

fn unescape_nmcli(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn is_wireless(dir: &Path) -> bool {
    dir.join("wireless").exists() || dir.join("phy80211").exists()
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Wired interfaces with link.
///
/// Physical (backed by a device), Ethernet-framed, not wireless, carrier up.
/// Bridges, veths and loopback are skipped.
pub fn ethernet_interfaces(root: &Path) -> HostResult<Vec<String>> {
    let entries = fs::read_dir(root).map_err(|e| {
        HostError::SensorFailed(format!("cannot read {}: {}", root.display(), e))
    })?;

    let mut names: Vec<String> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let dir = entry.path();

            let ether = read_trimmed(&dir.join("type")).as_deref() == Some(ARPHRD_ETHER);
            let physical = dir.join("device").exists();
            // Reading carrier fails with EINVAL while the interface is down
            let carrier = read_trimmed(&dir.join("carrier")).as_deref() == Some("1");

            (name != "lo" && ether && physical && carrier && !is_wireless(&dir)).then_some(name)
        })
        .collect();

    names.sort();
    Ok(names)
}

/// Addresses and wireless flag of one interface
pub fn interface_details(root: &Path, name: &str) -> HostResult<InterfaceDetails> {
    let dir = root.join(name);
    if !dir.exists() {
        return Err(HostError::SensorFailed(format!("no interface named {}", name)));
    }

    let addresses = ipv4_addresses(name)?;
    Ok(InterfaceDetails {
        name: name.to_string(),
        has_ipv4: !addresses.is_empty(),
        wireless_emulated: is_wireless(&dir),
        ipv4: pick_routable(&addresses),
    })
}

fn ipv4_addresses(name: &str) -> HostResult<Vec<Ipv4Addr>> {
    let addrs = getifaddrs().map_err(|e| HostError::SensorFailed(format!("getifaddrs: {}", e)))?;

    Ok(addrs
        .filter(|ifa| ifa.interface_name == name)
        .filter_map(|ifa| {
            ifa.address
                .and_then(|addr| addr.as_sockaddr_in().map(|sin| Ipv4Addr::from(sin.ip())))
        })
        .collect())
}

/// First address that is not link-local, loopback or unspecified
pub fn pick_routable(addresses: &[Ipv4Addr]) -> Option<Ipv4Addr> {
    addresses
        .iter()
        .copied()
        .find(|ip| !ip.is_link_local() && !ip.is_loopback() && !ip.is_unspecified())
}

/// Interface carrying the default route
pub fn default_route_interface(table_path: &Path) -> HostResult<Option<String>> {
    let table = fs::read_to_string(table_path).map_err(|e| {
        HostError::SensorFailed(format!("cannot read {}: {}", table_path.display(), e))
    })?;
    Ok(parse_default_route(&table))
}

/// Lowest-metric `0.0.0.0/0` route that is up, from `/proc/net/route` text.
///
/// Columns: Iface Destination Gateway Flags RefCnt Use Metric Mask ...
pub fn parse_default_route(table: &str) -> Option<String> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 8 {
                return None;
            }
            let flags = u32::from_str_radix(cols[3], 16).ok()?;
            let metric: u32 = cols[6].parse().ok()?;
            let default = cols[1] == "00000000" && cols[7] == "00000000";
            (default && flags & RTF_UP != 0).then(|| (metric, cols[0].to_string()))
        })
        .min_by_key(|(metric, _)| *metric)
        .map(|(_, iface)| iface)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ROUTES: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
wlp2s0\t00000000\t0100A8C0\t0003\t0\t0\t600\t00000000\t0\t0\t0
enp3s0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
enp3s0\t0001A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
";

    #[test]
    fn default_route_prefers_lowest_metric() {
        assert_eq!(parse_default_route(ROUTES), Some("enp3s0".into()));
    }

    #[test]
    fn no_default_route() {
        let table = "Iface\tDestination\tGateway\tFlags\tRefCnt\tUse\tMetric\tMask\n\
                     enp3s0\t0001A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\n";
        assert_eq!(parse_default_route(table), None);
    }

    #[test]
    fn down_routes_are_ignored() {
        let table = "Iface\tDestination\tGateway\tFlags\tRefCnt\tUse\tMetric\tMask\n\
                     enp3s0\t00000000\t0101A8C0\t0002\t0\t0\t100\t00000000\n";
        assert_eq!(parse_default_route(table), None);
    }

    #[test]
    fn nmcli_active_network() {
        let output = "no:Neighbour\nyes:Home\\:Net\nno:Cafe\n";
        assert_eq!(parse_nmcli_wifi(output), Some("Home:Net".into()));
        assert_eq!(parse_nmcli_wifi("no:Cafe\n"), None);
    }

    #[test]
    fn routable_address_skips_link_local() {
        let addrs = [Ipv4Addr::new(169, 254, 3, 4), Ipv4Addr::new(192, 168, 1, 20)];
        assert_eq!(pick_routable(&addrs), Some(Ipv4Addr::new(192, 168, 1, 20)));
        assert_eq!(pick_routable(&addrs[..1]), None);
    }

    fn iface(root: &Path, name: &str, kind: &str, carrier: &str, extra: &[&str]) {
        let dir = root.join(name);
        fs::create_dir_all(dir.join("device")).unwrap();
        fs::write(dir.join("type"), format!("{}\n", kind)).unwrap();
        fs::write(dir.join("carrier"), format!("{}\n", carrier)).unwrap();
        for sub in extra {
            fs::create_dir_all(dir.join(sub)).unwrap();
        }
    }

    #[test]
    fn ethernet_detection() {
        let tmp = TempDir::new().unwrap();
        iface(tmp.path(), "enp3s0", "1", "1", &[]);
        iface(tmp.path(), "enp4s0", "1", "0", &[]);
        iface(tmp.path(), "wlp2s0", "1", "1", &["wireless"]);
        iface(tmp.path(), "lo", "772", "1", &[]);

        // Virtual bridge: no device link
        let bridge = tmp.path().join("br0");
        fs::create_dir_all(&bridge).unwrap();
        fs::write(bridge.join("type"), "1\n").unwrap();
        fs::write(bridge.join("carrier"), "1\n").unwrap();

        assert_eq!(ethernet_interfaces(tmp.path()).unwrap(), vec!["enp3s0".to_string()]);
    }

    #[test]
    fn details_of_missing_interface_fail() {
        let tmp = TempDir::new().unwrap();
        assert!(interface_details(tmp.path(), "enp9s0").is_err());
    }
}
