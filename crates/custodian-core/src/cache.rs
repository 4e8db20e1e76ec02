//! Sensor cache
//!
//! Memoizes environment reads with a per-field TTL. The network-related
//! fields (network identity, Ethernet state, default route) describe the same
//! link, so when any of them is stale the three are re-read together. A
//! forced refresh re-reads everything in one pass, so a snapshot is never a
//! mix of readings from before and after a change the caller asked about.

use custodian_api::{EthernetStatus, PowerSource, Reachability, SensorSnapshot};
use custodian_config::CacheTtls;
use custodian_host_api::{HostEvent, HostResult, SensorProbe};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// One cached field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorField {
    Power,
    Network,
    Ethernet,
    Route,
    Reachability,
}

impl SensorField {
    pub fn name(self) -> &'static str {
        match self {
            SensorField::Power => "power",
            SensorField::Network => "network",
            SensorField::Ethernet => "ethernet",
            SensorField::Route => "route",
            SensorField::Reachability => "reachability",
        }
    }
}

/// A sensor read that failed during the last refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorFailure {
    pub field: SensorField,
    pub message: String,
}

#[derive(Debug, Clone)]
struct Cached<T> {
    value: T,
    read_at: Option<Instant>,
}

impl<T> Cached<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            read_at: None,
        }
    }

    fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        match self.read_at {
            Some(at) => !ttl.is_zero() && now.saturating_duration_since(at) < ttl,
            None => false,
        }
    }

    fn store(&mut self, value: T, now: Instant) {
        self.value = value;
        self.read_at = Some(now);
    }

    fn invalidate(&mut self) {
        self.read_at = None;
    }
}

/// Time-boxed memoization of sensor reads
#[derive(Debug)]
pub struct SensorCache {
    ttls: CacheTtls,
    power: Cached<PowerSource>,
    network: Cached<Option<String>>,
    ethernet: Cached<EthernetStatus>,
    route: Cached<Option<String>>,
    reachability: Cached<Reachability>,
    failures: Vec<SensorFailure>,
}

impl SensorCache {
    pub fn new(ttls: CacheTtls) -> Self {
        Self {
            ttls,
            power: Cached::new(PowerSource::Unknown),
            network: Cached::new(None),
            ethernet: Cached::new(EthernetStatus::inactive()),
            route: Cached::new(None),
            reachability: Cached::new(Reachability::Unknown),
            failures: Vec::new(),
        }
    }

    pub fn ttls(&self) -> CacheTtls {
        self.ttls
    }

    /// Apply new TTLs. Everything is invalidated.
    pub fn set_ttls(&mut self, ttls: CacheTtls) {
        self.ttls = ttls;
        self.invalidate_all();
    }

    pub fn invalidate(&mut self, field: SensorField) {
        match field {
            SensorField::Power => self.power.invalidate(),
            SensorField::Network => self.network.invalidate(),
            SensorField::Ethernet => self.ethernet.invalidate(),
            SensorField::Route => self.route.invalidate(),
            SensorField::Reachability => self.reachability.invalidate(),
        }
    }

    pub fn invalidate_all(&mut self) {
        self.power.invalidate();
        self.network.invalidate();
        self.ethernet.invalidate();
        self.route.invalidate();
        self.reachability.invalidate();
    }

    /// Drop whatever the event says is no longer true
    pub fn invalidate_for(&mut self, event: &HostEvent) {
        match event {
            HostEvent::PowerChanged => self.invalidate(SensorField::Power),
            HostEvent::NetworkChanged => {
                self.network.invalidate();
                self.ethernet.invalidate();
                self.route.invalidate();
                self.reachability.invalidate();
            }
            HostEvent::ReachabilityChanged => self.invalidate(SensorField::Reachability),
            HostEvent::SystemWoke => self.invalidate_all(),
            HostEvent::ProcessLaunched { .. }
            | HostEvent::ProcessTerminated { .. }
            | HostEvent::SafetyTick => {}
        }
    }

    /// Last values without touching the host
    pub fn peek(&self) -> SensorSnapshot {
        SensorSnapshot {
            power_source: self.power.value.clone(),
            network_identity: self.network.value.clone(),
            ethernet: self.ethernet.value.clone(),
            default_route_interface: self.route.value.clone(),
            reachability: self.reachability.value,
        }
    }

    /// Reads that failed during the most recent refresh
    pub fn failures(&self) -> &[SensorFailure] {
        &self.failures
    }

    /// Return a snapshot, re-reading stale fields.
    ///
    /// A failed read sets its field to the unknown value, never to a stale
    /// one.
    pub async fn read(&mut self, probe: &dyn SensorProbe, force_refresh: bool) -> SensorSnapshot {
        let now = Instant::now();
        self.failures.clear();

        if force_refresh || !self.power.is_fresh(self.ttls.power, now) {
            let value = match probe.power_source().await {
                Ok(source) => source,
                Err(e) => {
                    self.record_failure(SensorField::Power, e.to_string());
                    PowerSource::Unknown
                }
            };
            self.power.store(value, now);
        }

        let network_stale = force_refresh
            || !self.network.is_fresh(self.ttls.network, now)
            || !self.ethernet.is_fresh(self.ttls.ethernet, now)
            || !self.route.is_fresh(self.ttls.route, now);
        if network_stale {
            self.refresh_link(probe, now).await;
        }

        if force_refresh || !self.reachability.is_fresh(self.ttls.reachability, now) {
            let value = match probe.internet_reachable().await {
                Ok(reachable) => Reachability::from_option(reachable),
                Err(e) => {
                    self.record_failure(SensorField::Reachability, e.to_string());
                    Reachability::Unknown
                }
            };
            self.reachability.store(value, now);
        }

        let snapshot = self.peek();
        debug!(facts = %snapshot.facts(), forced = force_refresh, "Sensor snapshot");
        snapshot
    }

    async fn refresh_link(&mut self, probe: &dyn SensorProbe, now: Instant) {
        let network = match probe.network_identity().await {
            Ok(network) => network.filter(|n| !n.trim().is_empty()),
            Err(e) => {
                self.record_failure(SensorField::Network, e.to_string());
                None
            }
        };

        let route = match probe.default_route_interface().await {
            Ok(route) => route,
            Err(e) => {
                self.record_failure(SensorField::Route, e.to_string());
                None
            }
        };

        let ethernet = match read_ethernet(probe, route.as_deref()).await {
            Ok(status) => status,
            Err(e) => {
                self.record_failure(SensorField::Ethernet, e.to_string());
                EthernetStatus::inactive()
            }
        };

        self.network.store(network, now);
        self.route.store(route, now);
        self.ethernet.store(ethernet, now);
    }

    fn record_failure(&mut self, field: SensorField, message: String) {
        warn!(sensor = field.name(), error = %message, "Sensor read failed");
        self.failures.push(SensorFailure { field, message });
    }
}

/// Find an active Ethernet interface, preferring the one that carries the
/// default route.
async fn read_ethernet(
    probe: &dyn SensorProbe,
    route: Option<&str>,
) -> HostResult<EthernetStatus> {
    let mut names = probe.ethernet_interfaces().await?;
    if let Some(route) = route {
        names.sort_by_key(|name| name != route);
    }

    for name in names {
        match probe.interface_details(&name).await {
            Ok(details) => {
                if let Some(ip) = details.usable_ipv4() {
                    return Ok(EthernetStatus::active(name, ip));
                }
                debug!(interface = %name, "Ethernet interface has no usable IPv4");
            }
            Err(e) => {
                debug!(interface = %name, error = %e, "Could not read interface details");
            }
        }
    }

    Ok(EthernetStatus::inactive())
}
