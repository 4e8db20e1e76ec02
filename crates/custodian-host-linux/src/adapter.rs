//! Linux host adapter implementation

use async_trait::async_trait;
use custodian_api::{PowerSource, TargetIdentity};
use custodian_host_api::{
    EventSource, HostEvent, HostResult, InterfaceDetails, ProcessHandle, ProcessHost, SensorProbe,
};
use nix::sys::signal::Signal;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::connectivity::{NetlinkMonitor, ReachabilityProbe};
use crate::network::{self, NET_CLASS_DIR, ROUTE_TABLE};
use crate::power::{read_power_source, POWER_SUPPLY_DIR};
use crate::process::ProcessControl;
use crate::watchers::{ChangePoller, PowerSampler, ProcessWatcher, WakeDetector};

/// Polling intervals for the event sources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceIntervals {
    pub power: Duration,
    pub process: Duration,
    pub reachability: Duration,
    pub wake: Duration,
}

/// Where the adapter reads kernel state from
#[derive(Debug, Clone)]
pub struct HostPaths {
    pub power_supply: PathBuf,
    pub net_class: PathBuf,
    pub route_table: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            power_supply: PathBuf::from(POWER_SUPPLY_DIR),
            net_class: PathBuf::from(NET_CLASS_DIR),
            route_table: PathBuf::from(ROUTE_TABLE),
        }
    }
}

/// Linux host adapter
#[derive(Debug, Clone)]
pub struct LinuxHost {
    paths: HostPaths,
    probe: ReachabilityProbe,
    processes: ProcessControl,
}

impl LinuxHost {
    pub fn new(check_url: &str, check_timeout: Duration) -> HostResult<Self> {
        Self::with_paths(HostPaths::default(), check_url, check_timeout)
    }

    pub fn with_paths(paths: HostPaths, check_url: &str, check_timeout: Duration) -> HostResult<Self> {
        let probe = ReachabilityProbe::new(check_url, check_timeout)?;
        info!(url = %check_url, "Linux host adapter ready");

        Ok(Self {
            paths,
            probe,
            processes: ProcessControl::new(),
        })
    }

    /// Apply a reloaded probe URL and timeout
    pub fn reconfigure_probe(&self, check_url: &str, check_timeout: Duration) {
        if self.probe.reconfigure(check_url, check_timeout) {
            info!(url = %check_url, timeout = ?check_timeout, "Reachability probe reconfigured");
        }
    }

    /// Every event source this host offers.
    ///
    /// The process watcher follows `target` so it never needs restarting
    /// when the target changes.
    pub fn event_sources(
        &self,
        intervals: SourceIntervals,
        target: watch::Receiver<Option<TargetIdentity>>,
    ) -> Vec<Box<dyn EventSource>> {
        vec![
            Box::new(NetlinkMonitor::new()),
            Box::new(ChangePoller::new(
                "power-poller",
                PowerSampler::new(self.paths.power_supply.clone()),
                intervals.power,
                HostEvent::PowerChanged,
            )),
            Box::new(ChangePoller::new(
                "reachability-poller",
                self.probe.clone(),
                intervals.reachability,
                HostEvent::ReachabilityChanged,
            )),
            Box::new(ProcessWatcher::new(
                self.processes.clone(),
                target,
                intervals.process,
            )),
            Box::new(WakeDetector::new(intervals.wake)),
        ]
    }
}

#[async_trait]
impl SensorProbe for LinuxHost {
    async fn power_source(&self) -> HostResult<PowerSource> {
        read_power_source(&self.paths.power_supply)
    }

    async fn network_identity(&self) -> HostResult<Option<String>> {
        network::wifi_ssid().await
    }

    async fn ethernet_interfaces(&self) -> HostResult<Vec<String>> {
        network::ethernet_interfaces(&self.paths.net_class)
    }

    async fn interface_details(&self, name: &str) -> HostResult<InterfaceDetails> {
        network::interface_details(&self.paths.net_class, name)
    }

    async fn default_route_interface(&self) -> HostResult<Option<String>> {
        network::default_route_interface(&self.paths.route_table)
    }

    async fn internet_reachable(&self) -> HostResult<Option<bool>> {
        Ok(self.probe.check().await)
    }
}

#[async_trait]
impl ProcessHost for LinuxHost {
    async fn find_running(&self, target: &TargetIdentity) -> HostResult<Option<ProcessHandle>> {
        self.processes.find_running(target).await
    }

    async fn launch_in_background(&self, target: &TargetIdentity) -> HostResult<()> {
        self.processes.launch(target).await
    }

    async fn request_graceful_quit(&self, handle: &ProcessHandle) -> HostResult<()> {
        self.processes.signal(handle, Signal::SIGTERM).await
    }

    async fn force_kill(&self, handle: &ProcessHandle) -> HostResult<()> {
        self.processes.signal(handle, Signal::SIGKILL).await
    }
}
