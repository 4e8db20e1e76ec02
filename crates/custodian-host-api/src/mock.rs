//! Mock host for testing

use async_trait::async_trait;
use custodian_api::{PowerSource, TargetIdentity};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use crate::{
    EventSource, HostError, HostEvent, HostEventSender, HostResult, InterfaceDetails,
    ProcessHandle, ProcessHost, ProcessIdentity, SensorProbe,
};

/// Environment reported by [`MockSensors`]
#[derive(Debug, Clone)]
pub struct MockEnvironment {
    pub power: PowerSource,
    pub network: Option<String>,
    pub interfaces: Vec<InterfaceDetails>,
    pub default_route: Option<String>,
    pub reachable: Option<bool>,

    /// Make the matching read return an error
    pub fail_power: bool,
    pub fail_network: bool,
    pub fail_reachability: bool,
}

impl Default for MockEnvironment {
    fn default() -> Self {
        Self {
            power: PowerSource::Ac,
            network: None,
            interfaces: Vec::new(),
            default_route: None,
            reachable: Some(true),
            fail_power: false,
            fail_network: false,
            fail_reachability: false,
        }
    }
}

/// How many times each sensor was queried
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadCounts {
    pub power: u32,
    pub network: u32,
    pub ethernet: u32,
    pub route: u32,
    pub reachability: u32,
}

/// Scriptable sensors. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockSensors {
    env: Arc<Mutex<MockEnvironment>>,
    reads: Arc<Mutex<ReadCounts>>,
}

impl MockSensors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the environment in one step
    pub fn set(&self, env: MockEnvironment) {
        *self.env.lock().unwrap() = env;
    }

    /// Change part of the environment
    pub fn update(&self, f: impl FnOnce(&mut MockEnvironment)) {
        f(&mut self.env.lock().unwrap());
    }

    pub fn set_power(&self, power: PowerSource) {
        self.update(|env| env.power = power);
    }

    pub fn set_network(&self, network: Option<&str>) {
        let network = network.map(str::to_string);
        self.update(|env| env.network = network);
    }

    pub fn set_reachable(&self, reachable: Option<bool>) {
        self.update(|env| env.reachable = reachable);
    }

    /// Attach a wired interface with the given address
    pub fn plug_ethernet(&self, name: &str, ipv4: Ipv4Addr) {
        let details = InterfaceDetails {
            name: name.to_string(),
            has_ipv4: true,
            wireless_emulated: false,
            ipv4: Some(ipv4),
        };
        self.update(|env| {
            env.interfaces.retain(|i| i.name != details.name);
            env.interfaces.push(details);
        });
    }

    pub fn unplug_ethernet(&self) {
        self.update(|env| env.interfaces.clear());
    }

    pub fn set_default_route(&self, interface: Option<&str>) {
        let interface = interface.map(str::to_string);
        self.update(|env| env.default_route = interface);
    }

    pub fn reads(&self) -> ReadCounts {
        *self.reads.lock().unwrap()
    }

    fn env(&self) -> MockEnvironment {
        self.env.lock().unwrap().clone()
    }

    fn count(&self, f: impl FnOnce(&mut ReadCounts)) {
        f(&mut self.reads.lock().unwrap());
    }
}

#[async_trait]
impl SensorProbe for MockSensors {
    async fn power_source(&self) -> HostResult<PowerSource> {
        self.count(|r| r.power += 1);
        let env = self.env();
        if env.fail_power {
            return Err(HostError::SensorFailed("mock power failure".into()));
        }
        Ok(env.power)
    }

    async fn network_identity(&self) -> HostResult<Option<String>> {
        self.count(|r| r.network += 1);
        let env = self.env();
        if env.fail_network {
            return Err(HostError::SensorFailed("mock network failure".into()));
        }
        Ok(env.network)
    }

    async fn ethernet_interfaces(&self) -> HostResult<Vec<String>> {
        self.count(|r| r.ethernet += 1);
        Ok(self.env().interfaces.into_iter().map(|i| i.name).collect())
    }

    async fn interface_details(&self, name: &str) -> HostResult<InterfaceDetails> {
        self.env()
            .interfaces
            .into_iter()
            .find(|i| i.name == name)
            .ok_or_else(|| HostError::SensorFailed(format!("no interface {}", name)))
    }

    async fn default_route_interface(&self) -> HostResult<Option<String>> {
        self.count(|r| r.route += 1);
        Ok(self.env().default_route)
    }

    async fn internet_reachable(&self) -> HostResult<Option<bool>> {
        self.count(|r| r.reachability += 1);
        let env = self.env();
        if env.fail_reachability {
            return Err(HostError::SensorFailed("mock reachability failure".into()));
        }
        Ok(env.reachable)
    }
}

/// Process table state behind [`MockProcessHost`]
#[derive(Debug, Clone)]
pub struct MockProcessState {
    pub running: Option<ProcessHandle>,
    next_pid: u32,
    next_start: u64,

    /// A graceful quit makes the process exit
    pub quit_exits: bool,
    /// A successful launch makes the process appear
    pub launch_appears: bool,

    pub fail_launch: bool,
    pub fail_quit: bool,
    pub fail_kill: bool,
    pub fail_find: bool,

    pub launches: u32,
    pub quits: u32,
    pub kills: u32,
}

impl Default for MockProcessState {
    fn default() -> Self {
        Self {
            running: None,
            next_pid: 1000,
            next_start: 1,
            quit_exits: true,
            launch_appears: true,
            fail_launch: false,
            fail_quit: false,
            fail_kill: false,
            fail_find: false,
            launches: 0,
            quits: 0,
            kills: 0,
        }
    }
}

impl MockProcessState {
    fn spawn_instance(&mut self, name: &str) -> ProcessHandle {
        let identity = ProcessIdentity::new(self.next_pid, self.next_start);
        self.next_pid += 1;
        self.next_start += 1;
        let handle = ProcessHandle::new(identity, name);
        self.running = Some(handle.clone());
        handle
    }
}

/// Scriptable process table holding at most one target instance.
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockProcessHost {
    state: Arc<Mutex<MockProcessState>>,
}

impl MockProcessHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, f: impl FnOnce(&mut MockProcessState)) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn snapshot(&self) -> MockProcessState {
        self.state.lock().unwrap().clone()
    }

    pub fn running(&self) -> Option<ProcessHandle> {
        self.state.lock().unwrap().running.clone()
    }

    /// Simulate the target being started outside the controller
    pub fn simulate_start(&self, name: &str) -> ProcessHandle {
        self.state.lock().unwrap().spawn_instance(name)
    }

    /// Simulate the target exiting on its own
    pub fn simulate_exit(&self) -> Option<ProcessHandle> {
        self.state.lock().unwrap().running.take()
    }

    /// Simulate the target exiting and a new instance taking its place
    pub fn simulate_restart(&self) -> ProcessHandle {
        let mut state = self.state.lock().unwrap();
        let name = state
            .running
            .as_ref()
            .map(|h| h.name.clone())
            .unwrap_or_else(|| "target".into());
        state.spawn_instance(&name)
    }

    pub fn launches(&self) -> u32 {
        self.state.lock().unwrap().launches
    }

    pub fn quits(&self) -> u32 {
        self.state.lock().unwrap().quits
    }

    pub fn kills(&self) -> u32 {
        self.state.lock().unwrap().kills
    }
}

#[async_trait]
impl ProcessHost for MockProcessHost {
    async fn find_running(&self, _target: &TargetIdentity) -> HostResult<Option<ProcessHandle>> {
        let state = self.state.lock().unwrap();
        if state.fail_find {
            return Err(HostError::Internal("mock enumeration failure".into()));
        }
        Ok(state.running.clone())
    }

    async fn launch_in_background(&self, target: &TargetIdentity) -> HostResult<()> {
        let mut state = self.state.lock().unwrap();
        state.launches += 1;
        if state.fail_launch {
            return Err(HostError::LaunchFailed("mock launch failure".into()));
        }
        if state.launch_appears && state.running.is_none() {
            state.spawn_instance(target.label());
        }
        Ok(())
    }

    async fn request_graceful_quit(&self, handle: &ProcessHandle) -> HostResult<()> {
        let mut state = self.state.lock().unwrap();
        state.quits += 1;
        if state.fail_quit {
            return Err(HostError::SignalFailed("mock quit failure".into()));
        }
        match &state.running {
            Some(running) if running.identity() == handle.identity() => {
                if state.quit_exits {
                    state.running = None;
                }
                Ok(())
            }
            _ => Err(HostError::ProcessNotFound),
        }
    }

    async fn force_kill(&self, handle: &ProcessHandle) -> HostResult<()> {
        let mut state = self.state.lock().unwrap();
        state.kills += 1;
        if state.fail_kill {
            return Err(HostError::SignalFailed("mock kill failure".into()));
        }
        match &state.running {
            Some(running) if running.identity() == handle.identity() => {
                state.running = None;
                Ok(())
            }
            _ => Err(HostError::ProcessNotFound),
        }
    }
}

#[derive(Debug, Default)]
struct MockSourceState {
    sender: Option<HostEventSender>,
    starts: u32,
    stops: u32,
    fail_start: bool,
    fail_stop: bool,
}

/// Event source driven by the test. Clones share state.
#[derive(Debug, Clone)]
pub struct MockEventSource {
    name: String,
    state: Arc<Mutex<MockSourceState>>,
}

impl MockEventSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MockSourceState::default())),
        }
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.state.lock().unwrap().fail_start = fail;
    }

    pub fn set_fail_stop(&self, fail: bool) {
        self.state.lock().unwrap().fail_stop = fail;
    }

    /// Whether the source currently holds a sender
    pub fn is_started(&self) -> bool {
        self.state.lock().unwrap().sender.is_some()
    }

    pub fn starts(&self) -> u32 {
        self.state.lock().unwrap().starts
    }

    pub fn stops(&self) -> u32 {
        self.state.lock().unwrap().stops
    }

    /// Emit an event if started; returns whether it was delivered
    pub fn emit(&self, event: HostEvent) -> bool {
        match &self.state.lock().unwrap().sender {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

impl EventSource for MockEventSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, events: HostEventSender) -> HostResult<()> {
        let mut state = self.state.lock().unwrap();
        state.starts += 1;
        if state.fail_start {
            return Err(HostError::SourceFailed(format!("{} refused to start", self.name)));
        }
        state.sender = Some(events);
        Ok(())
    }

    fn stop(&mut self) -> HostResult<()> {
        let mut state = self.state.lock().unwrap();
        state.stops += 1;
        if state.fail_stop {
            return Err(HostError::SourceFailed(format!("{} refused to stop", self.name)));
        }
        state.sender = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn target() -> TargetIdentity {
        TargetIdentity::Name("sync-agent".into())
    }

    #[tokio::test]
    async fn launch_then_quit() {
        let host = MockProcessHost::new();
        host.launch_in_background(&target()).await.unwrap();

        let handle = host.find_running(&target()).await.unwrap().unwrap();
        assert_eq!(handle.name, "sync-agent");

        host.request_graceful_quit(&handle).await.unwrap();
        assert!(host.find_running(&target()).await.unwrap().is_none());
        assert_eq!((host.launches(), host.quits()), (1, 1));
    }

    #[tokio::test]
    async fn kill_refuses_a_different_instance() {
        let host = MockProcessHost::new();
        let old = host.simulate_start("sync-agent");
        let new = host.simulate_restart();
        assert_ne!(old.identity(), new.identity());

        assert!(matches!(
            host.force_kill(&old).await,
            Err(HostError::ProcessNotFound)
        ));
        assert!(host.running().is_some());
    }

    #[tokio::test]
    async fn sensor_failures_are_errors() {
        let sensors = MockSensors::new();
        sensors.update(|env| env.fail_reachability = true);
        assert!(sensors.internet_reachable().await.is_err());
        assert_eq!(sensors.reads().reachability, 1);
    }

    #[test]
    fn event_source_delivers_only_while_started() {
        let mut source = MockEventSource::new("power");
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(!source.emit(HostEvent::PowerChanged));
        source.start(tx).unwrap();
        assert!(source.emit(HostEvent::PowerChanged));
        assert_eq!(rx.try_recv().unwrap(), HostEvent::PowerChanged);

        source.stop().unwrap();
        assert!(!source.emit(HostEvent::PowerChanged));
    }
}
