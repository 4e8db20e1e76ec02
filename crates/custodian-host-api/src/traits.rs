//! Host traits

use async_trait::async_trait;
use custodian_api::{PowerSource, TargetIdentity};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{InterfaceDetails, ProcessHandle};

/// Errors from host operations
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Sensor read failed: {0}")]
    SensorFailed(String),

    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    #[error("Signal failed: {0}")]
    SignalFailed(String),

    #[error("Process not found")]
    ProcessNotFound,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Event source failed: {0}")]
    SourceFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type HostResult<T> = Result<T, HostError>;

/// Notifications from event sources.
///
/// Sources only report that something changed; the controller decides
/// whether and when to evaluate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    PowerChanged,
    NetworkChanged,
    ReachabilityChanged,
    ProcessLaunched { name: String, pid: u32 },
    ProcessTerminated { name: String, pid: u32 },
    SystemWoke,
    /// Periodic safety evaluation
    SafetyTick,
}

impl HostEvent {
    /// Trigger label used in logs and status
    pub fn source_label(&self) -> &'static str {
        match self {
            HostEvent::PowerChanged => "power-changed",
            HostEvent::NetworkChanged => "network-changed",
            HostEvent::ReachabilityChanged => "reachability-changed",
            HostEvent::ProcessLaunched { .. } => "process-launched",
            HostEvent::ProcessTerminated { .. } => "process-terminated",
            HostEvent::SystemWoke => "system-woke",
            HostEvent::SafetyTick => "safety-timer",
        }
    }
}

pub type HostEventSender = mpsc::UnboundedSender<HostEvent>;
pub type HostEventReceiver = mpsc::UnboundedReceiver<HostEvent>;

/// Raw environment reads.
///
/// Each call queries the host directly; caching is the caller's business.
#[async_trait]
pub trait SensorProbe: Send + Sync {
    /// Current power source; [`PowerSource::Unknown`] when it cannot be told
    async fn power_source(&self) -> HostResult<PowerSource>;

    /// Name of the connected wireless network
    async fn network_identity(&self) -> HostResult<Option<String>>;

    /// Names of interfaces that present as Ethernet and have link
    async fn ethernet_interfaces(&self) -> HostResult<Vec<String>>;

    async fn interface_details(&self, name: &str) -> HostResult<InterfaceDetails>;

    async fn default_route_interface(&self) -> HostResult<Option<String>>;

    /// `None` when reachability cannot be determined
    async fn internet_reachable(&self) -> HostResult<Option<bool>>;
}

/// Process enumeration and control
#[async_trait]
pub trait ProcessHost: Send + Sync {
    /// Find a running instance of the target
    async fn find_running(&self, target: &TargetIdentity) -> HostResult<Option<ProcessHandle>>;

    /// Start the target detached from the service, without raising it
    async fn launch_in_background(&self, target: &TargetIdentity) -> HostResult<()>;

    /// Ask the process to exit
    async fn request_graceful_quit(&self, handle: &ProcessHandle) -> HostResult<()>;

    /// Terminate the process unconditionally
    async fn force_kill(&self, handle: &ProcessHandle) -> HostResult<()>;
}

/// A named notification source that can be switched on and off.
///
/// Implementations push [`HostEvent`]s into the sender given to `start`
/// and must never evaluate anything themselves.
pub trait EventSource: Send {
    fn name(&self) -> &str;

    fn start(&mut self, events: HostEventSender) -> HostResult<()>;

    fn stop(&mut self) -> HostResult<()>;
}
