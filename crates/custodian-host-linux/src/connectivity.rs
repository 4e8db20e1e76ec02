//! Internet reachability and network change notifications
//!
//! - HTTP probe against a check URL (`204` or any 2xx means reachable)
//! - Netlink route monitor that reports link, address and route changes

use custodian_host_api::{EventSource, HostError, HostEvent, HostEventSender, HostResult};
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// RTMGRP_LINK | RTMGRP_IPV4_IFADDR | RTMGRP_IPV4_ROUTE | RTMGRP_IPV6_IFADDR
const NETLINK_GROUPS: u32 = 0x1 | 0x10 | 0x40 | 0x100;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProbeTarget {
    url: String,
    timeout: Duration,
}

/// HTTP reachability probe.
///
/// Clones share their target, so [`reconfigure`](Self::reconfigure) also
/// reaches the copy held by the reachability poller.
#[derive(Debug, Clone)]
pub struct ReachabilityProbe {
    client: Client,
    target: Arc<watch::Sender<ProbeTarget>>,
}

impl ReachabilityProbe {
    pub fn new(check_url: impl Into<String>, timeout: Duration) -> HostResult<Self> {
        // Captive portals answer with redirects; those must not count
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| HostError::Internal(format!("failed to create HTTP client: {}", e)))?;

        let (target, _) = watch::channel(ProbeTarget {
            url: check_url.into(),
            timeout,
        });

        Ok(Self {
            client,
            target: Arc::new(target),
        })
    }

    pub fn check_url(&self) -> String {
        self.target.borrow().url.clone()
    }

    /// Point the probe somewhere else. Returns whether anything changed.
    pub fn reconfigure(&self, check_url: &str, timeout: Duration) -> bool {
        let next = ProbeTarget {
            url: check_url.to_string(),
            timeout,
        };
        self.target.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        })
    }

    /// `None` when the request could not even be attempted
    pub async fn check(&self) -> Option<bool> {
        let ProbeTarget { url, timeout } = self.target.borrow().clone();
        debug!(url = %url, "Checking reachability");

        match self.client.get(&url).timeout(timeout).send().await {
            Ok(response) => {
                let status = response.status();
                let reachable = status.is_success();
                debug!(url = %url, status = %status, reachable, "Reachability check complete");
                Some(reachable)
            }
            Err(e) if e.is_builder() => {
                warn!(url = %url, error = %e, "Reachability check could not be built");
                None
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Reachability check failed");
                Some(false)
            }
        }
    }
}

/// Reports [`HostEvent::NetworkChanged`] for every relevant netlink message
#[derive(Debug, Default)]
pub struct NetlinkMonitor {
    task: Option<JoinHandle<()>>,
}

impl NetlinkMonitor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventSource for NetlinkMonitor {
    fn name(&self) -> &str {
        "netlink-monitor"
    }

    fn start(&mut self, events: HostEventSender) -> HostResult<()> {
        // Bind up front so failures surface to the hook manager
        let socket = open_route_socket()?;
        let fd = AsyncFd::new(socket)?;

        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.task = Some(tokio::spawn(async move {
            if let Err(e) = run_netlink_monitor(fd, events).await {
                warn!(error = %e, "Netlink monitor failed, network change detection unavailable");
            }
        }));
        Ok(())
    }

    fn stop(&mut self) -> HostResult<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for NetlinkMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn open_route_socket() -> HostResult<Socket> {
    let mut socket = Socket::new(NETLINK_ROUTE)?;
    socket.bind(&SocketAddr::new(0, NETLINK_GROUPS))?;
    socket.set_non_blocking(true)?;
    Ok(socket)
}

async fn run_netlink_monitor(fd: AsyncFd<Socket>, events: HostEventSender) -> std::io::Result<()> {
    info!("Netlink monitor started");
    let mut buf: Vec<u8> = Vec::with_capacity(8192);

    loop {
        let mut guard = fd.readable().await?;
        buf.clear();

        match guard.try_io(|inner| inner.get_ref().recv(&mut buf, 0)) {
            Ok(Ok(len)) if len > 0 => {
                if has_relevant_netlink_event(&buf[..len]) {
                    debug!("Network change detected");
                    if events.send(HostEvent::NetworkChanged).is_err() {
                        return Ok(());
                    }
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(error = %e, "Netlink recv error"),
            // Spurious wakeup; readiness already cleared
            Err(_would_block) => {}
        }
    }
}

/// Whether a buffer holds link, address or route changes
pub fn has_relevant_netlink_event(buf: &[u8]) -> bool {
    let mut offset = 0;

    while offset < buf.len() {
        let msg = match NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buf[offset..]) {
            Ok(msg) => msg,
            Err(_) => break,
        };

        if let NetlinkPayload::InnerMessage(route_msg) = &msg.payload {
            if matches!(
                route_msg,
                RouteNetlinkMessage::NewLink(_)
                    | RouteNetlinkMessage::DelLink(_)
                    | RouteNetlinkMessage::NewAddress(_)
                    | RouteNetlinkMessage::DelAddress(_)
                    | RouteNetlinkMessage::NewRoute(_)
                    | RouteNetlinkMessage::DelRoute(_)
            ) {
                return true;
            }
        }

        let len = msg.header.length as usize;
        if len == 0 {
            break;
        }
        offset += len;
    }

    false
}
