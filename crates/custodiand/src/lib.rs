//! custodiand service loop
//!
//! Owns the controller and feeds it, one message at a time, from:
//! - controller timers (debounce, forced-kill deadline, verification)
//! - host event sources
//! - control socket requests
//! - process signals forwarded by `main`

use anyhow::{anyhow, Result};
use custodian_api::{
    ClientRole, Command, ErrorCode, ErrorInfo, Event, EventPayload, Request, Response,
    ResponsePayload, TargetIdentity, API_VERSION,
};
use custodian_config::Settings;
use custodian_core::{Controller, ControllerChannels, CoreEvent, MANUAL_SOURCE};
use custodian_ipc::{IpcServer, ServerMessage};
use custodian_util::ClientId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Requests delivered to the running service from outside the socket
#[derive(Debug)]
pub enum ServiceSignal {
    /// Replace every setting with a freshly loaded configuration
    Reload(Settings),
    Shutdown,
}

/// Main service state
pub struct Service {
    controller: Controller,
    channels: ControllerChannels,
    ipc: Arc<IpcServer>,
}

impl Service {
    /// `ipc` must already be started
    pub fn new(controller: Controller, channels: ControllerChannels, ipc: IpcServer) -> Self {
        Self {
            controller,
            channels,
            ipc: Arc::new(ipc),
        }
    }

    /// Run until a shutdown signal arrives or the signal channel closes
    pub async fn run(self, mut signals: mpsc::UnboundedReceiver<ServiceSignal>) -> Result<()> {
        let Service {
            mut controller,
            mut channels,
            ipc,
        } = self;

        let mut messages = ipc
            .take_message_receiver()
            .await
            .ok_or_else(|| anyhow!("IPC message receiver already taken"))?;

        let ipc_accept = ipc.clone();
        let accept_task = tokio::spawn(async move {
            if let Err(e) = ipc_accept.run().await {
                error!(error = %e, "IPC server error");
            }
        });

        controller.start();
        publish(&ipc, &controller, vec![CoreEvent::SettingsChanged]);

        info!("Service running");

        loop {
            tokio::select! {
                signal = signals.recv() => match signal {
                    Some(ServiceSignal::Reload(settings)) => {
                        let events = controller.apply_settings(&settings);
                        ipc.broadcast_event(Event::new(EventPayload::ConfigReloaded));
                        publish(&ipc, &controller, events);
                    }
                    Some(ServiceSignal::Shutdown) | None => {
                        info!("Shutdown requested");
                        break;
                    }
                },

                Some(event) = channels.timers.recv() => {
                    let events = controller.handle_timer(event).await;
                    publish(&ipc, &controller, events);
                }

                Some(event) = channels.host_events.recv() => {
                    let events = controller.handle_host_event(event);
                    publish(&ipc, &controller, events);
                }

                Some(message) = messages.recv() => {
                    handle_ipc_message(&mut controller, &ipc, message).await;
                }
            }
        }

        // The target is left in whatever state it is in
        controller.shutdown_runtime();
        ipc.broadcast_event(Event::new(EventPayload::Shutdown));
        accept_task.abort();
        ipc.shutdown();

        info!("Shutdown complete");
        Ok(())
    }
}

async fn handle_ipc_message(controller: &mut Controller, ipc: &IpcServer, message: ServerMessage) {
    match message {
        ServerMessage::Request { client_id, request } => {
            let role = ipc
                .get_client_info(&client_id)
                .await
                .map(|info| info.role)
                .unwrap_or(ClientRole::Observer);

            let (response, events) = handle_command(controller, &client_id, role, request);
            if let Err(e) = ipc.send_response(&client_id, response).await {
                debug!(client_id = %client_id, error = %e, "Response not delivered");
            }
            publish(ipc, controller, events);
        }

        ServerMessage::ClientConnected { client_id, info } => {
            let clients = ipc.client_count().await;
            info!(
                client_id = %client_id,
                role = ?info.role,
                uid = ?info.uid,
                clients = clients,
                "Client connected"
            );
        }

        ServerMessage::ClientDisconnected { client_id } => {
            debug!(client_id = %client_id, "Client disconnected");
        }
    }
}

/// Apply one control request.
///
/// Returns the response plus whatever the controller emitted while
/// applying it, for the caller to publish.
pub fn handle_command(
    controller: &mut Controller,
    client_id: &ClientId,
    role: ClientRole,
    request: Request,
) -> (Response, Vec<CoreEvent>) {
    let request_id = request.request_id;

    if request.api_version != API_VERSION {
        let error = ErrorInfo::new(
            ErrorCode::UnsupportedVersion,
            format!(
                "API version {} not supported, expected {}",
                request.api_version, API_VERSION
            ),
        );
        return (Response::error(request_id, error), Vec::new());
    }

    if request.command.is_mutating() && !role.can_mutate() {
        warn!(client_id = %client_id, command = ?request.command, "Settings change refused");
        let error = ErrorInfo::new(
            ErrorCode::PermissionDenied,
            "Only the service owner may change settings",
        );
        return (Response::error(request_id, error), Vec::new());
    }

    match request.command {
        Command::GetStatus => (
            Response::success(request_id, ResponsePayload::Status(controller.status())),
            Vec::new(),
        ),

        Command::TriggerEvaluation { source, delay } => {
            // Observers may hurry an evaluation but never push one back
            let delay = match role {
                ClientRole::Owner => delay,
                ClientRole::Observer => delay.map(|d| d.min(controller.debounce())),
            };
            let source = source
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(MANUAL_SOURCE);
            let delay = controller.trigger_evaluation(source, delay);
            debug!(client_id = %client_id, source, delay_ms = delay.as_millis() as u64, "Evaluation requested");
            (
                Response::success(request_id, ResponsePayload::EvaluationScheduled),
                Vec::new(),
            )
        }

        Command::SubscribeEvents => (
            Response::success(
                request_id,
                ResponsePayload::Subscribed {
                    client_id: client_id.clone(),
                },
            ),
            Vec::new(),
        ),

        Command::SetAutomationEnabled { enabled } => {
            let events = controller.set_automation_enabled(enabled);
            (
                Response::success(request_id, ResponsePayload::AutomationSet { enabled }),
                events,
            )
        }

        Command::SetTarget { identifier, name } => {
            let target = TargetIdentity::from_parts(identifier.as_deref(), name.as_deref());
            let events = controller.set_target(target);
            let payload = ResponsePayload::TargetSet {
                target: controller.target().cloned(),
            };
            (Response::success(request_id, payload), events)
        }

        Command::SetRequiredNetwork { network } => {
            let events = controller.set_required_network(Some(&network));
            let payload = ResponsePayload::RequiredNetworkSet {
                network: controller.rules().required_network.clone(),
            };
            (Response::success(request_id, payload), events)
        }

        Command::Ping => (Response::success(request_id, ResponsePayload::Pong), Vec::new()),
    }
}

/// Broadcast controller events, followed by the resulting status
fn publish(ipc: &IpcServer, controller: &Controller, events: Vec<CoreEvent>) {
    if events.is_empty() {
        return;
    }

    for event in events {
        match event {
            CoreEvent::ActionPerformed {
                kind,
                pid,
                accepted,
            } => {
                ipc.broadcast_event(Event::new(EventPayload::ActionPerformed {
                    kind,
                    pid,
                    accepted,
                }));
            }
            CoreEvent::ActionVerified { kind, succeeded } => {
                ipc.broadcast_event(Event::new(EventPayload::ActionVerified { kind, succeeded }));
            }
            CoreEvent::Evaluated { .. }
            | CoreEvent::ActionDeferred { .. }
            | CoreEvent::ForceKillSkipped { .. }
            | CoreEvent::SettingsChanged => {}
        }
    }

    ipc.broadcast_event(Event::new(EventPayload::StatusChanged(controller.status())));
}
