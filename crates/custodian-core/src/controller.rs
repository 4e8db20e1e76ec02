//! The controller
//!
//! Owns the sensor cache, scheduler, orchestrator, hooks and run state for
//! one target. It is driven by a single loop that feeds it timer expiries,
//! host events and control requests one at a time, so nothing in here needs
//! a lock.

use custodian_api::{
    ActionKind, ControllerPhase, StatusSnapshot, TargetIdentity, API_VERSION,
};
use custodian_config::{normalize_network, RuleConfig, Settings, TimingConfig};
use custodian_host_api::{
    EventSource, HostEvent, HostEventReceiver, ProcessHandle, ProcessHost, SensorProbe,
};
use custodian_util::{format_seconds, CustodianError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::{
    derive_phase, evaluate, ActionOrchestrator, ActionOutcome, CoreEvent, EventScheduler,
    ForceKillOutcome, HookManager, PendingForceKill, PhaseInputs, RunState, SensorCache,
    TimerEvent, TimerReceiver, Verification,
};

/// Trigger label for evaluations requested through the control surface
pub const MANUAL_SOURCE: &str = "manual";

/// Trigger label for the forced-kill deadline and what it reschedules
pub const FORCE_KILL_SOURCE: &str = "force-kill-deadline";

/// Receivers the owner of the controller polls and feeds back into it
pub struct ControllerChannels {
    pub timers: TimerReceiver,
    pub host_events: HostEventReceiver,
}

/// Single-target lifecycle controller
pub struct Controller {
    target: Option<TargetIdentity>,
    target_tx: watch::Sender<Option<TargetIdentity>>,
    rules: RuleConfig,
    timing: TimingConfig,
    automation_enabled: bool,
    force_refresh: bool,

    sensors: Arc<dyn SensorProbe>,
    processes: Arc<dyn ProcessHost>,

    cache: SensorCache,
    scheduler: EventScheduler,
    orchestrator: ActionOrchestrator,
    hooks: HookManager,
    state: RunState,
}

impl Controller {
    pub fn new(
        settings: &Settings,
        sensors: Arc<dyn SensorProbe>,
        processes: Arc<dyn ProcessHost>,
    ) -> (Self, ControllerChannels) {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (target_tx, _) = watch::channel(settings.target.clone());

        let controller = Self {
            target: settings.target.clone(),
            target_tx,
            rules: settings.rules.clone(),
            timing: settings.timing.clone(),
            automation_enabled: settings.service.automation_enabled,
            force_refresh: false,
            sensors,
            processes,
            cache: SensorCache::new(settings.cache),
            scheduler: EventScheduler::new(&settings.timing, timer_tx.clone()),
            orchestrator: ActionOrchestrator::new(&settings.timing, timer_tx),
            hooks: HookManager::new(host_tx, settings.timing.safety_interval),
            state: RunState::new(),
        };

        let channels = ControllerChannels {
            timers: timer_rx,
            host_events: host_rx,
        };

        (controller, channels)
    }

    /// Add an event source. Sources run only while automation is enabled
    /// and a target is configured.
    pub fn register_source(&mut self, source: Box<dyn EventSource>) {
        self.hooks.register(source);
    }

    /// Follow target changes (used by process watchers)
    pub fn watch_target(&self) -> watch::Receiver<Option<TargetIdentity>> {
        self.target_tx.subscribe()
    }

    /// Start the event sources and schedule the first evaluation
    pub fn start(&mut self) {
        info!(
            target = %self.target_label(),
            automation_enabled = self.automation_enabled,
            sources = self.hooks.source_count(),
            "Controller starting"
        );
        self.refresh_hooks();
        self.scheduler.trigger("startup", Some(Duration::ZERO));
    }

    pub fn target(&self) -> Option<&TargetIdentity> {
        self.target.as_ref()
    }

    pub fn rules(&self) -> &RuleConfig {
        &self.rules
    }

    /// Delay used when a trigger does not override it
    pub fn debounce(&self) -> Duration {
        self.scheduler.debounce()
    }

    pub fn automation_enabled(&self) -> bool {
        self.automation_enabled
    }

    pub fn hooks(&self) -> &HookManager {
        &self.hooks
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn pending_force_kill(&self) -> Option<&PendingForceKill> {
        self.orchestrator.pending_force_kill()
    }

    pub fn has_pending_evaluation(&self) -> bool {
        self.scheduler.has_pending()
    }

    /// Event sources should be running
    pub fn runtime_active(&self) -> bool {
        self.automation_enabled && self.target.is_some()
    }

    pub fn phase(&self) -> ControllerPhase {
        derive_phase(PhaseInputs {
            configured: self.target.is_some(),
            automation_enabled: self.automation_enabled,
            evaluation_pending: self.scheduler.has_pending(),
            desired_run: self.state.desired_run,
            observed_run: self.state.observed_run,
            force_kill_pending: self.orchestrator.pending_force_kill().is_some(),
        })
    }

    /// Read-only view for clients
    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            api_version: API_VERSION,
            automation_enabled: self.automation_enabled,
            target: self.target.clone(),
            required_network: self.rules.required_network.clone(),
            phase: self.phase(),
            desired_run: self.state.desired_run,
            observed_run: self.state.observed_run,
            last_reason: self.state.last_reason.clone(),
            last_block: self.state.last_block.clone(),
            last_trigger: self.state.last_trigger.clone(),
            last_evaluation_at: self.state.last_evaluation_at,
            sensors: self.state.sensors.clone(),
            last_action: self.orchestrator.last_action().cloned(),
            pending_force_kill: self.orchestrator.pending_force_kill_view(),
            last_error: self.state.last_error.clone(),
        }
    }

    /// Request an evaluation. Sensors are re-read regardless of their TTLs.
    ///
    /// Returns the delay that was used.
    pub fn trigger_evaluation(&mut self, source: &str, delay: Option<Duration>) -> Duration {
        self.force_refresh = true;
        self.scheduler.trigger(source, delay)
    }

    /// Feed a notification from an event source
    pub fn handle_host_event(&mut self, event: HostEvent) -> Vec<CoreEvent> {
        self.cache.invalidate_for(&event);

        match &event {
            HostEvent::ProcessTerminated { name, pid } => {
                if self.state.record_exit(*pid) {
                    debug!(name = %name, pid, "Target exited");
                    self.orchestrator.process_exited(*pid);
                }
            }
            HostEvent::ProcessLaunched { name, pid } => {
                debug!(name = %name, pid, "Target launched");
            }
            _ => {}
        }

        // Events queued before the sources were stopped
        if !self.runtime_active() {
            debug!(source = event.source_label(), "Runtime inactive; event ignored");
            return Vec::new();
        }

        let delay = match event {
            HostEvent::SystemWoke => Some(self.timing.wake_debounce),
            _ => None,
        };
        self.scheduler.trigger(event.source_label(), delay);
        Vec::new()
    }

    /// Feed a timer expiry
    pub async fn handle_timer(&mut self, event: TimerEvent) -> Vec<CoreEvent> {
        match event {
            TimerEvent::Evaluate { generation, source } => {
                if !self.scheduler.accept(generation) {
                    debug!(source = %source, "Stale evaluation timer ignored");
                    return Vec::new();
                }
                self.run_evaluation(&source).await
            }
            TimerEvent::ForceKillDeadline { generation } => {
                match self.orchestrator.take_force_kill(generation) {
                    Some(pending) => self.run_force_kill(pending).await,
                    None => {
                        debug!("Stale forced-kill timer ignored");
                        Vec::new()
                    }
                }
            }
            TimerEvent::VerifyAction { generation, kind } => {
                match self.orchestrator.take_verification(generation) {
                    Some(verification) => self.run_verification(verification).await,
                    None => {
                        debug!(action = %kind, "Stale verification timer ignored");
                        Vec::new()
                    }
                }
            }
        }
    }

    pub fn set_automation_enabled(&mut self, enabled: bool) -> Vec<CoreEvent> {
        if self.automation_enabled == enabled {
            return Vec::new();
        }
        self.automation_enabled = enabled;
        info!(enabled, "Automation toggled");

        if !enabled {
            self.scheduler.cancel_pending();
            self.orchestrator.cancel_all();
        }
        self.refresh_hooks();
        self.scheduler.trigger(
            if enabled { "automation-enabled" } else { "automation-disabled" },
            None,
        );

        vec![CoreEvent::SettingsChanged]
    }

    pub fn set_target(&mut self, target: Option<TargetIdentity>) -> Vec<CoreEvent> {
        if self.target == target {
            return Vec::new();
        }

        if let Some(identity) = &target {
            if !identity.looks_well_formed() {
                warn!(target = %identity, "Target looks malformed; launch will still be attempted");
            }
        }

        info!(
            old = %self.target_label(),
            new = %target.as_ref().map(|t| t.to_string()).unwrap_or_else(|| "(none)".into()),
            "Target changed"
        );

        self.orchestrator.cancel_force_kill("target changed");
        self.target = target.clone();
        self.target_tx.send_replace(target);
        self.state.reset_decision();
        self.state.observed_run = false;
        self.state.last_known_identity = None;

        self.refresh_hooks();
        self.scheduler.trigger("target-changed", None);

        vec![CoreEvent::SettingsChanged]
    }

    /// Blank means any network
    pub fn set_required_network(&mut self, network: Option<&str>) -> Vec<CoreEvent> {
        let network = normalize_network(network);
        if self.rules.required_network == network {
            return Vec::new();
        }

        if self.rules.require_ethernet_only && network.is_some() {
            warn!("Required network has no effect while Ethernet-only mode is set");
        }
        info!(
            network = network.as_deref().unwrap_or("(any)"),
            "Required network changed"
        );

        self.rules.required_network = network;
        self.scheduler.trigger("required-network-changed", None);

        vec![CoreEvent::SettingsChanged]
    }

    /// Replace every setting, e.g. after a config reload
    pub fn apply_settings(&mut self, settings: &Settings) -> Vec<CoreEvent> {
        self.shutdown_runtime();

        self.rules = settings.rules.clone();
        self.timing = settings.timing.clone();
        self.automation_enabled = settings.service.automation_enabled;
        self.cache.set_ttls(settings.cache);
        self.scheduler.set_timing(&settings.timing);
        self.orchestrator.set_timing(&settings.timing);
        self.hooks.set_safety_interval(settings.timing.safety_interval);

        if self.target != settings.target {
            self.target = settings.target.clone();
            self.target_tx.send_replace(settings.target.clone());
            self.state.reset_decision();
            self.state.observed_run = false;
            self.state.last_known_identity = None;
        }

        info!(
            target = %self.target_label(),
            automation_enabled = self.automation_enabled,
            "Settings applied"
        );

        self.refresh_hooks();
        self.scheduler.trigger("config-reload", Some(Duration::ZERO));

        vec![CoreEvent::SettingsChanged]
    }

    /// Cancel every pending timer and stop every event source
    pub fn shutdown_runtime(&mut self) {
        self.scheduler.cancel_pending();
        self.orchestrator.cancel_all();
        self.hooks.stop_all();
        info!("Runtime stopped");
    }

    fn refresh_hooks(&mut self) {
        let active = self.runtime_active();
        self.hooks.refresh(active);
    }

    fn target_label(&self) -> String {
        self.target
            .as_ref()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "(none)".into())
    }

    async fn run_evaluation(&mut self, source: &str) -> Vec<CoreEvent> {
        let mut events = Vec::new();

        let errors_before = self.state.error_count();
        match self.evaluate_and_reconcile(source, &mut events).await {
            Err(e) => {
                warn!(trigger = source, error = %e, "Evaluation failed");
                self.state.record_error(&e);
            }
            // A clean cycle supersedes whatever failed before it
            Ok(()) if self.state.error_count() == errors_before => self.state.clear_error(),
            Ok(()) => {}
        }

        events.push(CoreEvent::Evaluated {
            trigger: source.to_string(),
            desired_run: self.state.desired_run.unwrap_or(false),
            observed_run: self.state.observed_run,
            reason: self.state.last_reason.clone(),
        });
        events
    }

    async fn evaluate_and_reconcile(
        &mut self,
        source: &str,
        events: &mut Vec<CoreEvent>,
    ) -> custodian_util::Result<()> {
        let force = std::mem::take(&mut self.force_refresh);
        self.state.last_trigger = Some(source.to_string());
        self.state.last_evaluation_at = Some(custodian_util::now());

        let snapshot = self.cache.read(self.sensors.as_ref(), force).await;
        if let Some(failure) = self.cache.failures().first() {
            self.state.record_error(CustodianError::sensor(format!(
                "{}: {}",
                failure.field.name(),
                failure.message
            )));
        }

        let decision = evaluate(self.target.as_ref(), &self.rules, &snapshot);
        self.state.record_decision(&decision, snapshot);

        let target = match self.target.clone() {
            Some(target) => target,
            None => {
                self.state.record_observation(None);
                info!(trigger = source, "No target configured");
                return Ok(());
            }
        };

        let observed = lookup(self.processes.as_ref(), &target).await?;
        self.state.record_observation(observed.as_ref());

        info!(
            trigger = source,
            desired = decision.desired_run,
            observed = observed.is_some(),
            reason = %decision.reason,
            "Evaluated"
        );

        if !self.automation_enabled {
            debug!("Automation disabled; no action taken");
            return Ok(());
        }

        let plan = self.orchestrator.plan(decision.desired_run, observed.as_ref());
        if let Some(kind) = plan.action_kind() {
            if let Some(remaining) = self.scheduler.action_gap_remaining() {
                info!(
                    action = %kind,
                    remaining = %format_seconds(remaining),
                    "Action deferred by minimum action gap"
                );
                self.scheduler.defer(remaining);
                events.push(CoreEvent::ActionDeferred { kind, remaining });
                return Ok(());
            }
            self.scheduler.record_action();
        }

        let outcome = self
            .orchestrator
            .execute(plan, self.processes.as_ref(), &target)
            .await;

        match &outcome {
            ActionOutcome::Launched | ActionOutcome::LaunchFailed(_) => {
                events.push(CoreEvent::ActionPerformed {
                    kind: ActionKind::Launch,
                    pid: None,
                    accepted: matches!(outcome, ActionOutcome::Launched),
                });
            }
            ActionOutcome::QuitRequested { pid } | ActionOutcome::QuitFailed { pid, .. } => {
                events.push(CoreEvent::ActionPerformed {
                    kind: ActionKind::GracefulQuit,
                    pid: Some(*pid),
                    accepted: matches!(outcome, ActionOutcome::QuitRequested { .. }),
                });
            }
            ActionOutcome::InSync | ActionOutcome::AwaitingForceKill => {}
        }

        match outcome.error() {
            Some(error) => Err(CustodianError::action(error)),
            None => Ok(()),
        }
    }

    async fn run_force_kill(&mut self, pending: PendingForceKill) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        let expected = pending.identity.pid;

        // Conditions may have changed without any event reaching us
        let snapshot = self.cache.read(self.sensors.as_ref(), true).await;
        let decision = evaluate(self.target.as_ref(), &self.rules, &snapshot);
        self.state.record_decision(&decision, snapshot);
        self.state.last_trigger = Some(FORCE_KILL_SOURCE.to_string());
        self.state.last_evaluation_at = Some(custodian_util::now());

        let current = match self.target.clone() {
            Some(target) => match lookup(self.processes.as_ref(), &target).await {
                Ok(current) => current,
                Err(e) => {
                    warn!(pid = expected, error = %e, "Forced kill skipped; lookup failed");
                    self.state.record_error(&e);
                    self.scheduler.trigger(FORCE_KILL_SOURCE, None);
                    return events;
                }
            },
            None => None,
        };

        let outcome = self
            .orchestrator
            .finish_force_kill(pending, &decision, current.as_ref(), self.processes.as_ref())
            .await;

        match outcome {
            ForceKillOutcome::Killed { pid } => {
                events.push(CoreEvent::ActionPerformed {
                    kind: ActionKind::ForceKill,
                    pid: Some(pid),
                    accepted: true,
                });
            }
            ForceKillOutcome::Failed { pid, error } => {
                self.state.record_error(CustodianError::action(&error));
                events.push(CoreEvent::ActionPerformed {
                    kind: ActionKind::ForceKill,
                    pid: Some(pid),
                    accepted: false,
                });
            }
            ForceKillOutcome::SkippedRace { expected, found } => {
                let error = CustodianError::RaceDetected { expected, found };
                events.push(CoreEvent::ForceKillSkipped {
                    pid: expected,
                    reason: error.to_string(),
                });
                self.state.record_error(error);
                self.state.record_observation(current.as_ref());
                self.scheduler.trigger(FORCE_KILL_SOURCE, None);
            }
            ForceKillOutcome::SkippedConditionsAllow | ForceKillOutcome::SkippedExited => {
                let reason = if matches!(outcome, ForceKillOutcome::SkippedExited) {
                    "target already exited"
                } else {
                    "conditions allow the target to run"
                };
                events.push(CoreEvent::ForceKillSkipped {
                    pid: expected,
                    reason: reason.to_string(),
                });
                self.state.record_observation(current.as_ref());
                self.scheduler.trigger(FORCE_KILL_SOURCE, None);
            }
        }

        events
    }

    async fn run_verification(&mut self, verification: Verification) -> Vec<CoreEvent> {
        let current = match self.target.clone() {
            Some(target) => match lookup(self.processes.as_ref(), &target).await {
                Ok(current) => current,
                Err(e) => {
                    warn!(action = %verification.kind, error = %e, "Verification lookup failed");
                    self.state.record_error(&e);
                    return Vec::new();
                }
            },
            None => None,
        };
        self.state.record_observation(current.as_ref());

        let succeeded = self.orchestrator.verify(&verification, current.as_ref());
        let escalation_pending = verification.kind == ActionKind::GracefulQuit
            && self.orchestrator.pending_force_kill().is_some();
        if !succeeded && !escalation_pending {
            self.state.record_error(CustodianError::action(format!(
                "{} did not take effect",
                verification.kind
            )));
        }

        vec![CoreEvent::ActionVerified {
            kind: verification.kind,
            succeeded,
        }]
    }

}

async fn lookup(
    processes: &dyn ProcessHost,
    target: &TargetIdentity,
) -> custodian_util::Result<Option<ProcessHandle>> {
    processes
        .find_running(target)
        .await
        .map_err(|e| CustodianError::sensor(format!("process lookup: {}", e)))
}
