//! Action orchestrator
//!
//! Moves the target toward the desired run state: launch, graceful quit,
//! and a forced kill once the quit deadline passes. Every action is followed
//! by a delayed verification that re-checks the process table.

use chrono::{DateTime, Local};
use custodian_api::{ActionKind, ActionRecord, PendingForceKillView, TargetIdentity};
use custodian_config::TimingConfig;
use custodian_host_api::{HostError, ProcessHandle, ProcessHost, ProcessIdentity};
use custodian_util::format_seconds;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{Decision, TimerEvent, TimerSender, TimerSlot};

/// What reconciling desired and observed state requires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Desired and observed agree
    InSync,
    Launch,
    Quit(ProcessHandle),
    /// Graceful quit already sent to this instance; forced kill is armed
    AwaitingForceKill,
}

impl Plan {
    /// The physical action this plan performs, if any
    pub fn action_kind(&self) -> Option<ActionKind> {
        match self {
            Plan::Launch => Some(ActionKind::Launch),
            Plan::Quit(_) => Some(ActionKind::GracefulQuit),
            Plan::InSync | Plan::AwaitingForceKill => None,
        }
    }
}

/// Result of executing a plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    InSync,
    AwaitingForceKill,
    Launched,
    LaunchFailed(String),
    QuitRequested { pid: u32 },
    QuitFailed { pid: u32, error: String },
}

impl ActionOutcome {
    pub fn error(&self) -> Option<&str> {
        match self {
            ActionOutcome::LaunchFailed(error) | ActionOutcome::QuitFailed { error, .. } => {
                Some(error)
            }
            _ => None,
        }
    }
}

/// Forced kill armed after a graceful quit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingForceKill {
    pub identity: ProcessIdentity,
    pub deadline: DateTime<Local>,
}

/// Result of a forced-kill deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForceKillOutcome {
    Killed { pid: u32 },
    /// Conditions flipped back to "should run"
    SkippedConditionsAllow,
    /// No instance of the target is running any more
    SkippedExited,
    /// A different instance now matches the target
    SkippedRace { expected: u32, found: u32 },
    Failed { pid: u32, error: String },
}

/// Outstanding outcome check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub kind: ActionKind,
    /// Instance the action was aimed at (quit and kill)
    pub identity: Option<ProcessIdentity>,
}

/// Drives launch, quit and kill, and owns their timers
#[derive(Debug)]
pub struct ActionOrchestrator {
    timers: TimerSender,
    force_kill_timeout: Duration,
    verify_delay: Duration,
    kill_slot: TimerSlot,
    pending_kill: Option<PendingForceKill>,
    verify_slot: TimerSlot,
    verification: Option<Verification>,
    last_action: Option<ActionRecord>,
}

impl ActionOrchestrator {
    pub fn new(timing: &TimingConfig, timers: TimerSender) -> Self {
        Self {
            timers,
            force_kill_timeout: timing.force_kill_timeout,
            verify_delay: timing.verify_delay,
            kill_slot: TimerSlot::new(),
            pending_kill: None,
            verify_slot: TimerSlot::new(),
            verification: None,
            last_action: None,
        }
    }

    pub fn set_timing(&mut self, timing: &TimingConfig) {
        self.force_kill_timeout = timing.force_kill_timeout;
        self.verify_delay = timing.verify_delay;
    }

    pub fn pending_force_kill(&self) -> Option<&PendingForceKill> {
        self.pending_kill.as_ref()
    }

    pub fn pending_force_kill_view(&self) -> Option<PendingForceKillView> {
        self.pending_kill.as_ref().map(|p| PendingForceKillView {
            pid: p.identity.pid,
            deadline: p.deadline,
        })
    }

    pub fn last_action(&self) -> Option<&ActionRecord> {
        self.last_action.as_ref()
    }

    /// Work out what to do. Does not touch the host.
    pub fn plan(&self, desired_run: bool, observed: Option<&ProcessHandle>) -> Plan {
        match (desired_run, observed) {
            (true, Some(_)) | (false, None) => Plan::InSync,
            (true, None) => Plan::Launch,
            (false, Some(handle)) => match &self.pending_kill {
                Some(pending) if pending.identity == handle.identity() => Plan::AwaitingForceKill,
                _ => Plan::Quit(handle.clone()),
            },
        }
    }

    /// Carry out a plan
    pub async fn execute(
        &mut self,
        plan: Plan,
        host: &dyn ProcessHost,
        target: &TargetIdentity,
    ) -> ActionOutcome {
        match plan {
            Plan::InSync => {
                self.cancel_force_kill("desired state reached");
                ActionOutcome::InSync
            }
            Plan::AwaitingForceKill => ActionOutcome::AwaitingForceKill,
            Plan::Launch => {
                self.cancel_force_kill("target should run");
                self.launch(host, target).await
            }
            Plan::Quit(handle) => self.quit(host, &handle).await,
        }
    }

    async fn launch(&mut self, host: &dyn ProcessHost, target: &TargetIdentity) -> ActionOutcome {
        info!(target = %target, "Launching target");

        let result = host.launch_in_background(target).await;
        let accepted = result.is_ok();
        let error = result.err().map(|e| e.to_string());

        self.record(ActionKind::Launch, None, accepted, error.clone());
        self.arm_verification(ActionKind::Launch, None);

        match error {
            None => ActionOutcome::Launched,
            Some(error) => {
                warn!(target = %target, error = %error, "Launch failed");
                ActionOutcome::LaunchFailed(error)
            }
        }
    }

    async fn quit(&mut self, host: &dyn ProcessHost, handle: &ProcessHandle) -> ActionOutcome {
        let identity = handle.identity();
        if let Some(stale) = self.pending_kill.as_ref() {
            debug!(
                stale = %stale.identity,
                current = %identity,
                "Superseding forced kill armed for another instance"
            );
        }
        self.cancel_force_kill("superseded by new graceful quit");

        info!(pid = identity.pid, name = %handle.name, "Requesting graceful quit");
        let result = host.request_graceful_quit(handle).await;

        let outcome = match &result {
            Ok(()) => ActionOutcome::QuitRequested { pid: identity.pid },
            Err(e) => {
                warn!(pid = identity.pid, error = %e, "Graceful quit failed");
                ActionOutcome::QuitFailed {
                    pid: identity.pid,
                    error: e.to_string(),
                }
            }
        };

        self.record(
            ActionKind::GracefulQuit,
            Some(identity.pid),
            result.is_ok(),
            outcome.error().map(str::to_string),
        );

        // Escalate unless the process is already gone
        if !matches!(result, Err(HostError::ProcessNotFound)) {
            self.arm_force_kill(identity);
        }
        self.arm_verification(ActionKind::GracefulQuit, Some(identity));

        outcome
    }

    fn arm_force_kill(&mut self, identity: ProcessIdentity) {
        let timeout = self.force_kill_timeout;
        let deadline = custodian_util::now()
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());

        self.kill_slot
            .arm(timeout, &self.timers, |generation| TimerEvent::ForceKillDeadline {
                generation,
            });
        self.pending_kill = Some(PendingForceKill { identity, deadline });

        debug!(pid = identity.pid, timeout = %format_seconds(timeout), "Forced kill armed");
    }

    /// Disarm the forced kill. Safe to call when nothing is armed.
    pub fn cancel_force_kill(&mut self, why: &str) -> bool {
        self.kill_slot.cancel();
        match self.pending_kill.take() {
            Some(pending) => {
                info!(pid = pending.identity.pid, reason = why, "Forced kill cancelled");
                true
            }
            None => false,
        }
    }

    /// The target exited; a kill aimed at it is moot
    pub fn process_exited(&mut self, pid: u32) {
        let matches = self
            .pending_kill
            .as_ref()
            .is_some_and(|p| p.identity.pid == pid);
        if matches {
            self.cancel_force_kill("process exited");
        }
    }

    /// Claim a fired deadline. `None` if it was cancelled or replaced.
    pub fn take_force_kill(&mut self, generation: u64) -> Option<PendingForceKill> {
        if self.kill_slot.accept(generation) {
            self.pending_kill.take()
        } else {
            None
        }
    }

    /// Act on a fired deadline, given a fresh decision and a fresh lookup
    pub async fn finish_force_kill(
        &mut self,
        pending: PendingForceKill,
        decision: &Decision,
        current: Option<&ProcessHandle>,
        host: &dyn ProcessHost,
    ) -> ForceKillOutcome {
        let expected = pending.identity;

        if decision.desired_run {
            info!(pid = expected.pid, "Conditions allow again; forced kill skipped");
            return ForceKillOutcome::SkippedConditionsAllow;
        }

        let current = match current {
            Some(current) => current,
            None => {
                debug!(pid = expected.pid, "Target already exited; forced kill skipped");
                return ForceKillOutcome::SkippedExited;
            }
        };

        if current.identity() != expected {
            warn!(
                expected = %expected,
                found = %current.identity(),
                "Target identity changed; forced kill skipped"
            );
            return ForceKillOutcome::SkippedRace {
                expected: expected.pid,
                found: current.pid(),
            };
        }

        info!(pid = expected.pid, "Graceful quit timed out; forcing kill");
        let result = host.force_kill(current).await;
        let error = result.err().map(|e| e.to_string());

        self.record(ActionKind::ForceKill, Some(expected.pid), error.is_none(), error.clone());
        self.arm_verification(ActionKind::ForceKill, Some(expected));

        match error {
            None => ForceKillOutcome::Killed { pid: expected.pid },
            Some(error) => {
                warn!(pid = expected.pid, error = %error, "Forced kill failed");
                ForceKillOutcome::Failed {
                    pid: expected.pid,
                    error,
                }
            }
        }
    }

    fn arm_verification(&mut self, kind: ActionKind, identity: Option<ProcessIdentity>) {
        self.verify_slot
            .arm(self.verify_delay, &self.timers, |generation| TimerEvent::VerifyAction {
                generation,
                kind,
            });
        self.verification = Some(Verification { kind, identity });
    }

    /// Claim a fired verification. `None` if it was replaced.
    pub fn take_verification(&mut self, generation: u64) -> Option<Verification> {
        if self.verify_slot.accept(generation) {
            self.verification.take()
        } else {
            None
        }
    }

    /// Judge an action by what the process table shows now
    pub fn verify(&mut self, verification: &Verification, current: Option<&ProcessHandle>) -> bool {
        let succeeded = match verification.kind {
            ActionKind::Launch => current.is_some(),
            ActionKind::GracefulQuit | ActionKind::ForceKill => match (current, verification.identity) {
                (None, _) => true,
                (Some(current), Some(expected)) => current.identity() != expected,
                (Some(_), None) => false,
            },
        };

        if let Some(record) = self.last_action.as_mut() {
            if record.kind == verification.kind {
                record.verified = Some(succeeded);
            }
        }

        if succeeded {
            info!(action = %verification.kind, "Action verified");
        } else if verification.kind == ActionKind::GracefulQuit && self.pending_kill.is_some() {
            debug!("Target still running after graceful quit; forced kill pending");
        } else {
            warn!(action = %verification.kind, "Action did not take effect");
        }

        succeeded
    }

    /// Cancel every timer this orchestrator owns
    pub fn cancel_all(&mut self) {
        self.cancel_force_kill("runtime shutdown");
        self.verify_slot.cancel();
        self.verification = None;
    }

    fn record(&mut self, kind: ActionKind, pid: Option<u32>, accepted: bool, detail: Option<String>) {
        self.last_action = Some(ActionRecord {
            kind,
            at: custodian_util::now(),
            pid,
            accepted,
            verified: None,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custodian_host_api::MockProcessHost;
    use tokio::sync::mpsc;

    fn target() -> TargetIdentity {
        TargetIdentity::Name("sync-agent".into())
    }

    fn blocked() -> Decision {
        Decision {
            desired_run: false,
            block: Some(custodian_api::BlockReason::Unreachable),
            reason: "blocked".into(),
        }
    }

    fn allowed() -> Decision {
        Decision {
            desired_run: true,
            block: None,
            reason: "allowed".into(),
        }
    }

    fn orchestrator() -> (ActionOrchestrator, crate::TimerReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ActionOrchestrator::new(&TimingConfig::default(), tx), rx)
    }

    #[test]
    fn plan_covers_every_combination() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let orchestrator = ActionOrchestrator::new(&TimingConfig::default(), tx);
        let handle = ProcessHandle::new(ProcessIdentity::new(7, 1), "sync-agent");

        assert_eq!(orchestrator.plan(true, Some(&handle)), Plan::InSync);
        assert_eq!(orchestrator.plan(false, None), Plan::InSync);
        assert_eq!(orchestrator.plan(true, None), Plan::Launch);
        assert_eq!(orchestrator.plan(false, Some(&handle)), Plan::Quit(handle.clone()));
    }

    #[tokio::test(start_paused = true)]
    async fn quit_arms_kill_and_verification() {
        let (mut orchestrator, mut rx) = orchestrator();
        let host = MockProcessHost::new();
        host.update(|s| s.quit_exits = false);
        let handle = host.simulate_start("sync-agent");

        let outcome = orchestrator
            .execute(Plan::Quit(handle.clone()), &host, &target())
            .await;
        assert_eq!(outcome, ActionOutcome::QuitRequested { pid: handle.pid() });
        assert_eq!(
            orchestrator.pending_force_kill().map(|p| p.identity),
            Some(handle.identity())
        );
        assert_eq!(orchestrator.plan(false, Some(&handle)), Plan::AwaitingForceKill);

        // Verification fires first, then the deadline
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, TimerEvent::VerifyAction { kind: ActionKind::GracefulQuit, .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, TimerEvent::ForceKillDeadline { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_kills_same_instance() {
        let (mut orchestrator, _rx) = orchestrator();
        let host = MockProcessHost::new();
        host.update(|s| s.quit_exits = false);
        let handle = host.simulate_start("sync-agent");

        orchestrator.execute(Plan::Quit(handle.clone()), &host, &target()).await;
        let pending = orchestrator.pending_force_kill().cloned().unwrap();

        let outcome = orchestrator
            .finish_force_kill(pending, &blocked(), host.running().as_ref(), &host)
            .await;
        assert_eq!(outcome, ForceKillOutcome::Killed { pid: handle.pid() });
        assert_eq!(host.kills(), 1);
        assert!(host.running().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_skips_when_conditions_allow() {
        let (mut orchestrator, _rx) = orchestrator();
        let host = MockProcessHost::new();
        host.update(|s| s.quit_exits = false);
        let handle = host.simulate_start("sync-agent");

        orchestrator.execute(Plan::Quit(handle), &host, &target()).await;
        let pending = orchestrator.pending_force_kill().cloned().unwrap();

        let outcome = orchestrator
            .finish_force_kill(pending, &allowed(), host.running().as_ref(), &host)
            .await;
        assert_eq!(outcome, ForceKillOutcome::SkippedConditionsAllow);
        assert_eq!(host.kills(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_skips_replaced_instance() {
        let (mut orchestrator, _rx) = orchestrator();
        let host = MockProcessHost::new();
        host.update(|s| s.quit_exits = false);
        let handle = host.simulate_start("sync-agent");

        orchestrator.execute(Plan::Quit(handle.clone()), &host, &target()).await;
        let pending = orchestrator.pending_force_kill().cloned().unwrap();
        let replacement = host.simulate_restart();

        let outcome = orchestrator
            .finish_force_kill(pending, &blocked(), Some(&replacement), &host)
            .await;
        assert_eq!(
            outcome,
            ForceKillOutcome::SkippedRace {
                expected: handle.pid(),
                found: replacement.pid(),
            }
        );
        assert_eq!(host.kills(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn new_quit_supersedes_stale_kill() {
        let (mut orchestrator, mut rx) = orchestrator();
        let host = MockProcessHost::new();
        host.update(|s| s.quit_exits = false);
        let old = host.simulate_start("sync-agent");

        orchestrator.execute(Plan::Quit(old), &host, &target()).await;
        let new = host.simulate_restart();
        assert_eq!(orchestrator.plan(false, Some(&new)), Plan::Quit(new.clone()));
        orchestrator.execute(Plan::Quit(new.clone()), &host, &target()).await;

        assert_eq!(
            orchestrator.pending_force_kill().map(|p| p.identity),
            Some(new.identity())
        );

        // Only the second arming is accepted
        let mut accepted = 0;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(60), rx.recv()).await
        {
            if let TimerEvent::ForceKillDeadline { generation } = event {
                if orchestrator.take_force_kill(generation).is_some() {
                    accepted += 1;
                }
            }
        }
        assert_eq!(accepted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn launch_failure_is_reported_not_raised() {
        let (mut orchestrator, _rx) = orchestrator();
        let host = MockProcessHost::new();
        host.update(|s| s.fail_launch = true);

        let outcome = orchestrator.execute(Plan::Launch, &host, &target()).await;
        assert!(matches!(outcome, ActionOutcome::LaunchFailed(_)));
        let record = orchestrator.last_action().unwrap();
        assert_eq!(record.kind, ActionKind::Launch);
        assert!(!record.accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn verification_updates_last_action() {
        let (mut orchestrator, mut rx) = orchestrator();
        let host = MockProcessHost::new();

        orchestrator.execute(Plan::Launch, &host, &target()).await;
        let TimerEvent::VerifyAction { generation, .. } = rx.recv().await.unwrap() else {
            panic!("expected verification");
        };
        let verification = orchestrator.take_verification(generation).unwrap();
        assert!(orchestrator.verify(&verification, host.running().as_ref()));
        assert_eq!(orchestrator.last_action().unwrap().verified, Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_is_idempotent() {
        let (mut orchestrator, _rx) = orchestrator();
        orchestrator.cancel_all();
        orchestrator.cancel_all();
        assert!(orchestrator.pending_force_kill().is_none());
    }
}
