//! Run state owned by the controller

use chrono::{DateTime, Local};
use custodian_api::{BlockReason, ControllerPhase, SensorSnapshot};
use custodian_host_api::{ProcessHandle, ProcessIdentity};
use tracing::debug;

use crate::Decision;

/// Everything the controller remembers between evaluations.
///
/// Only mutated from inside the controller, one message at a time.
#[derive(Debug, Clone)]
pub struct RunState {
    /// `None` until the first evaluation completes
    pub desired_run: Option<bool>,
    pub observed_run: bool,
    pub last_reason: String,
    pub last_block: Option<BlockReason>,
    pub last_trigger: Option<String>,
    pub last_evaluation_at: Option<DateTime<Local>>,
    pub sensors: Option<SensorSnapshot>,
    pub last_error: Option<String>,
    /// Errors recorded so far, so a cycle can tell whether it added one
    error_count: u64,
    /// Instance seen by the last lookup; used to correlate exit notifications
    pub last_known_identity: Option<ProcessIdentity>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            desired_run: None,
            observed_run: false,
            last_reason: "not evaluated yet".to_string(),
            last_block: None,
            last_trigger: None,
            last_evaluation_at: None,
            sensors: None,
            last_error: None,
            error_count: 0,
            last_known_identity: None,
        }
    }
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fresh decision and what the sensors showed
    pub fn record_decision(&mut self, decision: &Decision, snapshot: SensorSnapshot) {
        self.desired_run = Some(decision.desired_run);
        self.last_reason = decision.reason.clone();
        self.last_block = decision.block.clone();
        self.sensors = Some(snapshot);
    }

    /// Store the result of a process lookup
    pub fn record_observation(&mut self, observed: Option<&ProcessHandle>) {
        self.observed_run = observed.is_some();
        if let Some(handle) = observed {
            self.last_known_identity = Some(handle.identity());
        }
    }

    /// An exit notification arrived. Returns whether it was for the
    /// instance last seen.
    pub fn record_exit(&mut self, pid: u32) -> bool {
        let matches = self.last_known_identity.is_some_and(|id| id.pid == pid);
        if matches {
            self.observed_run = false;
            self.last_known_identity = None;
        }
        matches
    }

    pub fn record_error(&mut self, error: impl std::fmt::Display) {
        let message = error.to_string();
        debug!(error = %message, "Recording last error");
        self.last_error = Some(message);
        self.error_count += 1;
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn clear_error(&mut self) {
        if let Some(previous) = self.last_error.take() {
            debug!(error = %previous, "Clearing last error");
        }
    }

    /// Forget decisions, e.g. after the target or rules changed
    pub fn reset_decision(&mut self) {
        self.desired_run = None;
        self.last_block = None;
        self.last_reason = "not evaluated yet".to_string();
    }
}

/// Inputs that determine the controller phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseInputs {
    pub configured: bool,
    pub automation_enabled: bool,
    pub evaluation_pending: bool,
    pub desired_run: Option<bool>,
    pub observed_run: bool,
    pub force_kill_pending: bool,
}

/// Map the current facts onto a phase
pub fn derive_phase(inputs: PhaseInputs) -> ControllerPhase {
    if !inputs.configured {
        return ControllerPhase::Unconfigured;
    }
    if !inputs.automation_enabled {
        return ControllerPhase::Disabled;
    }

    let phase = match (inputs.desired_run, inputs.observed_run) {
        (None, _) => ControllerPhase::Evaluating,
        (Some(true), true) => ControllerPhase::RunningAllowed,
        (Some(true), false) => ControllerPhase::WaitingToLaunch,
        (Some(false), true) if inputs.force_kill_pending => ControllerPhase::ForceKillPending,
        (Some(false), true) => ControllerPhase::RunningBlocked,
        (Some(false), false) => ControllerPhase::StoppedBlocked,
    };

    // A settled phase holds until the next trigger
    if phase.is_settled() && inputs.evaluation_pending {
        ControllerPhase::Evaluating
    } else {
        phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> PhaseInputs {
        PhaseInputs {
            configured: true,
            automation_enabled: true,
            evaluation_pending: false,
            desired_run: Some(true),
            observed_run: true,
            force_kill_pending: false,
        }
    }

    #[test]
    fn unconfigured_wins() {
        let phase = derive_phase(PhaseInputs {
            configured: false,
            automation_enabled: false,
            ..inputs()
        });
        assert_eq!(phase, ControllerPhase::Unconfigured);
    }

    #[test]
    fn disabled_when_automation_off() {
        let phase = derive_phase(PhaseInputs {
            automation_enabled: false,
            ..inputs()
        });
        assert_eq!(phase, ControllerPhase::Disabled);
    }

    #[test]
    fn settled_phases() {
        assert_eq!(derive_phase(inputs()), ControllerPhase::RunningAllowed);
        let stopped = PhaseInputs {
            desired_run: Some(false),
            observed_run: false,
            ..inputs()
        };
        assert_eq!(derive_phase(stopped), ControllerPhase::StoppedBlocked);
        assert!(derive_phase(stopped).is_settled());
    }

    #[test]
    fn pending_trigger_reopens_settled_phase() {
        let pending = PhaseInputs {
            evaluation_pending: true,
            ..inputs()
        };
        assert_eq!(derive_phase(pending), ControllerPhase::Evaluating);

        let waiting = PhaseInputs {
            observed_run: false,
            ..pending
        };
        assert_eq!(derive_phase(waiting), ControllerPhase::WaitingToLaunch);
    }

    #[test]
    fn quit_in_flight_phases() {
        let blocked = PhaseInputs {
            desired_run: Some(false),
            ..inputs()
        };
        assert_eq!(derive_phase(blocked), ControllerPhase::RunningBlocked);
        assert_eq!(
            derive_phase(PhaseInputs {
                force_kill_pending: true,
                ..blocked
            }),
            ControllerPhase::ForceKillPending
        );
    }

    #[test]
    fn exit_correlation_requires_matching_pid() {
        let mut state = RunState::new();
        let handle = ProcessHandle::new(ProcessIdentity::new(41, 3), "sync-agent");
        state.record_observation(Some(&handle));

        assert!(!state.record_exit(99));
        assert!(state.observed_run);
        assert!(state.record_exit(41));
        assert!(!state.observed_run);
    }
}
