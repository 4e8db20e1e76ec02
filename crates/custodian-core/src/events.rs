//! Core events emitted by the controller

use custodian_api::ActionKind;
use std::time::Duration;

/// Events emitted by the controller for the service layer to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// An evaluation cycle completed
    Evaluated {
        trigger: String,
        desired_run: bool,
        observed_run: bool,
        reason: String,
    },

    /// A launch, graceful quit or forced kill was issued
    ActionPerformed {
        kind: ActionKind,
        pid: Option<u32>,
        accepted: bool,
    },

    /// An action was held back by the minimum action gap
    ActionDeferred { kind: ActionKind, remaining: Duration },

    /// Delayed outcome check finished
    ActionVerified { kind: ActionKind, succeeded: bool },

    /// Forced kill was not carried out
    ForceKillSkipped { pid: u32, reason: String },

    /// Automation, target, rules or timing changed
    SettingsChanged,
}

