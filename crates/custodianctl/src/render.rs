//! Human-readable output

use custodian_api::{EventPayload, ResponsePayload, StatusSnapshot};

pub fn status(status: &StatusSnapshot) -> String {
    let mut lines = Vec::new();

    lines.push(format!(
        "target:      {}",
        status
            .target
            .as_ref()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "(not configured)".into())
    ));
    lines.push(format!(
        "automation:  {}",
        if status.automation_enabled { "enabled" } else { "disabled" }
    ));
    lines.push(format!(
        "network:     {}",
        status.required_network.as_deref().unwrap_or("(any)")
    ));
    lines.push(format!("phase:       {}", status.phase));
    lines.push(format!(
        "desired:     {}",
        match status.desired_run {
            Some(true) => "run",
            Some(false) => "stop",
            None => "(not evaluated)",
        }
    ));
    lines.push(format!(
        "observed:    {}",
        if status.observed_run { "running" } else { "stopped" }
    ));
    lines.push(format!("reason:      {}", status.last_reason));

    if let Some(at) = status.last_evaluation_at {
        lines.push(format!(
            "evaluated:   {} ({})",
            at.format("%Y-%m-%d %H:%M:%S"),
            status.last_trigger.as_deref().unwrap_or("unknown trigger")
        ));
    }
    if let Some(sensors) = &status.sensors {
        lines.push(format!("sensors:     {}", sensors.facts()));
    }
    if let Some(action) = &status.last_action {
        let verified = match action.verified {
            Some(true) => "verified",
            Some(false) => "not verified",
            None => "pending check",
        };
        lines.push(format!(
            "last action: {} at {}{} ({}, {})",
            action.kind,
            action.at.format("%H:%M:%S"),
            action.pid.map(|p| format!(" pid {}", p)).unwrap_or_default(),
            if action.accepted { "accepted" } else { "refused" },
            verified
        ));
    }
    if let Some(pending) = &status.pending_force_kill {
        lines.push(format!(
            "force kill:  pid {} at {}",
            pending.pid,
            pending.deadline.format("%H:%M:%S")
        ));
    }
    if let Some(error) = &status.last_error {
        lines.push(format!("last error:  {}", error));
    }

    lines.join("\n")
}

pub fn payload(payload: &ResponsePayload) -> String {
    match payload {
        ResponsePayload::Status(snapshot) => status(snapshot),
        ResponsePayload::EvaluationScheduled => "evaluation scheduled".into(),
        ResponsePayload::Subscribed { client_id } => format!("subscribed as {}", client_id),
        ResponsePayload::AutomationSet { enabled } => {
            format!("automation {}", if *enabled { "enabled" } else { "disabled" })
        }
        ResponsePayload::TargetSet { target: Some(target) } => format!("target set to {}", target),
        ResponsePayload::TargetSet { target: None } => "target cleared".into(),
        ResponsePayload::RequiredNetworkSet { network } => format!(
            "required network: {}",
            network.as_deref().unwrap_or("(any)")
        ),
        ResponsePayload::Pong => "pong".into(),
    }
}

pub fn event(payload: &EventPayload) -> String {
    match payload {
        EventPayload::StatusChanged(snapshot) => format!(
            "status: {} ({})",
            snapshot.phase, snapshot.last_reason
        ),
        EventPayload::ActionPerformed {
            kind,
            pid,
            accepted,
        } => format!(
            "action: {}{} {}",
            kind,
            pid.map(|p| format!(" pid {}", p)).unwrap_or_default(),
            if *accepted { "accepted" } else { "refused" }
        ),
        EventPayload::ActionVerified { kind, succeeded } => format!(
            "verified: {} {}",
            kind,
            if *succeeded { "took effect" } else { "did not take effect" }
        ),
        EventPayload::ConfigReloaded => "configuration reloaded".into(),
        EventPayload::Shutdown => "service shutting down".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custodian_api::{
        ActionKind, ActionRecord, ControllerPhase, PendingForceKillView, SensorSnapshot,
        TargetIdentity, API_VERSION,
    };

    fn snapshot() -> StatusSnapshot {
        StatusSnapshot {
            api_version: API_VERSION,
            automation_enabled: true,
            target: None,
            required_network: None,
            phase: ControllerPhase::Unconfigured,
            desired_run: None,
            observed_run: false,
            last_reason: "not configured".into(),
            last_block: None,
            last_trigger: None,
            last_evaluation_at: None,
            sensors: None,
            last_action: None,
            pending_force_kill: None,
            last_error: None,
        }
    }

    #[test]
    fn unconfigured_status() {
        let text = status(&snapshot());
        assert!(text.contains("(not configured)"));
        assert!(text.contains("(any)"));
        assert!(text.contains("(not evaluated)"));
        assert!(!text.contains("last action"));
    }

    #[test]
    fn blocked_status_shows_pending_kill() {
        let now = chrono::Local::now();
        let mut s = snapshot();
        s.target = Some(TargetIdentity::Name("sync-agent".into()));
        s.phase = ControllerPhase::ForceKillPending;
        s.desired_run = Some(false);
        s.observed_run = true;
        s.sensors = Some(SensorSnapshot::unknown());
        s.last_action = Some(ActionRecord {
            kind: ActionKind::GracefulQuit,
            at: now,
            pid: Some(4242),
            accepted: true,
            verified: None,
            detail: None,
        });
        s.pending_force_kill = Some(PendingForceKillView {
            pid: 4242,
            deadline: now,
        });
        s.last_error = Some("Action failed: boom".into());

        let text = status(&s);
        assert!(text.contains("sync-agent"));
        assert!(text.contains("forced kill pending"));
        assert!(text.contains("graceful quit at"));
        assert!(text.contains("pid 4242 (accepted, pending check)"));
        assert!(text.contains("force kill:  pid 4242"));
        assert!(text.contains("Action failed: boom"));
        assert!(text.contains("power=unknown"));
    }

    #[test]
    fn event_lines() {
        let line = event(&EventPayload::ActionPerformed {
            kind: ActionKind::Launch,
            pid: None,
            accepted: false,
        });
        assert_eq!(line, "action: launch refused");
    }
}
