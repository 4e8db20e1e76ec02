//! Event types for custodian -> client streaming

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::{ActionKind, StatusSnapshot, API_VERSION};

/// Event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub api_version: u32,
    pub timestamp: DateTime<Local>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            api_version: API_VERSION,
            timestamp: custodian_util::now(),
            payload,
        }
    }
}

/// All possible events from the service to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Full status snapshot (sent after every evaluation and settings change)
    StatusChanged(StatusSnapshot),

    /// A launch, quit or kill was issued
    ActionPerformed {
        kind: ActionKind,
        pid: Option<u32>,
        accepted: bool,
    },

    /// Delayed re-check of an action finished
    ActionVerified { kind: ActionKind, succeeded: bool },

    /// Configuration was reloaded from disk
    ConfigReloaded,

    /// Service is shutting down
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization() {
        let event = Event::new(EventPayload::ActionPerformed {
            kind: ActionKind::GracefulQuit,
            pid: Some(4242),
            accepted: true,
        });

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.api_version, API_VERSION);
        assert!(matches!(
            parsed.payload,
            EventPayload::ActionPerformed { kind: ActionKind::GracefulQuit, pid: Some(4242), .. }
        ));
    }
}
