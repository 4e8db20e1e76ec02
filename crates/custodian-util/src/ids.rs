//! Identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One control socket connection, assigned when it is accepted and never
/// reused
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    // Hyphen-free form, easier to grep in logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.as_simple(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_differ() {
        assert_ne!(ClientId::new(), ClientId::new());
    }

    #[test]
    fn wire_form_is_a_plain_uuid_string() {
        let id = ClientId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.0.hyphenated()));
        assert_eq!(serde_json::from_str::<ClientId>(&json).unwrap(), id);
        assert_eq!(id.to_string().len(), 32);
    }
}
