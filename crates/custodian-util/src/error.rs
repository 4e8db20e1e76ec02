//! Error types for custodian

use thiserror::Error;

/// Failures inside one evaluation cycle.
///
/// Configuration problems never get this far: they are corrected at load
/// time and reported as `custodian_config::ConfigIssue`.
#[derive(Debug, Error)]
pub enum CustodianError {
    #[error("Sensor unavailable: {0}")]
    SensorUnavailable(String),

    #[error("Action failed: {0}")]
    ActionFailed(String),

    #[error("Process identity changed: expected pid {expected}, found {found}")]
    RaceDetected { expected: u32, found: u32 },

}

impl CustodianError {
    pub fn sensor(msg: impl Into<String>) -> Self {
        Self::SensorUnavailable(msg.into())
    }

    pub fn action(msg: impl Into<String>) -> Self {
        Self::ActionFailed(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, CustodianError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn race_message_names_both_pids() {
        let err = CustodianError::RaceDetected {
            expected: 100,
            found: 200,
        };
        let msg = err.to_string();
        assert!(msg.contains("100"));
        assert!(msg.contains("200"));
    }
}
