//! Requests, responses and the commands they carry

use serde::{Deserialize, Serialize};
use custodian_util::ClientId;
use std::fmt;
use std::time::Duration;

use crate::{StatusSnapshot, TargetIdentity, API_VERSION};

fn current_api_version() -> u32 {
    API_VERSION
}

/// One line from a client. `request_id` is echoed back in the response;
/// a missing `api_version` is taken to be the current one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub request_id: u64,
    #[serde(default = "current_api_version")]
    pub api_version: u32,
    pub command: Command,
}

impl Request {
    pub fn new(request_id: u64, command: Command) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            command,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// 0 when the request could not be parsed
    pub request_id: u64,
    pub api_version: u32,
    pub result: ResponseResult,
}

impl Response {
    fn with_result(request_id: u64, result: ResponseResult) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result,
        }
    }

    pub fn success(request_id: u64, payload: ResponsePayload) -> Self {
        Self::with_result(request_id, ResponseResult::Ok(payload))
    }

    pub fn error(request_id: u64, error: ErrorInfo) -> Self {
        Self::with_result(request_id, ResponseResult::Err(error))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseResult {
    Ok(ResponsePayload),
    Err(ErrorInfo),
}

impl ResponseResult {
    pub fn into_result(self) -> Result<ResponsePayload, ErrorInfo> {
        match self {
            ResponseResult::Ok(payload) => Ok(payload),
            ResponseResult::Err(error) => Err(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

/// Error codes for the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    PermissionDenied,
    UnsupportedVersion,
    InternalError,
}

/// All possible commands from clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Get the current status snapshot
    GetStatus,

    /// Schedule an evaluation. `delay` overrides the debounce delay;
    /// zero runs it on the next loop iteration.
    TriggerEvaluation {
        source: Option<String>,
        delay: Option<Duration>,
    },

    /// Subscribe to events (returns immediately, events stream separately)
    SubscribeEvents,

    // Settings commands (owner only)

    SetAutomationEnabled { enabled: bool },

    /// Replace the target. Both fields blank clears it.
    SetTarget {
        identifier: Option<String>,
        name: Option<String>,
    },

    /// Empty string means "any network"
    SetRequiredNetwork { network: String },

    /// Ping for keepalive
    Ping,
}

impl Command {
    /// Commands that change settings rather than read state
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Command::SetAutomationEnabled { .. }
                | Command::SetTarget { .. }
                | Command::SetRequiredNetwork { .. }
        )
    }
}

/// Response payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    Status(StatusSnapshot),
    EvaluationScheduled,
    Subscribed { client_id: ClientId },
    AutomationSet { enabled: bool },
    TargetSet { target: Option<TargetIdentity> },
    RequiredNetworkSet { network: Option<String> },
    Pong,
}

/// Role of a connected client, derived from its peer credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    /// Same user as the service, or root
    Owner,
    /// Anyone else with access to the socket
    Observer,
}

impl ClientRole {
    pub fn can_mutate(self) -> bool {
        self == ClientRole::Owner
    }
}

/// What the socket layer knows about a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub role: ClientRole,
    /// Peer UID, when the kernel reported one
    pub uid: Option<u32>,
}

impl ClientInfo {
    pub fn new(role: ClientRole, uid: Option<u32>) -> Self {
        Self {
            client_id: ClientId::new(),
            role,
            uid,
        }
    }
}
