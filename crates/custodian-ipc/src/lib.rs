//! Control socket for custodiand
//!
//! One JSON document per line in both directions. Clients send requests;
//! the service answers each one in order and, once a client has
//! subscribed, interleaves events. The peer's UID decides whether it may
//! change settings.

mod client;
mod server;

pub use client::*;
pub use server::*;

use custodian_api::{ErrorCode, ErrorInfo};
use thiserror::Error;

/// Longest request line the server accepts
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Server not started")]
    NotStarted,

    /// The service answered with an error response
    #[error("Request rejected ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },
}

impl From<ErrorInfo> for IpcError {
    fn from(info: ErrorInfo) -> Self {
        IpcError::Rejected {
            code: info.code,
            message: info.message,
        }
    }
}

pub type IpcResult<T> = Result<T, IpcError>;
