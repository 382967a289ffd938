use std::time::Duration;

use serde_json::Value;

use crate::internal::mcp::codec::CodecError;

pub mod manager;
pub mod process;
pub mod reconnect;
pub mod registry;
pub mod stdio;

pub use manager::{ServerStatus, TransportManager};
pub use process::{ExitInfo, ProcessManager, ServerSpec};
pub use reconnect::{ReconnectPolicy, ReconnectState};
pub use stdio::{
    NotificationHandler, RequestHandler, StdioTransport, TransportOptions, TransportState,
};

/// Transport-level error taxonomy.
///
/// Per-frame problems (`Codec::MalformedFrame`) are recovered inside the
/// read loop and never surface here; everything below is visible to callers.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },
    #[error("server error {code}: {message}")]
    Rpc {
        code: i32,
        message: String,
        data: Option<Value>,
    },
    #[error("server '{0}' exhausted its reconnect attempts")]
    MaxRetriesExceeded(String),
    #[error("no server named '{0}' is configured")]
    UnknownServer(String),
}

impl TransportError {
    pub fn connection_closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }
}
