//! Error types for the client core.
//!
//! Errors fall into six kinds: transport I/O, protocol framing, server
//! `-` replies, lost connections, exhausted reconnection budgets, and
//! submission-time validation. Framing errors are fatal to the
//! connection; server replies are delivered to the command that caused
//! them.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// All error variants for redlink.
#[derive(Debug, Error)]
pub enum RedlinkError {
    /// TCP / socket level errors.
    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    /// RESP framing violation observed on the wire. Fatal: the engine
    /// tears the connection down and reconnects.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with an error reply (`-` frame).
    #[error("{message}")]
    Server {
        message: String,
        /// Uppercased name of the command that produced the error.
        command_used: Option<String>,
    },

    /// The connection was lost while the command was queued or pending.
    #[error("connection gone: {reason}")]
    ConnectionGone { reason: &'static str },

    /// Reconnection gave up: `max_attempts` reached or the cumulative
    /// retry time exceeded `connect_timeout`.
    #[error("reconnection aborted after {attempts} attempts ({total_wait_ms} ms): {cause}")]
    RetryExhausted {
        attempts: u32,
        total_wait_ms: u64,
        cause: &'static str,
    },

    /// Submission while the connection is not ready and the offline
    /// queue is disabled.
    #[error("stream not writeable")]
    NotWritable,

    /// Submission-time validation failure (missing value, bad argument
    /// shape).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A non-subscriber command was issued while subscriptions exist.
    #[error("connection in subscriber mode, only subscriber commands may be used")]
    SubscriberMode,

    /// The client handle was dropped or QUIT completed; no further
    /// commands can be submitted.
    #[error("the connection has been closed")]
    Closed,
}

impl RedlinkError {
    /// Build a server error, attaching the command that produced it.
    pub fn server(message: impl Into<String>, command: &str) -> Self {
        Self::Server {
            message: message.into(),
            command_used: Some(command.to_ascii_uppercase()),
        }
    }

    /// Server error without a known originating command.
    pub fn server_bare(message: impl Into<String>) -> Self {
        Self::Server {
            message: message.into(),
            command_used: None,
        }
    }

    /// True for `-LOADING …` replies: the server is reading its dataset
    /// and will accept the command later.
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Server { message, .. } if message.starts_with("LOADING"))
    }

    /// True for the AUTH reply sent by servers that have no password
    /// configured. Treated as success by the handshake.
    pub fn is_no_password_set(&self) -> bool {
        matches!(self, Self::Server { message, .. } if message.contains("no password is set"))
    }

    /// True when the error means the connection itself is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Protocol(_)
                | Self::ConnectionGone { .. }
                | Self::RetryExhausted { .. }
        )
    }
}

/// Shared error handle used on the event bus (events are cloned per
/// subscriber).
pub type SharedError = Arc<RedlinkError>;

pub type Result<T> = std::result::Result<T, RedlinkError>;

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_uppercases_command() {
        let err = RedlinkError::server("ERR wrong number of arguments", "get");
        match err {
            RedlinkError::Server { command_used, .. } => {
                assert_eq!(command_used.as_deref(), Some("GET"));
            }
            other => panic!("expected Server, got {other:?}"),
        }
    }

    #[test]
    fn loading_detection() {
        let err = RedlinkError::server_bare("LOADING Redis is loading the dataset in memory");
        assert!(err.is_loading());
        assert!(!err.is_no_password_set());
    }

    #[test]
    fn no_password_detection() {
        let err = RedlinkError::server("ERR Client sent AUTH, but no password is set", "auth");
        assert!(err.is_no_password_set());
        assert!(!err.is_loading());
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            RedlinkError::NotWritable.to_string(),
            "stream not writeable"
        );
        assert_eq!(
            RedlinkError::ConnectionGone { reason: "close" }.to_string(),
            "connection gone: close"
        );
        assert!(RedlinkError::SubscriberMode
            .to_string()
            .contains("only subscriber commands"));
        let err = RedlinkError::server_bare("ERR unknown command 'FOO'");
        assert_eq!(err.to_string(), "ERR unknown command 'FOO'");
    }

    #[test]
    fn fatality() {
        assert!(RedlinkError::Protocol("bad prefix".into()).is_fatal());
        assert!(RedlinkError::ConnectionGone { reason: "end" }.is_fatal());
        assert!(!RedlinkError::server_bare("ERR nope").is_fatal());
        assert!(!RedlinkError::NotWritable.is_fatal());
    }

    #[test]
    fn io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err: RedlinkError = io_err.into();
        assert!(matches!(err, RedlinkError::Io(_)));
        assert!(err.to_string().contains("connection error"));
    }
}
