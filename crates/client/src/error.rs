//! Error types for the transport layer.

use std::fmt;

use protocol::ProtocolError;
use thiserror::Error;

use crate::config::ConfigError;

/// Which blocking step ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Establishing a connection (TCP, TLS or websocket upgrade).
    Connect,
    /// Writing a frame or request.
    Send,
    /// Waiting for a response.
    Read,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeoutKind::Connect => "connect",
            TimeoutKind::Send => "send",
            TimeoutKind::Read => "read",
        };
        f.write_str(name)
    }
}

/// Client error type covering transport, protocol and server failures.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Socket or HTTP transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// HTTP response with a non-200 status.
    #[error("http status {status}: {reason}")]
    HttpStatus {
        /// Status code.
        status: u16,
        /// Canonical reason phrase.
        reason: String,
    },

    /// A connect, send or read step timed out.
    #[error("timeout to {0}")]
    Timeout(TimeoutKind),

    /// Frame could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Server answered with a non-zero error code.
    #[error("server error {code}: {message}")]
    Server {
        /// Platform error code.
        code: i64,
        /// Platform error message.
        message: String,
    },

    /// Request could not be built or signed.
    #[error("signing error: {0}")]
    Signing(String),

    /// The connection is closed or was closed while waiting.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ClientError {
    /// Whether the error leaves the websocket unusable.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_) | ClientError::Protocol(_) | ClientError::ConnectionClosed(_)
        )
    }

    /// Whether the error is a timeout of the given kind.
    pub fn is_timeout(&self, kind: TimeoutKind) -> bool {
        matches!(self, ClientError::Timeout(k) if *k == kind)
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                ClientError::ConnectionClosed(err.to_string())
            }
            WsError::Http(response) => ClientError::Transport(format!(
                "websocket upgrade rejected with status {}",
                response.status()
            )),
            other => ClientError::Transport(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            if err.is_connect() {
                ClientError::Timeout(TimeoutKind::Connect)
            } else {
                ClientError::Timeout(TimeoutKind::Read)
            }
        } else if let Some(status) = err.status() {
            ClientError::HttpStatus {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("unknown").to_string(),
            }
        } else {
            ClientError::Transport(err.to_string())
        }
    }
}
