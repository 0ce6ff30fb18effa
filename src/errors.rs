use std::time::Duration;
use thiserror::Error;

/// Failures of the pure handshake codec. None of these touch a socket.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("unsupported protocol version {0:?}")]
    VersionMismatch(String),
    #[error("truncated {what}: expected {expected} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("peer refused the connection: {0}")]
    Refused(String),
    #[error("reason string of {0} bytes exceeds limit")]
    ReasonTooLong(usize),
    #[error("invalid authentication type {0}")]
    InvalidAuthType(u8),
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed control request: {0}")]
    MalformedControlRequest(String),
    #[error("protocol version mismatch: {0}")]
    ProtocolVersionMismatch(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),
    #[error("no client connected within {0:?}")]
    NoClientConnectionTimeout(Duration),
    #[error("could not connect to backend {target} after {attempts} attempts: {source}")]
    BackendConnectFailure {
        target: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("backend handshake failed: {0}")]
    BackendHandshakeFailure(String),
    #[error("unable to listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Short stable name of the error kind, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::MalformedControlRequest(_) => "malformed_control_request",
            ProxyError::ProtocolVersionMismatch(_) => "protocol_version_mismatch",
            ProxyError::AuthenticationFailure(_) => "authentication_failure",
            ProxyError::NoClientConnectionTimeout(_) => "no_client_connection_timeout",
            ProxyError::BackendConnectFailure { .. } => "backend_connect_failure",
            ProxyError::BackendHandshakeFailure(_) => "backend_handshake_failure",
            ProxyError::Bind { .. } => "bind_failure",
            ProxyError::Io(_) => "io",
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
