pub mod config;
pub mod control;
pub mod errors;
pub mod handshake;
pub mod relay;
pub mod session;
pub mod supervisor;

pub use config::SessionConfig;
pub use control::{request_forwarding, ControlListener, ForwardingRequest};
pub use errors::{HandshakeError, ProxyError, ProxyResult};
pub use session::{Session, SessionId, SessionIds, SessionState};

pub const DEFAULT_CONTROL_SOCKET: &str = "/var/run/vnc-authproxy/ctrl.sock";
pub const DEFAULT_PID_FILE: &str = "/var/run/vnc-authproxy/vnc-authproxyd.pid";
pub const DEFAULT_LOG_DIR: &str = "/var/log/vnc-authproxy";

// Session defaults
pub const DEFAULT_ACCEPT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;
