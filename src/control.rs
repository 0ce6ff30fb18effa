//! Local control channel.
//!
//! A trusted caller connects to a Unix socket and writes one line,
//! `<sourcePort>:<backendAddr>:<backendPort>:<password>\n`. The listener binds
//! the source port, replies `OK\n` and starts a session, or replies `FAILED\n`
//! and does nothing. One request per connection.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::errors::{ProxyError, ProxyResult};
use crate::session::{Session, SessionIds};

pub const REPLY_OK: &[u8] = b"OK\n";
pub const REPLY_FAILED: &[u8] = b"FAILED\n";
/// Longest control line accepted, newline excluded.
pub const MAX_LINE_LEN: usize = 1024;
/// How long a control client may take to send its line.
pub const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// One registration parsed from the control channel. Never stored; it is
/// consumed by the session it creates.
#[derive(Clone, PartialEq, Eq)]
pub struct ForwardingRequest {
    pub source_port: u16,
    /// Hostname or IP literal, without brackets.
    pub backend_addr: String,
    pub backend_port: u16,
    pub password: Vec<u8>,
}

impl fmt::Debug for ForwardingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardingRequest")
            .field("source_port", &self.source_port)
            .field("backend_addr", &self.backend_addr)
            .field("backend_port", &self.backend_port)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl ForwardingRequest {
    pub fn new(
        source_port: u16,
        backend_addr: impl Into<String>,
        backend_port: u16,
        password: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            source_port,
            backend_addr: backend_addr.into(),
            backend_port,
            password: password.into(),
        }
    }

    /// Parse a control line. Trailing `\n` or `\r\n` is ignored.
    pub fn parse(line: &str) -> ProxyResult<Self> {
        Self::parse_bytes(line.as_bytes())
    }

    /// Parse a raw control line. The port and address fields must be ASCII;
    /// the password is everything after the third `:`, taken as raw bytes.
    pub fn parse_bytes(line: &[u8]) -> ProxyResult<Self> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        let (source_port, rest) = split_field(line, "source port")?;
        let source_port = parse_port(source_port, "source port")?;

        let (backend_addr, rest) = if let Some(bracketed) = rest.strip_prefix(b"[") {
            let close = bracketed
                .iter()
                .position(|&b| b == b']')
                .ok_or_else(|| malformed("unterminated '[' in backend address"))?;
            let after = bracketed[close + 1..]
                .strip_prefix(b":")
                .ok_or_else(|| malformed("missing backend port"))?;
            (&bracketed[..close], after)
        } else {
            split_field(rest, "backend address")?
        };
        if backend_addr.is_empty() {
            return Err(malformed("empty backend address"));
        }
        let backend_addr = ascii_field(backend_addr, "backend address")?;

        let (backend_port, password) = split_field(rest, "backend port")?;
        let backend_port = parse_port(backend_port, "backend port")?;
        if password.is_empty() {
            return Err(malformed("empty password"));
        }

        Ok(Self::new(source_port, backend_addr, backend_port, password))
    }

    /// Render back into the wire form, newline included.
    pub fn to_line(&self) -> Vec<u8> {
        let addr = if self.backend_addr.contains(':') {
            format!("[{}]", self.backend_addr)
        } else {
            self.backend_addr.clone()
        };
        let mut line =
            format!("{}:{}:{}:", self.source_port, addr, self.backend_port).into_bytes();
        line.extend_from_slice(&self.password);
        line.push(b'\n');
        line
    }

    /// A password with a line break cannot be sent on the one-line channel.
    pub fn check_sendable(&self) -> ProxyResult<()> {
        if self.password.is_empty() {
            return Err(malformed("empty password"));
        }
        if self.password.iter().any(|&b| b == b'\n' || b == b'\r') {
            return Err(malformed("password contains a line break"));
        }
        Ok(())
    }
}

impl FromStr for ForwardingRequest {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn split_field<'a>(input: &'a [u8], label: &str) -> ProxyResult<(&'a [u8], &'a [u8])> {
    let colon = input
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| malformed(&format!("missing field after {label}")))?;
    Ok((&input[..colon], &input[colon + 1..]))
}

fn ascii_field<'a>(value: &'a [u8], label: &str) -> ProxyResult<&'a str> {
    if !value.is_ascii() {
        return Err(malformed(&format!("{label} is not ASCII")));
    }
    std::str::from_utf8(value).map_err(|_| malformed(&format!("{label} is not ASCII")))
}

fn parse_port(value: &[u8], label: &str) -> ProxyResult<u16> {
    let shown = String::from_utf8_lossy(value);
    if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
        return Err(malformed(&format!("invalid {label} '{shown}'")));
    }
    match shown.parse::<u16>() {
        Ok(0) => Err(malformed(&format!("{label} must be non-zero"))),
        Ok(port) => Ok(port),
        Err(_) => Err(malformed(&format!("invalid {label} '{shown}'"))),
    }
}

fn malformed(message: &str) -> ProxyError {
    ProxyError::MalformedControlRequest(message.to_string())
}

/// Accepts control connections and spawns one session per valid request.
pub struct ControlListener {
    listener: UnixListener,
    path: PathBuf,
    ids: SessionIds,
    config: SessionConfig,
}

impl ControlListener {
    /// Bind a fresh socket at `path`. Fails if anything already exists there.
    pub fn bind(path: impl AsRef<Path>, config: SessionConfig) -> ProxyResult<Self> {
        let path = path.as_ref();
        let std_listener = crate::supervisor::bind_control_socket(path)?;
        Self::from_std(std_listener, path, config)
    }

    /// Adopt a socket bound before the runtime existed (the daemon binds
    /// before forking). The socket file at `path` is removed on shutdown.
    pub fn from_std(
        listener: std::os::unix::net::UnixListener,
        path: impl Into<PathBuf>,
        config: SessionConfig,
    ) -> ProxyResult<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener: UnixListener::from_std(listener)?,
            path: path.into(),
            ids: SessionIds::new(),
            config,
        })
    }

    pub fn with_session_ids(mut self, ids: SessionIds) -> Self {
        self.ids = ids;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve until `shutdown` resolves, then remove the socket file. Sessions
    /// already running are not waited for.
    pub async fn serve<S>(self, shutdown: S) -> ProxyResult<()>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("control socket listening on {:?}", self.path);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let ids = self.ids.clone();
                            let config = self.config.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_control_connection(stream, ids, config).await {
                                    warn!("control connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            // Persistent errors such as EMFILE would otherwise spin.
                            error!("control socket accept error: {e}");
                            sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("shutting down control listener");
                    break;
                }
            }
        }

        drop(self.listener);
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove control socket {:?}: {e}", self.path);
            }
        }
        Ok(())
    }
}

/// Serve one control connection: read a line, answer, maybe start a session.
async fn handle_control_connection(
    stream: UnixStream,
    ids: SessionIds,
    config: SessionConfig,
) -> ProxyResult<()> {
    let (reader, mut writer) = stream.into_split();

    let request = match read_request_line(reader, REQUEST_READ_TIMEOUT).await {
        Ok(line) => ForwardingRequest::parse_bytes(&line),
        Err(e) => Err(e),
    };
    let request = match request {
        Ok(request) => request,
        Err(e) => {
            warn!("rejecting control request: {e}");
            writer.write_all(REPLY_FAILED).await?;
            return Ok(());
        }
    };

    let id = ids.next_id();
    debug!(session = %id, ?request, "control request accepted");
    let session = match Session::bind(id, request, config) {
        Ok(session) => session,
        Err(e) => {
            warn!(session = %id, "cannot start session: {e}");
            writer.write_all(REPLY_FAILED).await?;
            return Ok(());
        }
    };

    // The session must not depend on the caller reading the reply.
    let reply = writer.write_all(REPLY_OK).await;
    drop(writer);
    session.spawn();
    reply?;
    Ok(())
}

async fn read_request_line<R>(reader: R, limit: Duration) -> ProxyResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader).take(MAX_LINE_LEN as u64 + 1);
    let mut line = Vec::new();
    timeout(limit, reader.read_until(b'\n', &mut line))
        .await
        .map_err(|_| malformed(&format!("no request line within {limit:?}")))?
        .map_err(|e| malformed(&format!("unreadable request: {e}")))?;

    if line.is_empty() {
        return Err(malformed("empty request"));
    }
    if !line.ends_with(b"\n") {
        return Err(malformed(if line.len() > MAX_LINE_LEN {
            "request line too long"
        } else {
            "request not newline-terminated"
        }));
    }
    Ok(line)
}

/// Ask a running daemon to open a forwarding. Returns `true` on `OK`.
///
/// Requests that cannot be framed as one line are refused before connecting.
pub async fn request_forwarding(
    socket_path: impl AsRef<Path>,
    request: &ForwardingRequest,
) -> ProxyResult<bool> {
    request.check_sendable()?;
    let stream = UnixStream::connect(socket_path.as_ref()).await?;
    let (reader, mut writer) = stream.into_split();
    writer.write_all(&request.to_line()).await?;

    let mut reply = String::new();
    BufReader::new(reader)
        .take(64)
        .read_line(&mut reply)
        .await?;
    Ok(reply.as_bytes() == REPLY_OK)
}
