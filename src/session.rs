//! One forwarding attempt, end to end.
//!
//! A session owns its listening sockets from the moment the control request is
//! accepted. It waits for exactly one viewer, authenticates it, connects and
//! handshakes with the backend, then relays until either side hangs up:
//!
//! `Listening -> AuthViewer -> ConnectBackend -> AuthBackend -> Relaying -> Closed`
//!
//! with `Failed` reachable from every non-terminal state. Every socket is
//! owned by exactly one binding, so leaving a state by error closes whatever
//! was open at that point once and only once.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use nix::errno::Errno;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::control::ForwardingRequest;
use crate::errors::{HandshakeError, ProxyError, ProxyResult};
use crate::handshake::{
    self, AuthResult, AuthType, AUTH_RESULT_LEN, CHALLENGE_LEN, PROTOCOL_VERSION,
    REASON_HEADER_LEN, VERSION_LEN,
};
use crate::relay::relay;

const LISTEN_BACKLOG: i32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out session ids. Clones share the same counter.
#[derive(Clone, Debug)]
pub struct SessionIds {
    next: Arc<AtomicU64>,
}

impl SessionIds {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: Arc::new(AtomicU64::new(first)),
        }
    }

    pub fn next_id(&self) -> SessionId {
        SessionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SessionIds {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Listening,
    AuthViewer,
    ConnectBackend,
    AuthBackend,
    Relaying,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Listening => "LISTENING",
            SessionState::AuthViewer => "AUTH_VIEWER",
            SessionState::ConnectBackend => "CONNECT_BACKEND",
            SessionState::AuthBackend => "AUTH_BACKEND",
            SessionState::Relaying => "RELAYING",
            SessionState::Closed => "CLOSED",
            SessionState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Listening sockets for one source port, one per address family.
///
/// All of them are released together: after the first accept on any family,
/// or when the accept timeout fires.
#[derive(Debug)]
struct OneShotListeners {
    port: u16,
    listeners: Vec<TcpListener>,
}

impl OneShotListeners {
    fn bind(port: u16) -> ProxyResult<Self> {
        let candidates = [
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
        ];

        let mut listeners = Vec::with_capacity(candidates.len());
        let mut last_error = None;
        for addr in candidates {
            match bind_listener(addr) {
                Ok(listener) => listeners.push(listener),
                Err(e) if family_unavailable(&e) => {
                    debug!(%addr, error = %e, "address family unavailable; skipping");
                    last_error = Some(e);
                }
                Err(source) => return Err(ProxyError::Bind { port, source }),
            }
        }

        if listeners.is_empty() {
            let source = last_error.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Unsupported, "no address family")
            });
            return Err(ProxyError::Bind { port, source });
        }

        Ok(Self { port, listeners })
    }

    fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|listener| listener.local_addr().ok())
            .collect()
    }

    /// Wait for the first connection on any family, then drop every listener.
    async fn accept_one(&mut self, limit: Duration) -> ProxyResult<(TcpStream, SocketAddr)> {
        let outcome = {
            let accepts = self
                .listeners
                .iter()
                .map(|listener| Box::pin(listener.accept()));
            match timeout(limit, future::select_all(accepts)).await {
                Ok((result, _, _)) => Some(result),
                Err(_) => None,
            }
        };
        self.close();

        match outcome {
            Some(Ok(accepted)) => Ok(accepted),
            Some(Err(e)) => Err(ProxyError::Io(e)),
            None => Err(ProxyError::NoClientConnectionTimeout(limit)),
        }
    }

    fn close(&mut self) {
        if !self.listeners.is_empty() {
            debug!(port = self.port, count = self.listeners.len(), "closing listeners");
            self.listeners.clear();
        }
    }
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

fn family_unavailable(error: &std::io::Error) -> bool {
    error.kind() == std::io::ErrorKind::AddrNotAvailable
        || error.raw_os_error() == Some(Errno::EAFNOSUPPORT as i32)
}

pub struct Session {
    id: SessionId,
    state: SessionState,
    source_port: u16,
    backend_addr: String,
    backend_port: u16,
    password: Option<Vec<u8>>,
    config: SessionConfig,
    listeners: OneShotListeners,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("source_port", &self.source_port)
            .field("backend", &self.backend_target())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Bind the source port and create a session in `Listening`.
    pub fn bind(
        id: SessionId,
        request: ForwardingRequest,
        config: SessionConfig,
    ) -> ProxyResult<Self> {
        let listeners = OneShotListeners::bind(request.source_port)?;
        let session = Self {
            id,
            state: SessionState::Listening,
            source_port: request.source_port,
            backend_addr: request.backend_addr,
            backend_port: request.backend_port,
            password: Some(request.password),
            config,
            listeners,
        };
        info!(
            session = %session.id,
            addrs = ?session.local_addrs(),
            backend = %session.backend_target(),
            "listening for viewer"
        );
        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.local_addrs()
    }

    pub fn backend_target(&self) -> String {
        if self.backend_addr.contains(':') {
            format!("[{}]:{}", self.backend_addr, self.backend_port)
        } else {
            format!("{}:{}", self.backend_addr, self.backend_port)
        }
    }

    /// Run the session on its own task. Nothing waits on the handle in the
    /// daemon; tests use it to observe the outcome.
    pub fn spawn(self) -> JoinHandle<ProxyResult<()>> {
        tokio::spawn(self.run())
    }

    /// Drive the state machine to `Closed` (`Ok`) or `Failed` (`Err`).
    pub async fn run(mut self) -> ProxyResult<()> {
        let result = match self.establish().await {
            Ok((viewer, backend)) => {
                self.transition(SessionState::Relaying);
                let stats = relay(viewer, backend).await;
                info!(
                    session = %self.id,
                    closed_by = %stats.closed_by,
                    viewer_to_backend = stats.viewer_to_backend,
                    backend_to_viewer = stats.backend_to_viewer,
                    "relay finished"
                );
                Ok(())
            }
            Err(e) => Err(e),
        };
        self.listeners.close();
        self.password = None;

        match &result {
            Ok(()) => {
                self.transition(SessionState::Closed);
                info!(session = %self.id, "session closed");
            }
            Err(e) => {
                self.transition(SessionState::Failed);
                warn!(session = %self.id, kind = e.kind(), error = %e, "session failed");
            }
        }
        result
    }

    async fn establish(&mut self) -> ProxyResult<(TcpStream, TcpStream)> {
        let (mut viewer, peer) = self
            .listeners
            .accept_one(self.config.accept_timeout)
            .await?;
        let _ = viewer.set_nodelay(true);
        info!(session = %self.id, %peer, "viewer connected");

        self.transition(SessionState::AuthViewer);
        let password = self.password.take().ok_or_else(|| {
            ProxyError::AuthenticationFailure("password already consumed".to_string())
        })?;
        authenticate_viewer(&mut viewer, &password).await?;
        drop(password);
        info!(session = %self.id, %peer, "viewer authenticated");

        self.transition(SessionState::ConnectBackend);
        let mut backend = self.connect_backend().await?;

        self.transition(SessionState::AuthBackend);
        handshake_backend(&mut backend).await?;

        Ok((viewer, backend))
    }

    async fn connect_backend(&self) -> ProxyResult<TcpStream> {
        let attempts = self.config.connect_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match TcpStream::connect((self.backend_addr.as_str(), self.backend_port)).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    debug!(session = %self.id, attempt, "connected to backend");
                    return Ok(stream);
                }
                Err(e) if attempt < attempts => {
                    debug!(
                        session = %self.id,
                        attempt,
                        error = %e,
                        "backend connect failed; retrying in {:?}",
                        self.config.retry_delay
                    );
                    sleep(self.config.retry_delay).await;
                }
                Err(source) => {
                    return Err(ProxyError::BackendConnectFailure {
                        target: self.backend_target(),
                        attempts,
                        source,
                    });
                }
            }
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session = %self.id, from = %self.state, to = %next, "state transition");
        self.state = next;
    }
}

/// Server side of the RFB 3.8 setup, toward the viewer, with VNC
/// Authentication as the only offered security type.
pub(crate) async fn authenticate_viewer<S>(stream: &mut S, password: &[u8]) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(PROTOCOL_VERSION).await?;
    let mut version = [0u8; VERSION_LEN];
    stream.read_exact(&mut version).await?;
    if let Err(e) = handshake::negotiate_version(&version) {
        let _ = stream
            .write_all(&handshake::encode_refusal(&e.to_string()))
            .await;
        return Err(ProxyError::ProtocolVersionMismatch(e.to_string()));
    }

    stream
        .write_all(&handshake::request_auth_type(AuthType::VncAuth))
        .await?;
    let mut choice = [0u8; 1];
    stream.read_exact(&mut choice).await?;
    match handshake::parse_auth_type_choice(&choice) {
        Ok(AuthType::VncAuth) => {}
        Ok(other) => {
            reject_viewer(stream).await;
            return Err(ProxyError::AuthenticationFailure(format!(
                "viewer selected security type {}",
                other.as_u8()
            )));
        }
        Err(e) => {
            reject_viewer(stream).await;
            return Err(ProxyError::AuthenticationFailure(e.to_string()));
        }
    }

    let challenge = handshake::generate_challenge();
    stream.write_all(&challenge).await?;
    let mut response = [0u8; CHALLENGE_LEN];
    stream.read_exact(&mut response).await?;

    if !handshake::check_response(&challenge, &response, password) {
        reject_viewer(stream).await;
        return Err(ProxyError::AuthenticationFailure(
            "challenge response mismatch".to_string(),
        ));
    }

    stream
        .write_all(&handshake::encode_auth_result(AuthResult::Success))
        .await?;
    Ok(())
}

async fn reject_viewer<S>(stream: &mut S)
where
    S: AsyncWrite + Unpin,
{
    let _ = stream
        .write_all(&handshake::encode_auth_result(AuthResult::Failure))
        .await;
    let _ = stream.flush().await;
}

/// Client side of the RFB 3.8 setup, toward a backend that must offer the
/// None security type. Any failure, I/O included, is a backend handshake
/// failure.
pub(crate) async fn handshake_backend<S>(stream: &mut S) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_with_backend(stream).await.map_err(|e| match e {
        failure @ ProxyError::BackendHandshakeFailure(_) => failure,
        other => ProxyError::BackendHandshakeFailure(other.to_string()),
    })
}

async fn negotiate_with_backend<S>(stream: &mut S) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut version = [0u8; VERSION_LEN];
    stream.read_exact(&mut version).await?;
    handshake::negotiate_version(&version).map_err(backend_failure)?;
    stream.write_all(PROTOCOL_VERSION).await?;

    let offer = read_auth_offer(stream).await?;
    let types = handshake::parse_auth_type_offer(&offer).map_err(backend_failure)?;
    if !types.contains(&AuthType::None) {
        return Err(ProxyError::BackendHandshakeFailure(format!(
            "backend does not offer the None security type (offered {:?})",
            types
        )));
    }
    stream
        .write_all(&handshake::encode_auth_choice(AuthType::None))
        .await?;

    let mut result = [0u8; AUTH_RESULT_LEN];
    stream.read_exact(&mut result).await?;
    match handshake::decode_auth_result(&result).map_err(backend_failure)? {
        AuthResult::Success => Ok(()),
        AuthResult::Failure => {
            let reason = match read_reason_frame(stream).await {
                Ok(frame) => handshake::parse_reason(&frame).unwrap_or_default(),
                Err(_) => String::new(),
            };
            Err(ProxyError::BackendHandshakeFailure(format!(
                "backend rejected security type None: {reason}"
            )))
        }
    }
}

fn backend_failure(error: HandshakeError) -> ProxyError {
    ProxyError::BackendHandshakeFailure(error.to_string())
}

/// Read a complete security-type offer or refusal frame.
async fn read_auth_offer<S>(stream: &mut S) -> ProxyResult<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut frame = vec![0u8; 1];
    stream.read_exact(&mut frame).await?;
    if frame[0] == 0 {
        frame.extend(read_reason_frame(stream).await?);
    } else {
        let mut types = vec![0u8; usize::from(frame[0])];
        stream.read_exact(&mut types).await?;
        frame.extend_from_slice(&types);
    }
    Ok(frame)
}

async fn read_reason_frame<S>(stream: &mut S) -> ProxyResult<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut frame = vec![0u8; REASON_HEADER_LEN];
    stream.read_exact(&mut frame).await?;
    let len = handshake::reason_length(&frame).map_err(backend_failure)?;
    frame.resize(REASON_HEADER_LEN + len, 0);
    stream.read_exact(&mut frame[REASON_HEADER_LEN..]).await?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{encrypt_challenge, Challenge, AUTH_FAILURE_REASON};
    use tokio::io::{duplex, DuplexStream};

    async fn viewer_client(mut stream: DuplexStream, password: &'static [u8]) -> Vec<u8> {
        let mut version = [0u8; VERSION_LEN];
        stream.read_exact(&mut version).await.unwrap();
        assert_eq!(&version, PROTOCOL_VERSION);
        stream.write_all(PROTOCOL_VERSION).await.unwrap();

        let mut offer = [0u8; 2];
        stream.read_exact(&mut offer).await.unwrap();
        assert_eq!(offer, [1, 2]);
        stream.write_all(&[2]).await.unwrap();

        let mut challenge: Challenge = [0u8; CHALLENGE_LEN];
        stream.read_exact(&mut challenge).await.unwrap();
        stream
            .write_all(&encrypt_challenge(&challenge, password))
            .await
            .unwrap();

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        rest
    }

    #[tokio::test]
    async fn viewer_with_correct_password_is_accepted() {
        let (mut proxy, viewer) = duplex(256);
        let client = tokio::spawn(viewer_client(viewer, b"secret"));

        authenticate_viewer(&mut proxy, b"secret").await.unwrap();
        drop(proxy);

        assert_eq!(client.await.unwrap(), vec![0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn viewer_with_wrong_password_gets_failure_result() {
        let (mut proxy, viewer) = duplex(256);
        let client = tokio::spawn(viewer_client(viewer, b"guess"));

        let err = authenticate_viewer(&mut proxy, b"secret").await.unwrap_err();
        assert!(matches!(err, ProxyError::AuthenticationFailure(_)));
        drop(proxy);

        let reply = client.await.unwrap();
        assert_eq!(&reply[..4], &[0, 0, 0, 1]);
        assert_eq!(
            handshake::parse_reason(&reply[4..]).unwrap(),
            AUTH_FAILURE_REASON
        );
    }

    #[tokio::test]
    async fn viewer_with_old_version_is_refused() {
        let (mut proxy, mut viewer) = duplex(256);
        let client = tokio::spawn(async move {
            let mut version = [0u8; VERSION_LEN];
            viewer.read_exact(&mut version).await.unwrap();
            viewer.write_all(b"RFB 003.003\n").await.unwrap();
            let mut rest = Vec::new();
            viewer.read_to_end(&mut rest).await.unwrap();
            rest
        });

        let err = authenticate_viewer(&mut proxy, b"secret").await.unwrap_err();
        assert!(matches!(err, ProxyError::ProtocolVersionMismatch(_)));
        drop(proxy);

        let reply = client.await.unwrap();
        assert!(matches!(
            handshake::parse_auth_type_offer(&reply),
            Err(crate::errors::HandshakeError::Refused(_))
        ));
    }

    #[tokio::test]
    async fn viewer_choosing_none_is_rejected() {
        let (mut proxy, mut viewer) = duplex(256);
        let client = tokio::spawn(async move {
            let mut version = [0u8; VERSION_LEN];
            viewer.read_exact(&mut version).await.unwrap();
            viewer.write_all(PROTOCOL_VERSION).await.unwrap();
            let mut offer = [0u8; 2];
            viewer.read_exact(&mut offer).await.unwrap();
            viewer.write_all(&[1]).await.unwrap();
            let mut rest = Vec::new();
            viewer.read_to_end(&mut rest).await.unwrap();
            rest
        });

        let err = authenticate_viewer(&mut proxy, b"secret").await.unwrap_err();
        assert!(matches!(err, ProxyError::AuthenticationFailure(_)));
        drop(proxy);
        assert_eq!(&client.await.unwrap()[..4], &[0, 0, 0, 1]);
    }

    async fn backend_server(mut stream: DuplexStream, offer: Vec<u8>, result: Vec<u8>) -> Vec<u8> {
        stream.write_all(PROTOCOL_VERSION).await.unwrap();
        let mut version = [0u8; VERSION_LEN];
        stream.read_exact(&mut version).await.unwrap();
        stream.write_all(&offer).await.unwrap();
        let mut received = Vec::new();
        if offer[0] != 0 {
            let mut choice = [0u8; 1];
            if stream.read_exact(&mut choice).await.is_ok() {
                received.push(choice[0]);
                let _ = stream.write_all(&result).await;
            }
        }
        received
    }

    #[tokio::test]
    async fn backend_offering_none_completes() {
        let (mut proxy, backend) = duplex(256);
        let server = tokio::spawn(backend_server(backend, vec![2, 2, 1], vec![0, 0, 0, 0]));

        handshake_backend(&mut proxy).await.unwrap();
        assert_eq!(server.await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn backend_requiring_password_is_rejected() {
        let (mut proxy, backend) = duplex(256);
        let _server = tokio::spawn(backend_server(backend, vec![1, 2], vec![]));

        let err = handshake_backend(&mut proxy).await.unwrap_err();
        match err {
            ProxyError::BackendHandshakeFailure(message) => {
                assert!(message.contains("None"), "{message}")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn backend_refusal_reason_is_reported() {
        let (mut proxy, backend) = duplex(256);
        let _server = tokio::spawn(backend_server(
            backend,
            handshake::encode_refusal("server busy"),
            vec![],
        ));

        let err = handshake_backend(&mut proxy).await.unwrap_err();
        match err {
            ProxyError::BackendHandshakeFailure(message) => {
                assert!(message.contains("server busy"), "{message}")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn backend_failed_security_result_is_reported() {
        let (mut proxy, backend) = duplex(256);
        let mut result = vec![0, 0, 0, 1];
        result.extend_from_slice(&[0, 0, 0, 4]);
        result.extend_from_slice(b"nope");
        let _server = tokio::spawn(backend_server(backend, vec![1, 1], result));

        let err = handshake_backend(&mut proxy).await.unwrap_err();
        assert!(err.to_string().contains("nope"), "{err}");
    }

    #[tokio::test]
    async fn backend_hangup_is_a_handshake_failure() {
        let (mut proxy, backend) = duplex(256);
        drop(backend);
        let err = handshake_backend(&mut proxy).await.unwrap_err();
        assert!(matches!(err, ProxyError::BackendHandshakeFailure(_)));
    }

    #[test]
    fn ids_are_unique_and_shared_between_clones() {
        let ids = SessionIds::new();
        let clone = ids.clone();
        let a = ids.next_id();
        let b = clone.next_id();
        let c = ids.next_id();
        assert_eq!((a.get(), b.get(), c.get()), (1, 2, 3));
    }

    #[test]
    fn terminal_states() {
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Relaying.is_terminal());
        assert_eq!(SessionState::AuthViewer.to_string(), "AUTH_VIEWER");
    }

    #[tokio::test]
    async fn listeners_close_after_timeout() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut listeners = OneShotListeners::bind(port).unwrap();
        assert!(!listeners.local_addrs().is_empty());

        let err = listeners
            .accept_one(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NoClientConnectionTimeout(_)));
        assert!(listeners.local_addrs().is_empty());

        let refused = TcpStream::connect(("127.0.0.1", port)).await;
        assert!(refused.is_err());
    }

    #[tokio::test]
    async fn port_in_use_is_a_bind_error() {
        let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = OneShotListeners::bind(port).unwrap_err();
        assert!(matches!(err, ProxyError::Bind { .. }));
    }
}
