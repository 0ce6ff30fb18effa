#![allow(dead_code)]

use std::net::{Ipv4Addr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use vnc_authproxy::handshake::{self, Challenge, PROTOCOL_VERSION};
use vnc_authproxy::SessionConfig;

/// A port that was free a moment ago on the IPv4 wildcard.
pub fn free_port() -> u16 {
    StdTcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn test_config(accept_timeout: Duration) -> SessionConfig {
    SessionConfig::new(accept_timeout, 1, Duration::from_millis(20))
}

/// Display server on 127.0.0.1. By default it offers no authentication and
/// echoes everything back.
pub struct FakeBackend {
    pub port: u16,
    connections: Arc<AtomicUsize>,
}

impl FakeBackend {
    pub async fn start() -> Self {
        Self::spawn(false).await
    }

    /// A backend that only offers VNC Authentication, which the proxy
    /// cannot satisfy.
    pub async fn start_requiring_password() -> Self {
        Self::spawn(true).await
    }

    async fn spawn(require_password: bool) -> Self {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));

        let counter = connections.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                if require_password {
                    tokio::spawn(serve_password_only(stream));
                } else {
                    tokio::spawn(serve_no_auth_echo(stream));
                }
            }
        });

        Self { port, connections }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve_password_only(mut stream: TcpStream) {
    let mut version = [0u8; 12];
    if stream.write_all(PROTOCOL_VERSION).await.is_err()
        || stream.read_exact(&mut version).await.is_err()
        || stream.write_all(&[1, 2]).await.is_err()
    {
        return;
    }
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest).await;
}

async fn serve_no_auth_echo(mut stream: TcpStream) {
    let mut version = [0u8; 12];
    if stream.write_all(PROTOCOL_VERSION).await.is_err()
        || stream.read_exact(&mut version).await.is_err()
        || stream.write_all(&[1, 1]).await.is_err()
    {
        return;
    }
    let mut choice = [0u8; 1];
    if stream.read_exact(&mut choice).await.is_err() || choice[0] != 1 {
        return;
    }
    if stream.write_all(&[0, 0, 0, 0]).await.is_err() {
        return;
    }

    let (mut reader, mut writer) = stream.split();
    let _ = tokio::io::copy(&mut reader, &mut writer).await;
}

/// Run the viewer half of the 3.8 VNC Authentication handshake and return
/// the SecurityResult word.
pub async fn viewer_handshake(stream: &mut TcpStream, password: &[u8]) -> u32 {
    let mut version = [0u8; 12];
    stream.read_exact(&mut version).await.unwrap();
    assert_eq!(&version, PROTOCOL_VERSION);
    stream.write_all(PROTOCOL_VERSION).await.unwrap();

    let mut offer = [0u8; 2];
    stream.read_exact(&mut offer).await.unwrap();
    assert_eq!(offer, [1, 2]);
    stream.write_all(&[2]).await.unwrap();

    let mut challenge: Challenge = [0u8; 16];
    stream.read_exact(&mut challenge).await.unwrap();
    let response = handshake::encrypt_challenge(&challenge, password);
    stream.write_all(&response).await.unwrap();

    let mut result = [0u8; 4];
    stream.read_exact(&mut result).await.unwrap();
    u32::from_be_bytes(result)
}

/// Present an older protocol version and return what the proxy sent back
/// before closing.
pub async fn viewer_with_old_version(stream: &mut TcpStream) -> Vec<u8> {
    let mut version = [0u8; 12];
    stream.read_exact(&mut version).await.unwrap();
    stream.write_all(b"RFB 003.003\n").await.unwrap();
    read_until_closed(stream).await
}

pub async fn connect_viewer(port: u16) -> TcpStream {
    TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap()
}

/// Read until the peer closes; panics if that takes longer than five seconds.
pub async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .expect("peer did not close")
        .unwrap();
    rest
}
