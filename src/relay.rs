//! Byte-exact relay between an authenticated viewer and its backend.
//!
//! Runs after both handshakes have completed. Bytes are copied verbatim in
//! both directions, one chunk at a time, until either side closes.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// 16KB chunks, sized for VNC framebuffer updates.
pub const RELAY_CHUNK_SIZE: usize = 16 * 1024;

/// Which peer ended the relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClosedBy {
    Viewer,
    Backend,
}

impl fmt::Display for ClosedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClosedBy::Viewer => f.write_str("viewer"),
            ClosedBy::Backend => f.write_str("backend"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayStats {
    pub closed_by: ClosedBy,
    pub viewer_to_backend: u64,
    pub backend_to_viewer: u64,
}

/// Relay bytes between `viewer` and `backend` until either side closes.
///
/// Each direction runs its own copy loop. Whichever loop finishes first (end
/// of stream or an I/O error) ends the relay: the other loop is cancelled and
/// both connections are dropped, which closes them.
///
/// # Arguments
/// * `viewer` - The authenticated viewer connection
/// * `backend` - The connection to the display server, past its handshake
pub async fn relay<V, B>(viewer: V, backend: B) -> RelayStats
where
    V: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut viewer_read, mut viewer_write) = tokio::io::split(viewer);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let mut viewer_to_backend = 0u64;
    let mut backend_to_viewer = 0u64;

    let closed_by = {
        let upstream = pump(&mut viewer_read, &mut backend_write, &mut viewer_to_backend);
        let downstream = pump(&mut backend_read, &mut viewer_write, &mut backend_to_viewer);

        tokio::select! {
            result = upstream => {
                if let Err(e) = result {
                    debug!("viewer -> backend copy failed: {}", e);
                }
                ClosedBy::Viewer
            }
            result = downstream => {
                if let Err(e) = result {
                    debug!("backend -> viewer copy failed: {}", e);
                }
                ClosedBy::Backend
            }
        }
    };

    let _ = backend_write.shutdown().await;
    let _ = viewer_write.shutdown().await;

    debug!(
        %closed_by,
        viewer_to_backend, backend_to_viewer, "relay ended"
    );

    RelayStats {
        closed_by,
        viewer_to_backend,
        backend_to_viewer,
    }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *copied += n as u64;
    }
}
