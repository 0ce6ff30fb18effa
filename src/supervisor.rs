//! Process plumbing for the daemon: control socket creation, PID file,
//! daemonizing and shutdown signals.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::stat::{umask, Mode};
use nix::unistd::Pid;

use crate::errors::ProxyResult;

/// Create the control socket with owner-only permissions.
///
/// Refuses to touch an existing path: a leftover socket usually means another
/// instance is running, and removing it would orphan that instance.
pub fn bind_control_socket(path: &Path) -> ProxyResult<StdUnixListener> {
    if path.symlink_metadata().is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("control socket path {} already exists", path.display()),
        )
        .into());
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let previous = umask(Mode::from_bits_truncate(0o077));
    let bound = StdUnixListener::bind(path);
    umask(previous);
    let listener = bound?;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

/// PID file owned by this process; removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Create the PID file, replacing it only if it names a dead process.
    pub fn acquire(path: impl Into<PathBuf>) -> ProxyResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        match Self::create(&path) {
            Ok(pid_file) => Ok(pid_file),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if let Some(pid) = read_pid(&path) {
                    if process_alive(pid) {
                        return Err(io::Error::new(
                            io::ErrorKind::AlreadyExists,
                            format!("already running with pid {pid} ({})", path.display()),
                        )
                        .into());
                    }
                }
                tracing::debug!("replacing stale pid file {}", path.display());
                fs::remove_file(&path)?;
                Ok(Self::create(&path)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn create(path: &Path) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Rewrite the file with the current PID (after forking).
    pub fn refresh(&self) -> ProxyResult<()> {
        fs::write(&self.path, format!("{}\n", std::process::id()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if read_pid(&self.path) == Some(std::process::id() as i32) {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Detach from the terminal: fork, new session, cwd `/`, stdio to /dev/null.
///
/// Must run before any runtime or logging thread is started.
pub fn daemonize() -> ProxyResult<()> {
    nix::unistd::daemon(false, false).map_err(io::Error::from)?;
    Ok(())
}

/// Resolves on SIGTERM or SIGINT.
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!("failed to listen for SIGTERM: {error}");
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {error}");
            }
            return;
        }
    };

    tokio::select! {
        _ = terminate.recv() => tracing::info!("SIGTERM received"),
        result = tokio::signal::ctrl_c() => {
            if let Err(error) = result {
                tracing::error!("failed to listen for SIGINT: {error}");
            }
            tracing::info!("SIGINT received");
        }
    }
}
