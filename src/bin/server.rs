use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vnc_authproxy::supervisor::{self, PidFile};
use vnc_authproxy::{
    ControlListener, SessionConfig, DEFAULT_ACCEPT_TIMEOUT_SECS, DEFAULT_CONNECT_RETRIES,
    DEFAULT_CONTROL_SOCKET, DEFAULT_LOG_DIR, DEFAULT_PID_FILE, DEFAULT_RETRY_DELAY_MS,
};

#[derive(Parser, Debug)]
#[command(name = "vnc-authproxyd", author, version)]
struct Options {
    /// Path of the Unix control socket used to register forwardings
    #[arg(long, default_value = DEFAULT_CONTROL_SOCKET, env = "VNC_AUTHPROXY_SOCKET")]
    socket: PathBuf,
    /// Path of the PID file
    #[arg(long, default_value = DEFAULT_PID_FILE, env = "VNC_AUTHPROXY_PID_FILE")]
    pid_file: PathBuf,
    /// Directory for the daily log file (not used with --foreground)
    #[arg(long, default_value = DEFAULT_LOG_DIR, env = "VNC_AUTHPROXY_LOG_DIR")]
    log_dir: PathBuf,
    /// Seconds a registered forwarding waits for its viewer
    #[arg(long, default_value_t = DEFAULT_ACCEPT_TIMEOUT_SECS, env = "VNC_AUTHPROXY_ACCEPT_TIMEOUT")]
    accept_timeout_secs: u64,
    /// Extra backend connect attempts after the first one fails
    #[arg(long, default_value_t = DEFAULT_CONNECT_RETRIES, env = "VNC_AUTHPROXY_CONNECT_RETRIES")]
    connect_retries: u32,
    /// Milliseconds between backend connect attempts
    #[arg(long, default_value_t = DEFAULT_RETRY_DELAY_MS, env = "VNC_AUTHPROXY_RETRY_DELAY_MS")]
    retry_delay_ms: u64,
    /// Stay attached to the terminal instead of daemonizing
    #[arg(short, long)]
    foreground: bool,
}

impl Options {
    fn session_config(&self) -> SessionConfig {
        SessionConfig::new(
            Duration::from_secs(self.accept_timeout_secs),
            self.connect_retries,
            Duration::from_millis(self.retry_delay_ms),
        )
    }

    /// Detached daemons log to a file; stdout is /dev/null after the fork.
    /// In the foreground logs go to stdout only.
    fn log_file_dir(&self) -> Option<&Path> {
        if self.foreground {
            None
        } else {
            Some(self.log_dir.as_path())
        }
    }
}

fn main() -> anyhow::Result<()> {
    let options = Options::parse();

    // Daemonizing changes the working directory to `/`.
    let socket_path =
        std::path::absolute(&options.socket).context("resolving control socket path")?;
    let pid_path = std::path::absolute(&options.pid_file).context("resolving pid file path")?;
    let log_dir = options
        .log_file_dir()
        .map(std::path::absolute)
        .transpose()
        .context("resolving log directory")?;
    // Created up front: once detached there is no stderr to report to.
    if let Some(dir) = &log_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating log directory {}", dir.display()))?;
    }

    let control = supervisor::bind_control_socket(&socket_path)
        .with_context(|| format!("binding control socket {}", socket_path.display()))?;
    let pid_file = match PidFile::acquire(&pid_path) {
        Ok(pid_file) => pid_file,
        Err(error) => {
            drop(control);
            let _ = std::fs::remove_file(&socket_path);
            return Err(error).context("creating pid file");
        }
    };

    if !options.foreground {
        supervisor::daemonize().context("daemonizing")?;
        pid_file.refresh().context("rewriting pid file")?;
    }

    let _guard = init_tracing(log_dir.as_deref());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;

    let result = runtime.block_on(async {
        let listener = ControlListener::from_std(control, &socket_path, options.session_config())?;
        listener.serve(supervisor::shutdown_signal()).await
    });

    // In-flight sessions are dropped with the runtime, not drained.
    drop(runtime);
    drop(pid_file);

    if let Err(error) = result {
        tracing::error!("control listener failed: {error}");
        let _ = std::fs::remove_file(&socket_path);
        return Err(error.into());
    }

    tracing::info!("vnc-authproxyd stopped");
    Ok(())
}

fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return None;
    };

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "Failed to create log directory {:?}: {}. Logging to file disabled.",
            log_dir, e
        );
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "vnc-authproxyd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Some(guard)
}
