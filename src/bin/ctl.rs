use std::path::PathBuf;

use anyhow::{anyhow, Context};
use clap::Parser;
use rand::distr::Alphanumeric;
use rand::Rng;
use vnc_authproxy::{request_forwarding, ForwardingRequest, DEFAULT_CONTROL_SOCKET};

const GENERATED_PASSWORD_LEN: usize = 8;

#[derive(Parser, Debug)]
#[command(
    name = "vnc-authproxy-ctl",
    about = "Register a one-shot forwarding with a running vnc-authproxyd"
)]
struct Cli {
    /// Path to the daemon's control socket
    #[arg(long, env = "VNC_AUTHPROXY_SOCKET", default_value = DEFAULT_CONTROL_SOCKET)]
    socket: PathBuf,

    /// Port the viewer will connect to
    source_port: u16,

    /// Display server as host:port or [ipv6]:port
    backend: String,

    /// Password the viewer must present; generated and printed when omitted
    #[arg(long, env = "VNC_AUTHPROXY_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    if let Err(error) = run(cli).await {
        eprintln!("vnc-authproxy-ctl error: {error:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let (backend_addr, backend_port) = parse_backend(&cli.backend)?;

    let generated = cli.password.is_none();
    let password = cli.password.unwrap_or_else(generate_password);
    let request = ForwardingRequest::new(
        cli.source_port,
        backend_addr,
        backend_port,
        password.as_bytes(),
    );
    request.check_sendable().context("invalid --password")?;
    let accepted = request_forwarding(&cli.socket, &request)
        .await
        .with_context(|| format!("talking to {}", cli.socket.display()))?;
    if !accepted {
        return Err(anyhow!("daemon refused the forwarding"));
    }

    if generated {
        println!("{password}");
    }
    Ok(())
}

fn parse_backend(value: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("backend '{value}' is not host:port"))?;
    let host = match host.strip_prefix('[') {
        Some(inner) => inner
            .strip_suffix(']')
            .ok_or_else(|| anyhow!("unterminated '[' in backend '{value}'"))?,
        None if host.contains(':') => {
            return Err(anyhow!("IPv6 backend '{value}' must be written as [addr]:port"))
        }
        None => host,
    };
    if host.is_empty() {
        return Err(anyhow!("backend '{value}' has no host"));
    }
    let port = port
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| anyhow!("invalid backend port in '{value}'"))?;
    Ok((host.to_string(), port))
}

fn generate_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_forms() {
        assert_eq!(
            parse_backend("127.0.0.1:5901").unwrap(),
            ("127.0.0.1".to_string(), 5901)
        );
        assert_eq!(
            parse_backend("vnc.internal:5900").unwrap(),
            ("vnc.internal".to_string(), 5900)
        );
        assert_eq!(parse_backend("[::1]:5901").unwrap(), ("::1".to_string(), 5901));
    }

    #[test]
    fn rejects_bad_backends() {
        for value in ["5901", ":5901", "host:0", "host:x", "::1:5901", "[::1:5901"] {
            assert!(parse_backend(value).is_err(), "{value} accepted");
        }
    }

    #[test]
    fn generated_passwords_are_alphanumeric() {
        let password = generate_password();
        assert_eq!(password.len(), GENERATED_PASSWORD_LEN);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
