use std::path::Path;
use std::time::{Duration, Instant};

use rvpu_peer::{connect_with_config, Channel, ConnectConfig, PeerError};
use rvpu_session::{RemoteSession, SessionConfig};
use rvpu_transport::TransportError;
use serde::Serialize;

use crate::cmd::{parse_duration, ProbeArgs};
use crate::exit::{peer_error, session_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::{print_report, OutputFormat};

#[derive(Serialize)]
struct PeerCreds {
    uid: u32,
    gid: u32,
    pid: u32,
}

#[derive(Serialize)]
struct ProbeOutput {
    endpoint: String,
    channel: String,
    tag: u8,
    backend: String,
    completion: &'static str,
    connect_latency_ms: f64,
    peer_credentials: Option<PeerCreds>,
    connected: bool,
}

pub fn run(args: ProbeArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let config = ConnectConfig {
        handshake_timeout: timeout,
        ..ConnectConfig::for_endpoint(&args.endpoint)
    };

    let session_config = SessionConfig {
        backend: args.backend,
        ..SessionConfig::default()
    };

    let started = Instant::now();
    let channel = connect_with_timeout(&config, timeout)?;
    let latency = started.elapsed();

    let peer_credentials = channel
        .peer_credentials()
        .map(|(uid, gid, pid)| PeerCreds { uid, gid, pid });
    let out = ProbeOutput {
        endpoint: args.endpoint.display().to_string(),
        channel: channel.id().to_string(),
        tag: channel.tag(),
        backend: args.backend.to_string(),
        completion: session_config.completion.name(),
        connect_latency_ms: (latency.as_secs_f64() * 1000.0 * 100.0).round() / 100.0,
        peer_credentials,
        connected: true,
    };

    let mut session = RemoteSession::new(session_config);
    session
        .attach(channel)
        .map_err(|err| session_error("init failed", err))?;
    session
        .deinit()
        .map_err(|err| session_error("deinit failed", err))?;

    print_probe(&out, format);
    Ok(SUCCESS)
}

fn connect_with_timeout(config: &ConnectConfig, timeout: Duration) -> CliResult<Channel> {
    let start = Instant::now();
    loop {
        match connect_with_config(config) {
            Ok(channel) => return Ok(channel),
            Err(err) => {
                if !is_retryable_connect_error(&err) {
                    return Err(peer_error("connect failed", err));
                }
                if start.elapsed() >= timeout {
                    return Err(CliError::new(
                        TIMEOUT,
                        format!(
                            "connect to {} timed out after {timeout:?}",
                            display(&config.endpoint)
                        ),
                    ));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

fn is_retryable_connect_error(err: &PeerError) -> bool {
    match err {
        PeerError::Transport(TransportError::Connect { source, .. }) => {
            source.kind() == std::io::ErrorKind::NotFound
                || source.kind() == std::io::ErrorKind::ConnectionRefused
        }
        _ => false,
    }
}

fn print_probe(out: &ProbeOutput, format: OutputFormat) {
    let creds = match &out.peer_credentials {
        Some(c) => format!("uid={} gid={} pid={}", c.uid, c.gid, c.pid),
        None => "unavailable".to_string(),
    };
    let rows = [
        ("endpoint", out.endpoint.clone()),
        ("channel", out.channel.clone()),
        ("tag", format!("{:#04x}", out.tag)),
        ("backend", out.backend.clone()),
        ("completion", out.completion.to_string()),
        ("connect latency", format!("{:.2}ms", out.connect_latency_ms)),
        ("peer credentials", creds),
    ];
    print_report("Probe", out, &rows, format);
}
