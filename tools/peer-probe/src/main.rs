use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use config::{Config, Environment, File as ConfigFile};
use peerwire_network::{
    ConnectionCallback, ConnectionConfig, ConnectionMetricsSnapshot, Message, MessageKind,
    PeerConnection, PeerContext,
};
use serde::Serialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Dial or serve a single peer connection", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML file with connection settings; `PEERWIRE_*` variables override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Peer port, overriding the configured one
    #[arg(long)]
    port: Option<u16>,

    /// Treat this address as blacklisted (repeatable)
    #[arg(long = "block")]
    blocked: Vec<IpAddr>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a peer and measure ping round trips
    Ping {
        #[arg(long)]
        peer: IpAddr,
        #[arg(long, default_value_t = 5)]
        count: u32,
        #[arg(long, default_value_t = 1000)]
        pause_ms: u64,
    },
    /// Accept inbound peers and answer their pings until ctrl-c
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,
    },
}

#[derive(Serialize)]
struct PingReport {
    peer: IpAddr,
    sent: u32,
    replies: u32,
    lost: u32,
    stats: ConnectionMetricsSnapshot,
}

#[derive(Serialize)]
struct PeerReport {
    peer: IpAddr,
    stats: ConnectionMetricsSnapshot,
}

/// Controller that keeps a probed connection alive: answers pings and
/// closes the connection once the peer is gone.
struct ProbeController;

impl ConnectionCallback for ProbeController {
    fn on_connect(&self, peer: &Arc<PeerConnection>) {
        info!("Peer {} connected", peer.address());
    }

    fn on_message(&self, peer: &Arc<PeerConnection>, message: Message) {
        if message.kind() == MessageKind::PING && message.has_id() {
            let reply = Message::response_to(&message, MessageKind::PING, Vec::new());
            let peer = Arc::clone(peer);
            tokio::spawn(async move {
                peer.send_message(&reply).await;
            });
        } else {
            debug!(
                "Ignoring message of kind {} ({} bytes) from {}",
                message.kind().0,
                message.payload().len(),
                peer.address()
            );
        }
    }

    fn on_disconnect(&self, peer: &Arc<PeerConnection>) {
        info!("Peer {} disconnected", peer.address());
        let peer = Arc::clone(peer);
        tokio::spawn(async move { peer.close().await });
    }

    fn on_error(&self, peer: &Arc<PeerConnection>, reason: &str) {
        warn!("Peer {}: {}", peer.address(), reason);
    }
}

/// Layer the optional config file under `PEERWIRE_*` environment variables.
fn load_config(path: Option<&Path>) -> Result<ConnectionConfig> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        if !path.exists() {
            bail!(
                "Configuration file {} not found (specified via --config)",
                path.display()
            );
        }
        builder = builder.add_source(ConfigFile::from(path));
    }
    builder = builder.add_source(Environment::with_prefix("PEERWIRE").try_parsing(true));

    let config: ConnectionConfig = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn context(blocked: &HashSet<IpAddr>) -> PeerContext {
    PeerContext::new(Arc::new(ProbeController)).with_reputation(Arc::new(blocked.clone()))
}

/// Add `peer` to the served set, forgetting connections that have closed.
fn track(peers: &mut Vec<Arc<PeerConnection>>, peer: Arc<PeerConnection>) {
    peers.retain(|p| p.is_connected());
    peers.push(peer);
}

async fn run_ping(
    config: ConnectionConfig,
    blocked: HashSet<IpAddr>,
    address: IpAddr,
    count: u32,
    pause: Duration,
) -> Result<()> {
    let peer = PeerConnection::outbound(address, config, context(&blocked));
    if peer.is_bad() {
        bail!("Peer {} is blacklisted", address);
    }

    peer.connect().await;
    if !peer.is_connected() {
        bail!("Could not connect to {}:{}", address, peer.config().port);
    }

    let mut replies = 0;
    for seq in 1..=count {
        let started = Instant::now();
        match peer.send_request(Message::ping()).await {
            Some(reply) if reply.kind() == MessageKind::PING => {
                replies += 1;
                info!("Ping {} to {}: {:?}", seq, address, started.elapsed());
            }
            Some(reply) => {
                warn!("Ping {} to {}: unexpected reply kind {}", seq, address, reply.kind().0);
            }
            None => warn!("Ping {} to {}: no reply", seq, address),
        }
        if !peer.is_connected() {
            warn!("Connection to {} lost", address);
            break;
        }
        if seq < count {
            tokio::time::sleep(pause).await;
        }
    }

    peer.close().await;
    let report = PingReport {
        peer: address,
        sent: count,
        replies,
        lost: count - replies,
        stats: peer.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_serve(config: ConnectionConfig, blocked: HashSet<IpAddr>, bind: IpAddr) -> Result<()> {
    let listener = TcpListener::bind((bind, config.port)).await?;
    info!("Listening on {}", listener.local_addr()?);

    let mut peers: Vec<Arc<PeerConnection>> = Vec::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                if blocked.contains(&remote.ip()) {
                    info!("Refusing blacklisted peer {}", remote);
                    continue;
                }
                let ctx = context(&blocked);
                if let Some(peer) = PeerConnection::accept_tcp(stream, config.clone(), ctx).await {
                    track(&mut peers, peer);
                }
            }
        }
    }

    info!("Shutting down, closing {} connection(s)", peers.len());
    let mut reports = Vec::with_capacity(peers.len());
    for peer in peers {
        peer.close().await;
        reports.push(PeerReport {
            peer: peer.address(),
            stats: peer.stats(),
        });
    }
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    let blocked: HashSet<IpAddr> = cli.blocked.into_iter().collect();

    match cli.command {
        Commands::Ping {
            peer,
            count,
            pause_ms,
        } => run_ping(config, blocked, peer, count, Duration::from_millis(pause_ms)).await,
        Commands::Serve { bind } => run_serve(config, blocked, bind).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "port = 19084").unwrap();
        writeln!(file, "request_timeout_ms = 1500").unwrap();
        writeln!(file, "ping_failure_threshold = 5").unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.port, 19084);
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.ping_failure_threshold, 5);
        assert_eq!(config.ping_interval, ConnectionConfig::default().ping_interval);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(load_config(Some(&missing)).is_err());
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "ping_interval_ms = 0").unwrap();
        assert!(load_config(Some(file.path())).is_err());
    }

    #[tokio::test]
    async fn test_track_forgets_closed_peers() {
        let blocked = HashSet::new();
        let mut peers = Vec::new();

        let (first, _first_remote) = tokio::io::duplex(1024);
        let first = PeerConnection::accept(
            "127.0.0.1".parse().unwrap(),
            first,
            ConnectionConfig::default(),
            context(&blocked),
        )
        .await;
        track(&mut peers, first.clone());
        first.close().await;

        let (second, _second_remote) = tokio::io::duplex(1024);
        let second = PeerConnection::accept(
            "127.0.0.2".parse().unwrap(),
            second,
            ConnectionConfig::default(),
            context(&blocked),
        )
        .await;
        track(&mut peers, second.clone());

        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].address(), second.address());
        second.close().await;
    }

    #[test]
    fn test_cli_parses_ping_command() {
        let cli = Cli::try_parse_from([
            "peer-probe",
            "--port",
            "9100",
            "--block",
            "10.0.0.1",
            "ping",
            "--peer",
            "127.0.0.1",
            "--count",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.port, Some(9100));
        assert_eq!(cli.blocked, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
        match cli.command {
            Commands::Ping { count, pause_ms, .. } => {
                assert_eq!(count, 2);
                assert_eq!(pause_ms, 1000);
            }
            Commands::Serve { .. } => panic!("expected ping"),
        }
    }
}
