//! relay-daemon: runs a relay node on the local network.
//!
//! `run` starts a listening endpoint, multicast discovery and periodic
//! pruning. `demo` runs a self-contained hub with a few clients on loopback.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use relay_core::{
    Discovery, LogLevel, Logger, PeerEndpoint, PeerRegistry, RelayConfig, RelayError,
};

#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(about = "Local-network peer relay daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a relay node until stopped
    Run(RunArgs),
    /// Start a hub and a few clients on loopback, then broadcast and relay
    Demo(DemoArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON config file (defaults are used if it does not exist)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Peer ID (generated if not provided)
    #[arg(long)]
    id: Option<String>,

    /// Address the relay endpoint listens on
    #[arg(short, long)]
    listen: Option<String>,

    /// Port the relay endpoint listens on
    #[arg(short, long)]
    port: Option<u16>,

    /// Multicast group used for discovery
    #[arg(long)]
    group: Option<String>,

    /// Port used for discovery traffic
    #[arg(long)]
    discovery_port: Option<u16>,

    /// Append relay logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Stop after this many seconds instead of running forever
    #[arg(long)]
    duration_secs: Option<u64>,
}

#[derive(Args, Debug)]
struct DemoArgs {
    /// Loopback port for the demo hub
    #[arg(short, long, default_value_t = 8082)]
    port: u16,

    /// Number of clients to connect
    #[arg(long, default_value_t = 3)]
    clients: usize,
}

/// A running relay node.
struct Node {
    id: String,
    relay_port: u16,
    hub: Arc<PeerEndpoint>,
    registry: Arc<PeerRegistry>,
    log: Logger,
}

impl Node {
    /// Connect to a newly discovered node's relay port and register it.
    fn on_peer_discovered(&self, address: &str) {
        let ip = match address.rsplit_once(':').map(|(ip, _)| ip.trim_matches(['[', ']'])) {
            Some(ip) => ip,
            None => {
                warn!("Ignoring malformed discovered address: {}", address);
                return;
            }
        };
        if ip.parse::<IpAddr>().is_err() {
            warn!("Ignoring malformed discovered address: {}", address);
            return;
        }

        let peer_id = format!("{}:{}", ip, self.relay_port);
        if self.registry.has_peer(&peer_id) {
            debug!("Already connected to {}", peer_id);
            return;
        }

        match PeerEndpoint::connect(peer_id.clone(), ip, self.relay_port, &self.log) {
            Ok(peer) => {
                let added = self.registry.add_discovered_peers(vec![Arc::new(peer)]);
                if added > 0 {
                    info!("Connected to discovered node {}", peer_id);
                }
            }
            Err(e) => warn!("Could not connect to discovered node {}: {}", peer_id, e),
        }
    }

    /// Prune idle peers and log what is left.
    fn sweep(&self, timeout: Duration) {
        // The node's own endpoint is never pruned.
        self.hub.touch();

        let before = self.registry.list_peers();
        let removed = self.registry.remove_inactive_peers(timeout);
        for peer in before.iter().filter(|p| removed.iter().any(|id| id == p.id())) {
            peer.close_connection();
        }
        if !removed.is_empty() {
            info!("Pruned {} inactive peer(s): {}", removed.len(), removed.join(", "));
        }

        for peer in self.registry.list_peers() {
            let stats = serde_json::to_string(&peer.stats()).unwrap_or_default();
            debug!(
                "Peer {} ({}:{}) connected={} stats={}",
                peer.id(),
                peer.address(),
                peer.port(),
                peer.is_connected(),
                stats
            );
        }
        info!(
            "Registry holds {} peer(s); hub {} has {} client(s)",
            self.registry.len(),
            self.id,
            self.hub.client_count()
        );
    }
}

fn spawn_acceptor(hub: Arc<PeerEndpoint>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("relay-acceptor".to_string())
        .spawn(move || {
            while hub.is_connected() {
                match hub.accept_clients(1) {
                    Ok(0) => break,
                    Ok(_) => info!("Hub now has {} client(s)", hub.client_count()),
                    Err(e) => {
                        error!("Accept loop stopped: {}", e);
                        break;
                    }
                }
            }
        })
        .context("Failed to spawn accept thread")
}

fn spawn_receiver(hub: Arc<PeerEndpoint>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("relay-receiver".to_string())
        .spawn(move || {
            while hub.is_connected() {
                if hub.client_count() == 0 {
                    thread::sleep(Duration::from_millis(200));
                    continue;
                }
                match hub.receive_message() {
                    Ok(Some(message)) => info!("Hub received: {}", message),
                    Ok(None) => {}
                    Err(RelayError::Closed) => break,
                    Err(e) => warn!("Receive failed: {}", e),
                }
            }
        })
        .context("Failed to spawn receive thread")
}

fn run(args: RunArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.node.listen_address = listen;
    }
    if let Some(port) = args.port {
        config.node.port = port;
    }
    if let Some(group) = args.group {
        config.discovery.group = group;
    }
    if let Some(port) = args.discovery_port {
        config.discovery.port = port;
    }
    if args.log_file.is_some() {
        config.logging.file = args.log_file;
    }

    let log = match &config.logging.file {
        Some(_) => Logger::new(&config.logging).context("Failed to set up relay logging")?,
        None => Logger::with_level(config.logging.level),
    };

    // Generate peer ID if not provided
    let id = args.id.or(config.node.id.clone()).unwrap_or_else(|| {
        let id = uuid::Uuid::new_v4().to_string();
        info!("Generated peer ID: {}", id);
        id
    });

    info!("Starting relay node {}", id);
    info!(
        "Listen address: {}:{}",
        config.node.listen_address, config.node.port
    );

    let hub = Arc::new(
        PeerEndpoint::listen(
            id.clone(),
            &config.node.listen_address,
            config.node.port,
            config.node.backlog,
            &log,
        )
        .context("Failed to start relay endpoint")?,
    );
    let registry = Arc::new(PeerRegistry::new(&log));
    registry.add_peer(hub.clone())?;

    let node = Node {
        id,
        relay_port: config.node.port,
        hub: hub.clone(),
        registry,
        log: log.clone(),
    };

    let acceptor = spawn_acceptor(hub.clone())?;
    let receiver = spawn_receiver(hub.clone())?;

    let (discovered_tx, discovered_rx) = mpsc::channel::<String>();
    let discovery = match Discovery::new(config.discovery.clone(), &log) {
        Ok(discovery) => {
            discovery.on_peer_discovered(move |address| {
                let _ = discovered_tx.send(address.to_string());
            });
            discovery.start()?;
            Some(discovery)
        }
        Err(e) => {
            warn!("Discovery disabled: {}", e);
            None
        }
    };

    let deadline = args
        .duration_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let sweep_interval = config.node.sweep_interval();
    let mut next_sweep = Instant::now() + sweep_interval;

    info!("Relay node running");

    loop {
        let now = Instant::now();
        if deadline.is_some_and(|d| now >= d) {
            info!("Run duration elapsed");
            break;
        }

        let mut wait = next_sweep.saturating_duration_since(now);
        if let Some(d) = deadline {
            wait = wait.min(d.saturating_duration_since(now));
        }

        match discovered_rx.recv_timeout(wait) {
            Ok(address) => node.on_peer_discovered(&address),
            Err(RecvTimeoutError::Timeout) => {}
            // Discovery is disabled; nothing left to wait on but the clock.
            Err(RecvTimeoutError::Disconnected) => thread::sleep(wait),
        }

        if Instant::now() >= next_sweep {
            node.sweep(config.node.inactivity_timeout());
            next_sweep = Instant::now() + sweep_interval;
        }
    }

    info!("Shutting down");
    if let Some(discovery) = discovery {
        discovery.stop();
    }
    for peer in node.registry.list_peers() {
        peer.close_connection();
    }
    let _ = acceptor.join();
    let _ = receiver.join();
    Ok(())
}

fn demo(args: DemoArgs) -> Result<()> {
    let log = Logger::with_level(LogLevel::Info);

    let server = Arc::new(
        PeerEndpoint::listen("server_1", "127.0.0.1", args.port, 5, &log)
            .context("Failed to create server peer")?,
    );
    let registry = PeerRegistry::new(&log);
    registry.add_peer(server.clone())?;

    let mut clients = Vec::new();
    for i in 0..args.clients {
        let client = Arc::new(
            PeerEndpoint::connect(format!("client_{}", i), "127.0.0.1", args.port, &log)
                .with_context(|| format!("Failed to create client {}", i))?,
        );
        registry.add_peer(client.clone())?;
        clients.push(client);
    }

    let (ready_tx, ready_rx) = mpsc::channel();
    let accepting = server.clone();
    let expected = clients.len();
    thread::spawn(move || {
        let accepted = accepting.accept_clients(expected).unwrap_or(0);
        let _ = ready_tx.send(accepted);
    });

    match ready_rx.recv_timeout(Duration::from_secs(5)) {
        Ok(accepted) => println!("Server accepted {} client(s)", accepted),
        Err(_) => anyhow::bail!("Timeout waiting for server to accept clients"),
    }

    let report = registry.broadcast("Hello to all peers!");
    println!(
        "Broadcast delivered to {}/{} peers (failed: {:?})",
        report.delivered, report.attempted, report.failed
    );

    if clients.len() >= 2 {
        registry.relay_message(clients[0].id(), clients[1].id(), "hi from client_0")?;
        println!("Relayed a message from client_0 to client_1");
    }

    // One broadcast copy per client, plus the relayed message.
    let expected_messages = clients.len() + usize::from(clients.len() >= 2);
    for _ in 0..expected_messages {
        match server.receive_message()? {
            Some(message) => println!("Server received: {}", message),
            None => println!("Server received nothing"),
        }
    }

    for peer in registry.list_peers() {
        peer.close_connection();
    }
    println!("DEMO complete");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if cli.verbose {
        "debug,relay_daemon=debug,relay_core=debug"
    } else {
        "info,relay_daemon=info,relay_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Run(args) => run(args),
        Command::Demo(args) => demo(args),
    }
}
