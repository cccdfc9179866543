use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use discv5::{Config, EntryStatus, Event, Keypair, Node, NodeId, NodeRecord};

fn parse_record(s: &str) -> Result<NodeRecord> {
    let record = NodeRecord::from_hex(s).context("bootstrap record must be a hex-encoded node record")?;
    record
        .verify()
        .map_err(|e| anyhow::anyhow!("bootstrap record signature invalid: {}", e))?;
    Ok(record)
}

fn parse_secret(s: &str) -> Result<Keypair> {
    let bytes: [u8; 32] = hex::decode(s)
        .context("invalid hex secret key")?
        .try_into()
        .map_err(|_| anyhow::anyhow!("secret key must be 64 hex characters (32 bytes)"))?;
    Ok(Keypair::from_secret_key_bytes(&bytes))
}

#[derive(Parser, Debug)]
#[command(name = "discv5")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:9000")]
    bind: SocketAddr,

    /// Hex-encoded record of a peer to join through.
    #[arg(short = 'B', long = "bootstrap", value_name = "RECORD", value_parser = parse_record)]
    bootstrap: Vec<NodeRecord>,

    /// Hex-encoded Ed25519 secret key; a fresh identity is generated otherwise.
    #[arg(long, value_name = "HEX", value_parser = parse_secret)]
    secret_key: Option<Keypair>,

    /// Seconds between random lookups.
    #[arg(short, long, default_value = "60")]
    lookup_interval: u64,

    /// Request timeout in milliseconds.
    #[arg(long, default_value = "1000")]
    request_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let keypair = args.secret_key.unwrap_or_else(Keypair::generate);
    let config = Config::with_request_timeout(Duration::from_millis(args.request_timeout));
    let node = Node::bind_with(&args.bind.to_string(), keypair, config).await?;
    let record = node.local_record().await?;
    info!(node_id = %node.node_id(), "node started");
    info!("Local record: {}", record.to_hex());

    let mut events = node.events().await?;

    if !args.bootstrap.is_empty() {
        match node.bootstrap(&args.bootstrap).await {
            Ok(reached) => info!(reached, "Bootstrap complete"),
            Err(e) => warn!(error = %e, "Bootstrap failed"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.lookup_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let target = NodeId::random();
                let found = node.find_peers(target).await;
                let peers = node.peers().await;
                let connected = peers.iter().filter(|(_, status)| *status == EntryStatus::Connected).count();
                info!(
                    target = %target.short(),
                    found = found.len(),
                    table = peers.len(),
                    connected,
                    "random lookup"
                );
            }
            Some(event) = events.recv() => match event {
                Event::ExternalAddressUpdated(addr) => {
                    info!(addr = %addr, "external address updated");
                    if let Ok(record) = node.local_record().await {
                        info!("Local record: {}", record.to_hex());
                    }
                }
                event => debug!(?event, "discovery event"),
            },
        }
    }

    node.shutdown().await;
    Ok(())
}
