//! LatticeCache node binary: static membership over TCP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use lattice_cache::{
    parse_members, AtomicCache, CacheConfig, CacheStore, Discovery, FjallStore, TcpTransport,
    WriteOrder, WriteSync,
};

#[derive(Parser, Debug)]
#[command(name = "lattice-node", about = "LatticeCache cluster node")]
struct NodeArgs {
    #[arg(long)]
    node_id: u64,

    #[arg(long)]
    listen: SocketAddr,

    /// Comma-separated list like: `1@127.0.0.1:7400,2@127.0.0.1:7401`
    #[arg(long, env = "LATTICE_INITIAL_MEMBERS")]
    initial_members: String,

    /// Backup copies per partition.
    #[arg(long, env = "LATTICE_BACKUPS", default_value_t = 1)]
    backups: usize,

    #[arg(long, env = "LATTICE_PARTITIONS", default_value_t = 1024)]
    partitions: u32,

    /// full-sync, primary-sync or full-async.
    #[arg(long, env = "LATTICE_WRITE_SYNC", default_value = "primary-sync")]
    write_sync: String,

    /// clock or primary.
    #[arg(long, env = "LATTICE_WRITE_ORDER", default_value = "clock")]
    write_order: String,

    /// Directory for the write-through store; omit to disable write-through.
    #[arg(long, env = "LATTICE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[arg(long, env = "LATTICE_NETWORK_TIMEOUT_MS", default_value_t = 10_000)]
    network_timeout_ms: u64,

    #[arg(long, env = "LATTICE_DEFERRED_ACK_BUFFER", default_value_t = 256)]
    deferred_ack_buffer: usize,

    #[arg(long, env = "LATTICE_DEFERRED_ACK_TIMEOUT_MS", default_value_t = 500)]
    deferred_ack_timeout_ms: u64,

    /// Data-center ordinal stamped into produced versions.
    #[arg(long, env = "LATTICE_DATA_CENTER", default_value_t = 0)]
    data_center: u8,
}

fn parse_write_sync(s: &str) -> anyhow::Result<WriteSync> {
    match s {
        "full-sync" => Ok(WriteSync::FullSync),
        "primary-sync" => Ok(WriteSync::PrimarySync),
        "full-async" => Ok(WriteSync::FullAsync),
        other => anyhow::bail!("unknown write sync mode {other:?}"),
    }
}

fn parse_write_order(s: &str) -> anyhow::Result<WriteOrder> {
    match s {
        "clock" => Ok(WriteOrder::Clock),
        "primary" => Ok(WriteOrder::Primary),
        other => anyhow::bail!("unknown write order mode {other:?}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = NodeArgs::parse();
    let members = parse_members(&args.initial_members).context("parse --initial-members")?;

    let store: Option<Arc<dyn CacheStore>> = match &args.data_dir {
        Some(dir) => Some(Arc::new(
            FjallStore::open(dir).context("open write-through store")?,
        )),
        None => None,
    };

    let config = CacheConfig {
        backups: args.backups,
        partition_count: args.partitions,
        write_sync: parse_write_sync(&args.write_sync)?,
        write_order: parse_write_order(&args.write_order)?,
        deferred_ack_buffer_size: args.deferred_ack_buffer,
        deferred_ack_timeout: Duration::from_millis(args.deferred_ack_timeout_ms),
        store_enabled: store.is_some(),
        network_timeout: Duration::from_millis(args.network_timeout_ms),
        data_center_id: args.data_center,
        ..CacheConfig::default()
    };

    let (transport, inbound) = TcpTransport::bind(args.node_id, args.listen, &members)
        .await
        .context("bind transport")?;
    let discovery = Discovery::new(&members);
    let cache = AtomicCache::start(
        args.node_id,
        config,
        transport,
        inbound,
        &discovery,
        store,
    )
    .context("start cache")?;

    tracing::info!(node = args.node_id, listen = %args.listen, "lattice node running");
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down");
    cache.stop().await;
    Ok(())
}
