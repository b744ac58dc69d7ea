#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ps3net_server::{start_server, IpRange, ServerConfig, DEFAULT_BUFFER_SIZE};

#[derive(Debug, Parser)]
#[command(name = "ps3netd")]
#[command(
    about = "Serve a game library to WebMAN/IrisMAN clients over the network",
    version
)]
struct Cli {
    /// Root directory with games.
    #[arg(default_value = ".")]
    root: PathBuf,

    /// Main server listen address.
    #[arg(long, default_value = "0.0.0.0:38008")]
    listen_addr: SocketAddr,

    /// Timeout in seconds for incoming commands. The connection is closed on
    /// expiration; 0 disables the deadline.
    #[arg(long, default_value_t = 600, value_name = "SECONDS")]
    read_timeout: u64,

    /// Limit on concurrently connected clients. 0 means no limit.
    #[arg(long, default_value_t = 0)]
    max_clients: usize,

    /// Optional client IP allowlist. Comma-separated entries: single IPv4/v6
    /// ('192.168.0.2'), CIDR ('192.168.0.0/24'), IPv4 + subnet mask
    /// ('192.168.0.0/255.255.255.0'), or a range ('192.168.0.1-192.168.0.255').
    #[arg(long)]
    client_whitelist: Option<IpRange>,

    /// Allow clients to create, write and delete files.
    #[arg(long)]
    allow_write: bool,

    /// Size of the buffer used for data transfer.
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Enable debug log messages.
    #[arg(long)]
    debug: bool,

    /// Output log messages in JSON format.
    #[arg(long)]
    json_log: bool,
}

fn init_tracing(debug: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug, cli.json_log);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("initialize runtime")?;
    rt.block_on(serve(cli))
}

async fn serve(cli: Cli) -> anyhow::Result<()> {
    let cfg = ServerConfig {
        root: cli.root,
        listen_addr: cli.listen_addr,
        read_timeout: Duration::from_secs(cli.read_timeout),
        max_clients: cli.max_clients,
        client_whitelist: cli.client_whitelist,
        allow_write: cli.allow_write,
        buffer_size: cli.buffer_size,
    };

    let handle = start_server(cfg).await.context("start server")?;

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
