use anyhow::Context;
use clap::Parser;
use common::logging::LogArgs;
use data::{DataManager, IniFileStore, MemoryStore, StoreConfig};
use hearthd::{Daemon, EndpointConfig};
use std::path::PathBuf;
use std::sync::Arc;
use transport::server::{ServerOptions, UxdServerConfig};
use transport::Framing;

/// The hearth daemon: serves a control socket over its configuration and
/// runtime data stores.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    #[command(flatten)]
    log: LogArgs,

    /// Directory holding the data store backends.
    #[arg(long = "data.path", env = "HEARTH_DATA_PATH", default_value = "./config")]
    data_path: PathBuf,

    /// Path of the UXD control socket.
    #[arg(
        long = "socket.path",
        env = "HEARTH_SOCKET",
        default_value = "/var/run/hearthd.sock"
    )]
    socket: PathBuf,

    /// Restrict the control socket to the owning user.
    #[arg(long = "socket.user-only")]
    user_only: bool,

    /// Restrict the control socket to the owning group.
    #[arg(long = "socket.group-only")]
    group_only: bool,

    /// Maximum number of parallel peer connections.
    #[arg(long = "socket.max-connections", default_value = "100")]
    max_connections: usize,

    /// Disconnect peers which send nothing for this long. "0s" disables the
    /// idle check.
    #[arg(
        long = "socket.idle-timeout",
        env = "HEARTH_IDLE_TIMEOUT",
        value_parser = humantime::parse_duration,
        default_value = "0s"
    )]
    idle_timeout: std::time::Duration,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.log.init();
    transport::tls::install_default_provider();

    // A runtime which cannot be created is fatal: log and exit non-zero.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "cannot create async runtime");
            std::process::exit(1);
        }
    };

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let manager = Arc::new(DataManager::new(&cli.data_path));
    manager
        .register_store(Arc::new(
            IniFileStore::new(StoreConfig {
                synced: true,
                ..StoreConfig::default()
            })
            .context("cannot build config store")?,
        ))
        .await;
    manager
        .register_store(Arc::new(
            MemoryStore::new(StoreConfig::default()).context("cannot build cache store")?,
        ))
        .await;

    let idle_timeout = (!cli.idle_timeout.is_zero()).then_some(cli.idle_timeout);
    let daemon = Daemon::new(manager).with_idle_timeout(idle_timeout);
    daemon
        .run(EndpointConfig::Uxd(UxdServerConfig {
            user_only: cli.user_only,
            group_only: cli.group_only,
            options: ServerOptions {
                framing: Framing::lines(),
                max_connections: Some(cli.max_connections),
                ..ServerOptions::default()
            },
            ..UxdServerConfig::at(&cli.socket)
        }))
        .await
}
