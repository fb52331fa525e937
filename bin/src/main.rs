use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use moor_core::config::{cli, trace};
use moor_core::lockspaces::LockspaceRegistry;
use moor_core::tokio::{self, net::UnixListener, runtime::Builder, signal};
use moor_core::tracing::*;
use moor_core::{Daemon, Server};

#[derive(Parser, Debug)]
#[clap(author, name = "moord", about = "shared-storage lease manager", long_about = None)]
struct Cli {
    #[clap(flatten)]
    config: cli::Config,
    #[clap(subcommand)]
    action: Option<Action>,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Run the daemon (the default).
    Daemon,
    /// Initialize a lockspace delta-lease area on a disk.
    InitLockspace {
        /// lockspace name
        #[clap(long)]
        name: String,
        /// disk path
        #[clap(long)]
        path: String,
        /// byte offset of the lease area
        #[clap(long, default_value_t = 0)]
        offset: u64,
        /// delta-lease slots to write
        #[clap(long, default_value_t = ondisk::DEFAULT_MAX_HOSTS)]
        max_hosts: u64,
    },
    /// Initialize a resource lease area on a disk.
    InitResource {
        /// lockspace name
        #[clap(long)]
        lockspace: String,
        /// resource name
        #[clap(long)]
        name: String,
        /// disk path
        #[clap(long)]
        path: String,
        /// byte offset of the lease area
        #[clap(long, default_value_t = 0)]
        offset: u64,
        /// hosts allowed to contend for the lease
        #[clap(long, default_value_t = 0)]
        num_hosts: u64,
        /// write the cleared magic instead of a usable area
        #[clap(long)]
        clear: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_ring = trace::init(&cli.config.moor_log)?;
    debug!(config = ?cli.config, "parsed configuration");

    let mut builder = Builder::new_multi_thread();
    builder.thread_name(&cli.config.thread_name).enable_all();
    let rt = builder.build()?;

    rt.block_on(async move {
        let result = match cli.action.unwrap_or(Action::Daemon) {
            Action::Daemon => run_daemon(cli.config, log_ring).await,
            Action::InitLockspace {
                name,
                path,
                offset,
                max_hosts,
            } => init_lockspace(&cli.config, &name, &path, offset, max_hosts).await,
            Action::InitResource {
                lockspace,
                name,
                path,
                offset,
                num_hosts,
                clear,
            } => init_resource(&cli.config, &lockspace, &name, &path, offset, num_hosts, clear)
                .await,
        };
        if let Err(err) = &result {
            error!(?err, "exited with error");
        }
        result
    })
}

async fn run_daemon(config: cli::Config, log_ring: trace::LogRing) -> Result<()> {
    let daemon = Daemon::new(config, log_ring);

    // the fencing arithmetic is verified before anything can arm
    let _wdmd_guard = daemon
        .setup_watchdog()
        .await
        .map_err(|err| anyhow!("watchdog setup failed: {err}"))?;

    if let Some(dir) = daemon.config.socket_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating socket directory {}", dir.display()))?;
    }
    let _ = std::fs::remove_file(&daemon.config.socket_path);
    let listener = UnixListener::bind(&daemon.config.socket_path)
        .with_context(|| format!("binding {}", daemon.config.socket_path.display()))?;
    info!(socket = %daemon.config.socket_path.display(), "listening");

    let token = daemon.cancel.clone();
    Server::new(Arc::clone(&daemon))
        .listen(listener, shutdown_signal(token))
        .await
}

async fn init_lockspace(
    config: &cli::Config,
    name: &str,
    path: &str,
    offset: u64,
    max_hosts: u64,
) -> Result<()> {
    let disk = open_disk(config, path, offset)?;
    LockspaceRegistry::init_area(disk, name, max_hosts, &config.timeouts())
        .await
        .map_err(|err| anyhow!("init lockspace failed: {err}"))?;
    info!(name, path, max_hosts, "lockspace area written");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn init_resource(
    config: &cli::Config,
    lockspace: &str,
    name: &str,
    path: &str,
    offset: u64,
    num_hosts: u64,
    clear: bool,
) -> Result<()> {
    let disk = open_disk(config, path, offset)?;
    let sector_size = disk.sector_size();
    let token = paxos_lease::Token::new(
        lockspace,
        name,
        vec![disk],
        sector_size,
        1,
        0,
        config.timeouts(),
    )
    .map_err(|err| anyhow!("bad resource geometry: {err}"))?;
    paxos_lease::init(&token, num_hosts, clear)
        .await
        .map_err(|err| anyhow!("init resource failed: {err}"))?;
    info!(lockspace, name, path, num_hosts, clear, "resource area written");
    Ok(())
}

fn open_disk(config: &cli::Config, path: &str, offset: u64) -> Result<sector_io::SyncDisk> {
    let disk = if config.direct_io {
        sector_io::SyncDisk::open_direct(path, offset)
    } else {
        sector_io::SyncDisk::open_buffered(path, offset)
    };
    disk.with_context(|| format!("opening {path}"))
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    tokio::select! {
        res = signal::ctrl_c() => {
            token.cancel();
            res.map_err(|err| anyhow!(err))
        }
        _ = token.cancelled() => Ok(()),
    }
}
