//! data-server — serve the partitions listed in a config file.
//!
//! ```text
//! data-server [--config server.conf] [--log-level info] [--port N]
//! ```
//!
//! SIGINT/SIGTERM stop the node. With `stop_on_exit=true` (the default)
//! every started partition is closed first; otherwise only the listener
//! and connections go away and backends are left as they are.

use std::os::raw::c_int;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flatdb::{BackendRegistry, Node, ServerConfig, DEFAULT_CONFIG_FILE};

#[derive(Debug, Parser)]
#[command(name = "data-server", version, about = "FlatDB partitioned data server")]
struct Args {
    /// Properties file with name, partitions and backend
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Override the configured port
    #[arg(long)]
    port: Option<u16>,
}

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_: c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        unsafe { signal::sigaction(sig, &action) }
            .with_context(|| format!("install {sig} handler"))?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let mut config = ServerConfig::load(&args.config)
        .with_context(|| format!("load {}", args.config.display()))?;
    if let Some(port) = args.port {
        config.port = port;
    }

    install_signal_handlers()?;

    let registry = BackendRegistry::default();
    let mut node = Node::start(&config, &registry).context("start node")?;
    info!(
        db = %config.name,
        addr = %node.local_addr(),
        partitions = ?config.partitions,
        "data server ready"
    );

    while RUNNING.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }

    info!("shutdown requested");
    if config.stop_on_exit {
        if let Err(e) = node.shutdown() {
            warn!(error = %e, failed = ?e.failed_partitions(), "some partitions did not close");
        }
    } else {
        node.halt();
    }
    Ok(())
}
