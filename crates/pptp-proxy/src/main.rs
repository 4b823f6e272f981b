//! pptpproxy: PPTP relay.
//!
//! Accepts PPTP control connections, forwards each to a configured remote
//! server, and relays the GRE data plane between the two while translating
//! call ids. Optionally tunnels GRE inside the control connection
//! (PPTP-IN-TCP) for endpoints that advertise support for it.

mod acl;
mod config;
mod control;
mod dispatch;
mod gre;
mod link;
mod pairs;
mod registry;
mod resolver;

use acl::{AccessControl, AclPolicy};
use clap::Parser;
use config::{CliOverrides, ProxyConfig};
use dispatch::Dispatcher;
use gre::{DataPlane, GreSocket};
use registry::LinkRegistry;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{error, info, trace};
use tracing_subscriber::EnvFilter;

/// pptpproxy: PPTP relay with GRE call-id translation
#[derive(Parser, Debug)]
#[command(name = "pptpproxy", version, about = "PPTP relay with GRE call-id translation")]
struct Cli {
    /// Forwarding pair `[listen[:port],]remote[:port]` (repeatable)
    #[arg(short = 'p', long = "proxy", value_name = "PAIR")]
    proxy: Vec<String>,

    /// Admitted subnet `net/mask`, mask dotted or prefix length (repeatable)
    #[arg(short = 'a', long = "acl", value_name = "NET/MASK")]
    acl: Vec<String>,

    /// Admission command, run as `CMD <ip>`; exit 0 admits (repeatable)
    #[arg(short = 'x', long = "acl-cmd", value_name = "CMD")]
    acl_cmd: Vec<String>,

    /// Disable the PPTP-IN-TCP extension
    #[arg(short = 'f', long)]
    force_std: bool,

    /// Dump every control message and GRE unit
    #[arg(short = 'e', long)]
    extensive: bool,

    /// Debug logging
    #[arg(short = 'd', long)]
    debug: bool,

    /// Append logs to this file instead of stdout
    #[arg(short = 'l', long)]
    log_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.pptpproxy/config.toml")]
    config: String,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            pairs: self.proxy.clone(),
            acl: self.acl.clone(),
            acl_commands: self.acl_cmd.clone(),
            force_std: self.force_std,
            packet_dump: self.extensive,
            debug: self.debug,
            log_file: self.log_file.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Tracing depends on the merged config, so nothing is logged before this.
    let config_path = PathBuf::from(&cli.config);
    let config = match ProxyConfig::load(Some(&config_path), cli.overrides()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("pptpproxy: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = init_tracing(&config) {
        eprintln!("pptpproxy: {e}");
        std::process::exit(1);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pairs = config.pairs.len(),
        wrap = config.wrap,
        "starting pptpproxy"
    );

    let access = match AccessControl::new(AclPolicy {
        subnets: config.acl.clone(),
        commands: config.acl_commands.clone(),
    })
    .await
    {
        Ok(access) => access,
        Err(e) => {
            error!(error = %e, "invalid acl");
            std::process::exit(1);
        }
    };

    let pairs = pairs::bind_pairs(&config.pairs).await;
    if pairs.is_empty() {
        error!("no valid pair left, exiting");
        std::process::exit(1);
    }

    let gre_socket = match GreSocket::open() {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            error!(error = %e, "couldn't open raw GRE socket (requires CAP_NET_RAW)");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(LinkRegistry::new());
    let data_plane = Arc::new(DataPlane::new(
        registry.clone(),
        gre_socket.clone(),
        config.packet_dump,
    ));

    let gre_task = tokio::spawn(data_plane.clone().run(gre_socket));

    let dispatcher = Dispatcher::new(
        pairs,
        registry.clone(),
        data_plane,
        access,
        config.wrap,
        config.packet_dump,
    );

    info!("pptpproxy ready");

    let result = tokio::select! {
        result = dispatcher.run() => result,
        _ = shutdown_signal() => {
            let links = registry.count().await;
            info!(links, "shutdown signal received");
            Ok(())
        }
    };

    gre_task.abort();
    if let Err(e) = result {
        error!(error = %e, "dispatch loop failed");
        std::process::exit(1);
    }
}

fn init_tracing(config: &ProxyConfig) -> std::io::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
    }
    Ok(())
}

/// Emit a hex/ASCII dump of `buf` at trace level.
pub(crate) fn dump_packet(context: &str, buf: &[u8]) {
    trace!(context, len = buf.len(), "packet dump");
    for line in pptp_core::hex_dump(buf) {
        trace!(context, "{line}");
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
