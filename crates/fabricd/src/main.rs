//! Fabric Agent Daemon
//!
//! Main entry point for fabricd. Acquires this host's subnet lease and keeps
//! the kernel routing table in step with the leases of every peer.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-3: Content of Audit Records - Structured logging
//! - AU-12: Audit Record Generation - Log daemon lifecycle
//! - CM-6: Configuration Settings - Network configuration file
//! - SC-7: Boundary Protection - Peer routes via the external interface

mod iface;
mod ipmasq;
mod subnet_file;

use anyhow::{bail, Context, Result};
use clap::Parser;
use fabric_backend::{
    BackendContext, BackendManager, Config, ExternalInterface, HostGwBackend, NetlinkRouteTable,
    StaticFileManager, SubnetDef, HOST_GW,
};
use fabric_types::{IpAddress, IpPrefix};
use ipmasq::IpMasq;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Default file locations
/// NIST: CM-6 - Configuration settings
const DEFAULT_CONFIG_PATH: &str = "/etc/fabric/net-conf.json";
const DEFAULT_LEASES_PATH: &str = "/etc/fabric/leases.json";

#[derive(Parser, Debug)]
#[command(name = "fabricd", version, about = "Host network fabric agent")]
struct Args {
    /// Network configuration file (JSON)
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Lease file shared by the cluster's nodes (JSON)
    #[arg(long, default_value = DEFAULT_LEASES_PATH)]
    leases: PathBuf,

    /// Interface peers reach this host through, by name or by one of its
    /// addresses; defaults to the first non-loopback interface that is up
    #[arg(short = 'i', long)]
    iface: Option<String>,

    /// Address peers use to reach this host; defaults to the interface address
    #[arg(long)]
    public_ip: Option<IpAddress>,

    /// Masquerade traffic leaving the overlay network
    #[arg(long)]
    ip_masq: bool,

    /// Where to publish this host's subnet for the container runtime
    #[arg(long, default_value = subnet_file::DEFAULT_SUBNET_FILE)]
    subnet_file: PathBuf,

    /// Log level, used when RUST_LOG is unset
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // NIST: AU-3, AU-12 - Audit logging setup
    init_logging(&args.log_level)?;

    info!("fabricd: Starting fabric agent");

    match run_daemon(args).await {
        Ok(()) => {
            info!("fabricd: Daemon exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = ?e, "fabricd: Daemon exiting with error");
            Err(e)
        }
    }
}

/// Initialize structured logging
///
/// # NIST Controls
/// - AU-3: Content of Audit Records - Structured format
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("failed to set logger")?;
    Ok(())
}

async fn run_daemon(args: Args) -> Result<()> {
    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(network) = config.network {
        info!(network = %network, "fabricd: Loaded network configuration");
    }
    if args.ip_masq && config.network.is_none() {
        bail!("--ip-masq needs Network in {}", args.config.display());
    }

    let ext_iface = iface::resolve(args.iface.as_deref())?;
    let public_ip = args.public_ip.unwrap_or(ext_iface.iface_addr);
    if public_ip.is_unspecified() {
        bail!("public IP {} is unspecified", public_ip);
    }
    info!(
        iface = %ext_iface.name,
        index = ext_iface.index,
        mtu = ext_iface.mtu,
        addr = %ext_iface.iface_addr,
        public_ip = %public_ip,
        "fabricd: Using external interface"
    );

    let subnet_manager =
        Arc::new(StaticFileManager::new(args.leases.clone()).with_network(config.network));
    let route_table =
        Arc::new(NetlinkRouteTable::new().context("failed to open route netlink socket")?);
    let ctx = BackendContext::new(subnet_manager, route_table).with_config(config.backend.clone());

    let cancel = CancellationToken::new();
    let manager = BackendManager::new(ctx, cancel.clone());
    manager.register(HOST_GW, HostGwBackend::constructor());

    let outcome = match start_backend(
        &manager,
        &config.backend.kind,
        &ext_iface,
        public_ip,
        args.ip_masq,
    )
    .await
    {
        Ok(subnet) => {
            info!(subnet = %subnet.net, mtu = subnet.mtu, "fabricd: Backend running");
            serve(&args, config.network, &subnet).await
        }
        Err(e) => Err(e),
    };

    info!("fabricd: Stopping backends");
    cancel.cancel();
    manager.wait().await;
    info!("fabricd: Graceful shutdown complete");

    outcome
}

async fn start_backend(
    manager: &BackendManager,
    kind: &str,
    ext_iface: &ExternalInterface,
    public_ip: IpAddress,
    ip_masq: bool,
) -> Result<SubnetDef> {
    let backend = manager
        .get_backend(kind)
        .with_context(|| format!("failed to create backend {}", kind))?;
    backend
        .init(ext_iface, public_ip, ip_masq)
        .await
        .with_context(|| format!("failed to initialize backend {}", kind))
}

/// Publishes the subnet, masquerades if asked, then runs until a shutdown
/// signal. Masquerade rules are removed on the way out.
async fn serve(args: &Args, network: Option<IpPrefix>, subnet: &SubnetDef) -> Result<()> {
    let masq = match network.filter(|_| args.ip_masq) {
        Some(network) => {
            let masq = IpMasq::new(network, subnet.net)?;
            masq.setup().await.context("failed to set up IP masquerade")?;
            info!(network = %network, "fabricd: IP masquerade enabled");
            Some(masq)
        }
        None => None,
    };

    let outcome = match publish_subnet(&args.subnet_file, network, subnet, args.ip_masq) {
        Ok(()) => shutdown_signal().await,
        Err(e) => Err(e),
    };

    if let Some(masq) = masq {
        masq.teardown().await;
    }
    outcome
}

fn publish_subnet(
    path: &Path,
    network: Option<IpPrefix>,
    subnet: &SubnetDef,
    ip_masq: bool,
) -> Result<()> {
    subnet_file::write_subnet_file(path, network, subnet, ip_masq)
        .with_context(|| format!("failed to write subnet file {}", path.display()))?;
    info!(path = %path.display(), "fabricd: Wrote subnet file");
    Ok(())
}

/// Waits for SIGINT or SIGTERM.
///
/// # NIST Controls
/// - AU-12: Audit Record Generation - Log shutdown signals
async fn shutdown_signal() -> Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for SIGINT")?;
            info!("fabricd: Received SIGINT");
        }
        _ = terminate.recv() => {
            info!("fabricd: Received SIGTERM");
        }
    }
    Ok(())
}
