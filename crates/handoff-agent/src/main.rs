//! Agent entry point.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use handoff_agent::api::{build_router, AgentContext};
use handoff_agent::AgentConfig;
use handoff_fabric::Fabric;

#[derive(Debug, Parser)]
#[command(name = "handoff-agent", about = "live process migration agent")]
struct Cli {
    /// Public-facing network interface shadow traffic is captured on.
    #[arg(long)]
    iface: Option<String>,

    /// Port the control API listens on.
    #[arg(long, default_value_t = 8080)]
    port: i64,

    /// CIDR block of the virtual network behind the bridge.
    #[arg(long = "network-cidr", default_value = "172.31.0.0/24")]
    network_cidr: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let Some(iface) = cli.iface else {
        eprintln!("error: no iface provided");
        std::process::exit(1);
    };
    if !(0..=65535).contains(&cli.port) {
        eprintln!("error: invalid port provided");
        std::process::exit(1);
    }
    let port = cli.port as u16;

    // Everything below needs netlink, iptables, and namespace syscalls.
    if !nix::unistd::Uid::effective().is_root() {
        eprintln!("error: must be invoked as root");
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let fabric = match Fabric::ensure_bridge(&cli.network_cidr).await {
        Ok(fabric) => Arc::new(fabric),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    };

    let config = AgentConfig::new(iface, port, cli.network_cidr.clone());
    let ctx = AgentContext::new(config, fabric);
    let app = build_router(ctx);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("handoff agent listening on 0.0.0.0:{port}");
    axum::serve(listener, app).await?;
    Ok(())
}
