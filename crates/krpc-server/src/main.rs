//! kRPC Server - host process driving the RPC engine from a fixed-rate tick.
//!
//! Registers the built-in `KRPC` service and a demo `Simulation` service,
//! listens on TCP and calls `Core::update` once per tick until Ctrl-C.

mod simulation;

use anyhow::{Context, Result};
use clap::Parser;
use krpc_core::service::ServiceRegistry;
use krpc_core::{Core, ServerConfig, ServerEvent};
use simulation::Simulation;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "krpc-server")]
#[command(about = "kRPC server hosting a demo flight simulation")]
struct Args {
    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// RPC port (0 = auto-assign)
    #[arg(long)]
    rpc_port: Option<u16>,

    /// Stream port (0 = auto-assign)
    #[arg(long)]
    stream_port: Option<u16>,

    /// JSON configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server ticks per second
    #[arg(long, default_value = "60")]
    tick_hz: u32,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn load_config(args: &Args) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(host) = &args.host {
        config.address = host.clone();
    }
    if let Some(port) = args.rpc_port {
        config.rpc_port = port;
    }
    if let Some(port) = args.stream_port {
        config.stream_port = port;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting kRPC server");

    if args.tick_hz == 0 {
        anyhow::bail!("--tick-hz must be greater than zero");
    }
    let config = load_config(&args)?;

    let simulation = Simulation::new();
    let mut services = ServiceRegistry::new();
    simulation::register(&mut services, &simulation)?;

    let mut core = Core::with_tcp(config, services)?;
    core.subscribe(|event| match event {
        ServerEvent::ClientConnected(client) => {
            info!("{} connected ({})", client.name, client.address)
        }
        ServerEvent::ClientDisconnected(client) => {
            info!(
                "{} disconnected ({} bytes read, {} written)",
                client.name, client.bytes_read, client.bytes_written
            )
        }
        _ => {}
    });
    core.start()?;

    let rpc_addr = core
        .rpc_address()
        .context("RPC listener has no local address")?;
    let stream_addr = core
        .stream_address()
        .context("stream listener has no local address")?;

    // Port discovery for launchers and tests (intentional stdout)
    println!("RPC_PORT={}", rpc_addr.port());
    println!("STREAM_PORT={}", stream_addr.port());

    info!("RPC server running on {}, streams on {}", rpc_addr, stream_addr);

    let period = Duration::from_secs(1) / args.tick_hz;
    let dt = period.as_secs_f64();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut universal_time = 0.0;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                simulation.advance(dt);
                universal_time += dt;
                core.set_universal_time(universal_time);
                // The update blocks for up to its time budget.
                tokio::task::block_in_place(|| core.update());
            }
            result = &mut shutdown => {
                result?;
                info!("Shutdown signal received, exiting");
                break;
            }
        }
    }

    core.stop();
    Ok(())
}
