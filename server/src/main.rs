#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # httptun
//!
//! HTTP-over-WebSocket tunnel for endpoints the public internet can't reach.
//!
//! A gateway accepts inbound HTTP on a public address and persistent
//! WebSocket connections from agents. A request for
//! `<prefix>/<agent key>/<resource>` is multiplexed onto that agent's socket;
//! the agent replays it against its local service and streams the response
//! back through the gateway.
//!
//! ## Subcommands
//!
//! - `httptun gateway`: run the public gateway
//! - `httptun agent`: run a tunnel agent next to the local service
//!
//! ## Gateway surface
//!
//! ```text
//! GET  /ws/{key}?token=…        agent socket upgrade
//! GET  /api/tunnel/agents       connected agents (token-gated when a tunnel key is set)
//! ANY  <prefix>/{key}/{path}    tunneled to the agent registered as {key}
//! ```

use std::process::exit;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use httptun::config::Config;
use httptun::tunnel::{agent, gateway};

/// HTTP-over-WebSocket tunnel.
#[derive(Parser)]
#[command(name = "httptun", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the public gateway.
    Gateway {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run a tunnel agent forwarding to a local service.
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (config_path, run_gateway) = match cli.command {
        Commands::Gateway { config } => (config, true),
        Commands::Agent { config } => (config, false),
    };
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("httptun: {e}");
            exit(1);
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("httptun v{} starting", env!("CARGO_PKG_VERSION"));
    if run_gateway {
        run_gateway_mode(config).await;
    } else {
        run_agent_mode(config).await;
    }
    info!("Goodbye");
}

async fn run_gateway_mode(config: Config) {
    let gw = &config.gateway;
    if gw.tunnel_key.is_none() {
        warn!("No tunnel key configured, any agent key will be admitted");
    }

    let state = gateway::GatewayState::new(
        &gw.path_prefix,
        Duration::from_millis(gw.request_timeout_ms),
        gw.tunnel_key.clone(),
    );
    let registry = state.registry.clone();
    let app = gateway::gateway_router(state);

    // Periodic sweep: evict agents that stopped pinging
    let sweep_task = gateway::spawn_heartbeat_sweep(
        registry.clone(),
        Duration::from_secs(gw.heartbeat_timeout_secs.max(1)),
    );

    let listener = match TcpListener::bind(&gw.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", gw.listen);
            exit(1);
        }
    };
    info!("Gateway listening on {} (prefix {})", gw.listen, gw.path_prefix);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {e}");
    }

    info!("Shutting down, closing agent connections...");
    sweep_task.abort();
    registry.close_all();
}

async fn run_agent_mode(config: Config) {
    let task = match agent::spawn(config.agent.clone()) {
        Ok(task) => task,
        Err(e) => {
            error!("Invalid agent configuration: {e}");
            exit(1);
        }
    };
    info!(
        "Agent forwarding {} via {}",
        config.agent.forward_to.as_deref().unwrap_or_default(),
        config.agent.server_url
    );

    shutdown_signal().await;
    info!("Shutting down, aborting in-flight requests...");
    task.abort();
    let _ = task.await;
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
