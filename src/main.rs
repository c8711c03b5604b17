//! agentcell - session-scoped code-execution sandboxes with token-gated
//! egress.
//!
//! Usage:
//!   agentcell serve                      # Sandbox manager + gRPC front-end
//!   agentcell serve --with-proxy        # Also run the egress proxy in-process
//!   agentcell agent [--addr 0.0.0.0:2024]   # In-sandbox PID-1 agent
//!   agentcell proxy [--port 15004]       # Stand-alone egress proxy

#[cfg(not(unix))]
compile_error!("agentcell requires a Unix host (process groups, signals).");

mod agent;
mod config;
mod error;
mod grpc_server;
mod manager;
mod pip;
mod proxy;
mod state;
mod token;

use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::token::TokenService;

#[derive(Parser, Debug)]
#[command(name = "agentcell")]
#[command(about = "Session-scoped code-execution sandboxes with token-gated egress")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the sandbox manager and gRPC front-end
    Serve {
        /// gRPC port; overrides GRPC_PORT
        #[arg(long)]
        grpc_port: Option<u16>,

        /// Run the egress proxy inside this process, sharing the
        /// manager's signing secret
        #[arg(long)]
        with_proxy: bool,
    },

    /// Run the in-sandbox execution agent (PID 1 inside a sandbox)
    Agent {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:2024")]
        addr: String,
    },

    /// Run the egress proxy stand-alone (requires SIGNING_KEY)
    Proxy {
        /// Port to listen on; overrides PROXY_PORT
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    match args.command {
        Commands::Serve {
            grpc_port,
            with_proxy,
        } => {
            let mut config = Config::from_env();
            if let Some(port) = grpc_port {
                config.grpc_port = port;
            }
            serve(config, with_proxy).await
        }
        Commands::Agent { addr } => {
            agent::run_server(&addr, agent::AgentConfig::default()).await
        }
        Commands::Proxy { port } => {
            let config = Config::from_env();
            let key = config
                .signing_key
                .ok_or_else(|| anyhow::anyhow!("SIGNING_KEY is required to run the proxy stand-alone"))?;
            let port = port.unwrap_or(config.proxy_port);
            let tokens = Arc::new(TokenService::new(&key));
            proxy::run_server(&format!("0.0.0.0:{port}"), tokens).await
        }
    }
}

async fn serve(config: Config, with_proxy: bool) -> anyhow::Result<()> {
    let grpc_port = config.grpc_port;
    let proxy_port = config.proxy_port;

    let manager = Arc::new(manager::SandboxManager::new(config)?);
    manager.start().await;

    if with_proxy {
        let tokens = manager.token_service();
        let addr = format!("0.0.0.0:{proxy_port}");
        tokio::spawn(async move {
            if let Err(e) = proxy::run_server(&addr, tokens).await {
                eprintln!("egress proxy exited: {e}");
            }
        });
    }

    let server = {
        let manager = manager.clone();
        tokio::spawn(async move { grpc_server::run_server(grpc_port, manager).await })
    };

    tokio::select! {
        result = server => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }

    manager.shutdown().await;
    Ok(())
}
