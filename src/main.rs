//! fj-agent
//!
//! Bus-connected agent that runs short-lived workers on demand and streams
//! their output. Configuration comes from `FJ_AGENT_CONFIG` / `FJ_AGENT_*`
//! environment variables.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fj_agent::bus::{self, Bus, MemoryBus};
use fj_agent::config::Config;
use fj_agent::executor::ProcessExecutor;
use fj_agent::{agent, subject};

#[derive(Parser, Debug)]
#[command(name = "fj-agent")]
#[command(about = "Bus-connected worker agent")]
struct Args {
    /// Run against an in-process bus (no broker required)
    #[arg(long)]
    loopback: bool,

    /// Override the agent id from the configuration
    #[arg(long)]
    agent_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(agent_id) = args.agent_id {
        config.agent_id = agent_id;
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    // A failed connect before the agent serves is fatal to startup; the
    // poll interval is fixed, it does not back off.
    let bus: Arc<dyn Bus> = if args.loopback {
        bus::connect_with_retry(
            || async { Ok(Arc::new(MemoryBus::new()) as Arc<dyn Bus>) },
            config.connect_interval(),
            &cancel,
        )
        .await?
    } else {
        // Remote transports are deployment-specific; this binary ships
        // with the in-process bus only.
        anyhow::bail!(
            "no transport for '{}'; only --loopback is currently supported",
            config.bus_url
        );
    };

    info!(
        agent = %config.agent_id,
        control = %subject::message_reply(&config.agent_id, &bus.instance_id()),
        "Connected to bus"
    );

    agent::run(&config, bus, Arc::new(ProcessExecutor::new()), cancel).await
}
