//! ovs-agentd - Open vSwitch L2 agent
//!
//! Entry point for the ovs-agentd daemon.

use anyhow::Context;
use clap::Parser;
use std::net::IpAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use ovs_agentd::config::DEFAULT_CONFIG_PATH;
use ovs_agentd::{Agent, AgentConfig, HttpPluginClient, IpLink, OvsBridgeProvider};

/// Open vSwitch L2 agent
#[derive(Parser, Debug)]
#[command(name = "ovs-agentd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config_file: String,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Seconds between bridge polls
    #[arg(long)]
    polling_interval: Option<u64>,

    /// Seconds between state reports, 0 disables them
    #[arg(long)]
    report_interval: Option<u64>,

    /// Integration bridge name
    #[arg(long)]
    integration_bridge: Option<String>,

    /// Enable GRE tunneling
    #[arg(long)]
    enable_tunneling: bool,

    /// Local tunnel endpoint address
    #[arg(long)]
    local_ip: Option<IpAddr>,
}

impl Args {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(level) = &self.log_level {
            config.agent.log_level = level.clone();
        }
        if let Some(secs) = self.polling_interval {
            config.agent.polling_interval_secs = secs;
        }
        if let Some(secs) = self.report_interval {
            config.agent.report_interval_secs = secs;
        }
        if let Some(bridge) = &self.integration_bridge {
            config.ovs.integration_bridge = bridge.clone();
        }
        if self.enable_tunneling {
            config.ovs.enable_tunneling = true;
        }
        if self.local_ip.is_some() {
            config.ovs.local_ip = self.local_ip;
        }
    }
}

/// Initializes tracing/logging subsystem
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let root_helper = config.agent.root_helper.clone();
    let rpc = Arc::new(
        HttpPluginClient::new(config.control_plane.url.clone(), config.rpc_timeout())
            .context("failed to build control plane client")?,
    );

    let agent = Agent::bootstrap(
        &config,
        Arc::new(OvsBridgeProvider::new(root_helper.clone())),
        Arc::new(IpLink::new(root_helper)),
        rpc,
    )
    .await
    .context("agent startup failed")?;

    info!(agent_id = %agent.agent_id, "Agent initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // No notification producer is attached; port changes are picked up by polling.
    let (_notifications_tx, notifications_rx) = mpsc::channel(64);

    let reporter_handle = tokio::spawn(
        agent
            .reporter
            .run(config.report_interval(), shutdown_rx.clone()),
    );
    let mut loop_handle = tokio::spawn(agent.reconciliation.run(notifications_rx, shutdown_rx));

    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            None
        }
        result = &mut loop_handle => Some(result),
    };

    if shutdown_tx.send(true).is_err() {
        debug!("All tasks already stopped");
    }
    let result = match finished {
        Some(result) => result,
        None => loop_handle.await,
    };
    if let Err(e) = result {
        error!(error = %e, "Reconciliation task failed");
    }
    if let Err(e) = reporter_handle.await {
        error!(error = %e, "State reporter task failed");
    }

    info!("ovs-agentd stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match AgentConfig::load_or_default(&args.config_file) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ovs-agentd: {}", e);
            return ExitCode::FAILURE;
        }
    };
    args.apply(&mut config);

    init_logging(&config.agent.log_level);
    info!("--- Starting ovs-agentd ---");

    if let Err(e) = run(config).await {
        error!("ovs-agentd terminated: {:#}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
