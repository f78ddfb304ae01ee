//! Periodic agent heartbeat.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::AgentResult;
use crate::rpc::{AgentConfigurations, AgentState, PluginRpc};
use crate::topology::BridgeTopology;

/// Binary name reported to the control plane.
pub const AGENT_BINARY: &str = "ovs-agentd";

/// Agent type reported to the control plane.
pub const AGENT_TYPE: &str = "Open vSwitch agent";

/// Reports the number of observed VIFs to the control plane.
///
/// Only reads the topology, so it runs beside the reconciliation loop
/// without sharing the VLAN table.
pub struct AgentStateReporter {
    rpc: Arc<dyn PluginRpc>,
    topology: Arc<BridgeTopology>,
    state: AgentState,
}

impl AgentStateReporter {
    pub fn new(rpc: Arc<dyn PluginRpc>, topology: Arc<BridgeTopology>, host: impl Into<String>) -> Self {
        let state = AgentState {
            binary: AGENT_BINARY.to_string(),
            host: host.into(),
            topic: "N/A".to_string(),
            agent_type: AGENT_TYPE.to_string(),
            configurations: AgentConfigurations {
                bridge_mappings: topology.bridge_mappings().clone(),
                devices: 0,
            },
            start_flag: Some(true),
        };
        Self {
            rpc,
            topology,
            state,
        }
    }

    /// Payload of the next report.
    pub fn state(&self) -> &AgentState {
        &self.state
    }

    /// Sends one report and returns the device count it carried.
    ///
    /// The start flag is dropped after the first accepted report; a failed
    /// report keeps it for the next attempt.
    pub async fn report_once(&mut self) -> AgentResult<usize> {
        let devices = self.topology.get_all_ports_set().await?.len();
        self.state.configurations.devices = devices;
        self.rpc.report_state(&self.state).await?;
        if self.state.start_flag.take().is_some() {
            info!(devices, "First state report accepted");
        }
        Ok(devices)
    }

    /// Reports every `interval` until shutdown. Returns immediately when
    /// reporting is disabled.
    pub async fn run(mut self, interval: Option<Duration>, mut shutdown: watch::Receiver<bool>) {
        let Some(interval) = interval else {
            info!("State reporting disabled");
            return;
        };

        info!(
            host = %self.state.host,
            interval_secs = interval.as_secs(),
            "Starting state reporter"
        );

        let mut consecutive_failures = 0u32;
        let mut interval_timer = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = interval_timer.tick() => {
                    match self.report_once().await {
                        Ok(devices) => {
                            consecutive_failures = 0;
                            debug!(devices, "State reported");
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            if consecutive_failures <= 3 {
                                warn!(error = %e, consecutive_failures, "Failed reporting state");
                            } else {
                                error!(error = %e, consecutive_failures, "Failed reporting state repeatedly");
                            }
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("State reporter shutting down");
                        break;
                    }
                }
            }
        }
    }
}
