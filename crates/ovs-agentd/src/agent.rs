//! Agent wiring and the poll / diff / reconcile loop.
//!
//! One cycle runs to completion before the next one or any notification is
//! handled, so the VLAN table is only ever touched from this loop.

use ovs_types::MacAddress;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::bridge::BridgeProvider;
use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};
use crate::lifecycle::{NetworkSegment, PortLifecycle};
use crate::link::LinkLayer;
use crate::port_diff::{self, PortDiff, PortRecord};
use crate::reconciler::DeviceReconciler;
use crate::rpc::{PluginRpc, TunnelEndpoint};
use crate::state_report::AgentStateReporter;
use crate::topology::BridgeTopology;
use crate::vlan_allocator::VlanAllocator;

/// Identifier the control plane knows this agent by.
///
/// ```
/// use ovs_agentd::agent::agent_id;
///
/// let mac = "00:11:22:33:44:55".parse().unwrap();
/// assert_eq!(agent_id(&mac), "ovs001122334455");
/// ```
pub fn agent_id(integration_bridge_mac: &MacAddress) -> String {
    format!("ovs{}", integration_bridge_mac.to_hex())
}

/// A port change pushed by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortUpdate {
    pub port_id: String,
    pub segment: NetworkSegment,
    pub admin_state_up: bool,
}

/// Events pushed by the control plane between polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentNotification {
    NetworkDelete { network_id: String },
    PortUpdate(PortUpdate),
    TunnelUpdate(TunnelEndpoint),
}

/// Polls the bridges and reconciles the difference every interval.
pub struct ReconciliationLoop {
    reconciler: DeviceReconciler,
    rpc: Arc<dyn PluginRpc>,
    topology: Arc<BridgeTopology>,
    registered: HashSet<PortRecord>,
    sync: bool,
    tunnel_sync: bool,
    polling_interval: Duration,
}

impl ReconciliationLoop {
    pub fn new(reconciler: DeviceReconciler, rpc: Arc<dyn PluginRpc>, polling_interval: Duration) -> Self {
        let topology = reconciler.lifecycle().topology().clone();
        let tunnel_sync = topology.tunnel().is_some();
        Self {
            reconciler,
            rpc,
            topology,
            registered: HashSet::new(),
            sync: false,
            tunnel_sync,
            polling_interval,
        }
    }

    /// Ports reconciled by the last completed cycle.
    pub fn registered_ports(&self) -> &HashSet<PortRecord> {
        &self.registered
    }

    /// True if the next cycle starts from an empty snapshot.
    pub fn needs_resync(&self) -> bool {
        self.sync
    }

    pub fn reconciler(&self) -> &DeviceReconciler {
        &self.reconciler
    }

    /// Runs one poll / diff / reconcile cycle. Returns true if the next
    /// cycle has to resync.
    pub async fn run_cycle(&mut self) -> bool {
        let start = Instant::now();

        if self.tunnel_sync {
            self.tunnel_sync = self.sync_tunnels().await;
        }

        let current = match self.topology.get_all_ports_set().await {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, "Failed to poll bridge ports");
                self.sync = true;
                return true;
            }
        };

        // A resync re-adds every present port. Registered ports that are
        // gone still have to be reported down.
        let previous = if self.sync {
            info!("Agent out of sync with control plane, resyncing all ports");
            self.sync = false;
            self.registered.difference(&current).cloned().collect()
        } else {
            std::mem::take(&mut self.registered)
        };

        let diff = port_diff::diff(&previous, current);
        match &diff {
            PortDiff::Changed {
                current,
                added,
                removed,
            } => {
                debug!(
                    current = current.len(),
                    added = added.len(),
                    removed = removed.len(),
                    "Port set changed"
                );
                self.sync = self.reconciler.process(&diff).await;
                self.registered = current.clone();
                self.registered
                    .extend(self.reconciler.take_unconfirmed_removals());
            }
            PortDiff::Unchanged => self.registered = previous,
        }

        debug!(
            elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            resync = self.sync,
            "Reconciliation cycle completed"
        );
        self.sync
    }

    /// Applies a control-plane notification.
    pub async fn handle_notification(&mut self, notification: AgentNotification) {
        match notification {
            AgentNotification::NetworkDelete { network_id } => {
                info!(network_id = %network_id, "Network deleted");
                if let Err(e) = self
                    .reconciler
                    .lifecycle_mut()
                    .reclaim_network(&network_id)
                    .await
                {
                    warn!(network_id = %network_id, error = %e, "Failed to reclaim network");
                }
            }
            AgentNotification::PortUpdate(update) => self.port_update(update).await,
            AgentNotification::TunnelUpdate(endpoint) => {
                if let Err(e) = self.topology.add_tunnel_port(&endpoint).await {
                    warn!(remote_ip = %endpoint.ip_address, error = %e, "Failed to add tunnel port");
                    self.tunnel_sync = true;
                }
            }
        }
    }

    #[instrument(skip(self, update), fields(port_id = %update.port_id))]
    async fn port_update(&mut self, update: PortUpdate) {
        let topology = self.topology.clone();
        let mut port = None;
        for bridge in std::iter::once(topology.int_br()).chain(topology.domu_br()) {
            match bridge.get_vif_port_by_id(&update.port_id).await {
                Ok(Some(found)) => {
                    port = Some(found);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(bridge = %bridge.name(), error = %e, "Failed to look up updated port");
                    self.sync = true;
                    return;
                }
            }
        }
        let Some(port) = port else {
            debug!("Updated port is not on this host");
            return;
        };

        match self
            .reconciler
            .lifecycle_mut()
            .update(&port, &update.segment, update.admin_state_up)
            .await
        {
            Ok(_) => {}
            Err(AgentError::PoolExhausted { network_id }) => {
                error!(network_id = %network_id, "No local VLAN left for updated port");
                self.sync = true;
            }
            Err(e) => {
                warn!(error = %e, "Failed to apply port update");
                self.sync = true;
            }
        }
    }

    /// Adds a tunnel port for every known endpoint. Returns true if the
    /// tunnel view is still stale.
    async fn sync_tunnels(&mut self) -> bool {
        let Some(local_ip) = self.topology.tunnel().map(|t| t.local_ip) else {
            return false;
        };
        let endpoints = match self.rpc.tunnel_sync(local_ip).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!(error = %e, "Tunnel sync failed");
                return true;
            }
        };

        let mut stale = false;
        for endpoint in &endpoints {
            if let Err(e) = self.topology.add_tunnel_port(endpoint).await {
                warn!(remote_ip = %endpoint.ip_address, error = %e, "Failed to add tunnel port");
                stale = true;
            }
        }
        info!(endpoints = endpoints.len(), stale, "Tunnel sync completed");
        stale
    }

    /// Runs cycles every polling interval and applies notifications in
    /// between, until shutdown.
    pub async fn run(
        mut self,
        mut notifications: mpsc::Receiver<AgentNotification>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            polling_interval_secs = self.polling_interval.as_secs(),
            "Starting reconciliation loop"
        );

        let mut timer = tokio::time::interval(self.polling_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.run_cycle().await;
                }
                Some(notification) = notifications.recv() => {
                    self.handle_notification(notification).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconciliation loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// A fully wired agent, ready to run.
pub struct Agent {
    pub agent_id: String,
    pub topology: Arc<BridgeTopology>,
    pub reconciliation: ReconciliationLoop,
    pub reporter: AgentStateReporter,
}

impl Agent {
    /// Validates `config`, sets up every bridge and wires the components.
    ///
    /// # Errors
    ///
    /// Any error here leaves the host topology incomplete and must stop the
    /// process.
    pub async fn bootstrap(
        config: &AgentConfig,
        provider: Arc<dyn BridgeProvider>,
        link: Arc<dyn LinkLayer>,
        rpc: Arc<dyn PluginRpc>,
    ) -> AgentResult<Self> {
        config.validate()?;
        let mappings = config.bridge_mappings()?;
        let ovs = &config.ovs;

        let mut topology = BridgeTopology::new(provider, link.clone(), &ovs.integration_bridge);
        topology.setup_integration_br(&ovs.int_peer_patch_port).await?;

        let mac = link
            .interface_mac(&ovs.integration_bridge)
            .await
            .map_err(|e| {
                AgentError::topology(
                    ovs.integration_bridge.as_str(),
                    format!("cannot read MAC address: {}", e),
                )
            })?;
        let agent_id = agent_id(&mac);
        info!(agent_id = %agent_id, "Agent identity");

        topology.setup_physical_bridges(&mappings).await?;

        if ovs.enable_tunneling {
            let local_ip = ovs.local_ip.ok_or_else(|| {
                AgentError::configuration("ovs.local_ip", "tunneling requires local_ip")
            })?;
            topology
                .setup_tunnel_br(
                    &ovs.tunnel_bridge,
                    &ovs.int_peer_patch_port,
                    &ovs.tun_peer_patch_port,
                    local_ip,
                )
                .await?;
        }

        topology.setup_domu_integration_br(ovs.domu_integration_bridge.as_deref());
        let topology = Arc::new(topology);

        let lifecycle = PortLifecycle::new(
            VlanAllocator::new(),
            topology.clone(),
            rpc.clone(),
            agent_id.clone(),
        );
        let reconciler = DeviceReconciler::new(lifecycle, rpc.clone(), agent_id.clone());
        let reconciliation = ReconciliationLoop::new(reconciler, rpc.clone(), config.polling_interval());
        let reporter = AgentStateReporter::new(rpc, topology.clone(), config.control_plane.host.clone());

        Ok(Self {
            agent_id,
            topology,
            reconciliation,
            reporter,
        })
    }
}
