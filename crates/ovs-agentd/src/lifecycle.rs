//! Per-VIF bind / dead / unbind transitions.
//!
//! ```text
//! Unbound --bind--> Bound(vlan) --unbind--> Unbound
//! Unbound --mark_dead--> Dead --physical removal--> Unbound
//! ```
//!
//! A bound VIF that has to be marked dead, or moved to another network, is
//! unbound first. Provisioning flows for a network are installed when its
//! local VLAN is created and removed when it is reclaimed.

use ovs_agent_common::OvsError;
use ovs_types::{MacAddress, NetworkType, VlanId, DEAD_VLAN_TAG, UNTAGGED_VLAN};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::bridge::{Bridge, VifPort};
use crate::error::{AgentError, AgentResult};
use crate::flow::{Flow, FlowAction, FlowMatch};
use crate::rpc::PluginRpc;
use crate::topology::BridgeTopology;
use crate::vlan_allocator::{LocalVlanMapping, VlanAllocator};

/// Where a network lives outside the integration bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSegment {
    pub network_id: String,
    pub network_type: NetworkType,
    pub physical_network: Option<String>,
    pub segmentation_id: Option<u32>,
}

/// Binding state of a VIF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Unbound,
    Bound(VlanId),
    Dead,
}

/// Applies VIF transitions to the switch and the VLAN table.
pub struct PortLifecycle {
    allocator: VlanAllocator,
    topology: Arc<BridgeTopology>,
    rpc: Arc<dyn PluginRpc>,
    agent_id: String,
    states: HashMap<String, BindingState>,
}

impl PortLifecycle {
    pub fn new(
        allocator: VlanAllocator,
        topology: Arc<BridgeTopology>,
        rpc: Arc<dyn PluginRpc>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            allocator,
            topology,
            rpc,
            agent_id: agent_id.into(),
            states: HashMap::new(),
        }
    }

    pub fn allocator(&self) -> &VlanAllocator {
        &self.allocator
    }

    pub fn topology(&self) -> &Arc<BridgeTopology> {
        &self.topology
    }

    pub fn state(&self, vif_id: &str) -> BindingState {
        self.states
            .get(vif_id)
            .copied()
            .unwrap_or(BindingState::Unbound)
    }

    fn bridge_of(&self, port: &VifPort) -> AgentResult<Arc<dyn Bridge>> {
        self.topology
            .bridge_by_name(&port.bridge)
            .cloned()
            .ok_or_else(|| {
                AgentError::from(OvsError::internal(format!(
                    "VIF {} is on unmanaged bridge {}",
                    port.vif_id, port.bridge
                )))
            })
    }

    /// Tags `port` with the local VLAN of `segment`, creating and
    /// provisioning the network first if this host has not seen it.
    ///
    /// Stale flows for the port's OpenFlow number are purged when the port
    /// is attached.
    #[instrument(skip(self, port), fields(vif = %port.vif_id, port = %port.port_name))]
    pub async fn bind(&mut self, port: &VifPort, segment: &NetworkSegment) -> AgentResult<VlanId> {
        let bridge = self.bridge_of(port)?;

        if let Some(previous) = self.allocator.network_of_vif(&port.vif_id) {
            if previous != segment.network_id {
                let previous = previous.to_string();
                info!(from = %previous, to = %segment.network_id, "VIF moved to another network");
                self.unbind(&port.vif_id, &previous).await?;
            }
        }

        let is_new = self.allocator.get(&segment.network_id).is_none();
        let vlan = self.allocator.allocate(
            &segment.network_id,
            segment.network_type,
            segment.physical_network.as_deref(),
            segment.segmentation_id,
        )?;
        if is_new {
            if let Err(e) = self.provision_local_vlan(segment, vlan).await {
                if let Some(mapping) = self.allocator.reclaim(&segment.network_id) {
                    self.reclaim_flows(&mapping).await;
                }
                return Err(e);
            }
        }
        self.allocator.bind_vif(&segment.network_id, port.clone());

        if segment.network_type.is_tunnel() {
            if let (Some(tunnel), Some(seg), Some(mac)) = (
                self.topology.tunnel(),
                segment.segmentation_id,
                port.vif_mac,
            ) {
                tunnel
                    .bridge
                    .add_flow(&Flow::new(
                        3,
                        FlowMatch::new().tun_id(seg).dl_dst(mac),
                        vec![FlowAction::ModVlanVid(vlan.as_u16()), FlowAction::Normal],
                    ))
                    .await?;
            }
        }

        bridge.set_port_tag(&port.port_name, vlan.as_u16()).await?;
        if let Some(ofport) = port.ofport.number() {
            bridge
                .delete_flows(&FlowMatch::new().in_port(ofport))
                .await?;
        }

        self.states
            .insert(port.vif_id.clone(), BindingState::Bound(vlan));
        info!(
            network_id = %segment.network_id,
            vlan = vlan.as_u16(),
            ofport = %port.ofport,
            "Port bound"
        );
        Ok(vlan)
    }

    /// Isolates a VIF whose network could not be resolved.
    #[instrument(skip(self, port), fields(vif = %port.vif_id, port = %port.port_name))]
    pub async fn mark_dead(&mut self, port: &VifPort) -> AgentResult<()> {
        if let Some(network_id) = self.allocator.network_of_vif(&port.vif_id) {
            let network_id = network_id.to_string();
            self.unbind(&port.vif_id, &network_id).await?;
        }

        let bridge = self.bridge_of(port)?;
        if bridge.get_port_tag(&port.port_name).await? == Some(DEAD_VLAN_TAG) {
            debug!("Port already dead");
            self.states.insert(port.vif_id.clone(), BindingState::Dead);
            return Ok(());
        }

        bridge.set_port_tag(&port.port_name, DEAD_VLAN_TAG).await?;
        if let Some(ofport) = port.ofport.number() {
            bridge
                .add_flow(&Flow::new(
                    2,
                    FlowMatch::new().in_port(ofport),
                    vec![FlowAction::Drop],
                ))
                .await?;
        }

        self.states.insert(port.vif_id.clone(), BindingState::Dead);
        info!(ofport = %port.ofport, "Port marked dead");
        Ok(())
    }

    /// Removes `vif_id` from `network_id`, reclaiming the network when it was
    /// the last VIF. Returns true if the network was reclaimed.
    ///
    /// Unknown networks and non-member VIFs are ignored.
    #[instrument(skip(self))]
    pub async fn unbind(&mut self, vif_id: &str, network_id: &str) -> AgentResult<bool> {
        let Some(mapping) = self.allocator.get(network_id) else {
            debug!("No local VLAN for network, ignoring unbind");
            return Ok(false);
        };
        let Some(port) = mapping.vif_ports().get(vif_id) else {
            debug!("VIF not bound to network, ignoring unbind");
            return Ok(false);
        };
        let mapping = mapping.clone();
        let vif_mac = port.vif_mac;

        if mapping.network_type().is_tunnel() {
            self.delete_unicast_flow(&mapping, vif_mac).await?;
        }

        let reclaimed = self.allocator.unbind_vif(network_id, vif_id);
        self.states.remove(vif_id);
        if reclaimed {
            self.reclaim_flows(&mapping).await;
        }
        info!(reclaimed, "Port unbound");
        Ok(reclaimed)
    }

    /// Forgets a VIF that disappeared from the switch.
    pub async fn unbind_device(&mut self, vif_id: &str) -> AgentResult<bool> {
        if self.state(vif_id) == BindingState::Dead {
            self.states.remove(vif_id);
            debug!(vif = vif_id, "Dead port removed");
            return Ok(false);
        }
        match self.allocator.network_of_vif(vif_id) {
            Some(network_id) => {
                let network_id = network_id.to_string();
                self.unbind(vif_id, &network_id).await
            }
            None => {
                debug!(vif = vif_id, "Removed port was not bound");
                Ok(false)
            }
        }
    }

    /// Reclaims a network deleted by the control plane, whatever its VIFs.
    /// Returns false if this host had no local VLAN for it.
    #[instrument(skip(self))]
    pub async fn reclaim_network(&mut self, network_id: &str) -> AgentResult<bool> {
        let Some(mapping) = self.allocator.reclaim(network_id) else {
            debug!("Network not provisioned locally");
            return Ok(false);
        };
        for vif_id in mapping.vif_ports().keys() {
            self.states.remove(vif_id);
        }
        self.reclaim_flows(&mapping).await;
        Ok(true)
    }

    /// Re-binds a VIF after a remote change and reports its admin state.
    ///
    /// The port is tagged in both cases; `admin_state_up` only selects the
    /// up or down notification.
    #[instrument(skip(self, port), fields(vif = %port.vif_id))]
    pub async fn update(
        &mut self,
        port: &VifPort,
        segment: &NetworkSegment,
        admin_state_up: bool,
    ) -> AgentResult<VlanId> {
        let vlan = self.bind(port, segment).await?;

        let notified = if admin_state_up {
            self.rpc.update_device_up(&port.vif_id, &self.agent_id).await
        } else {
            self.rpc
                .update_device_down(&port.vif_id, &self.agent_id)
                .await
                .map(|_| ())
        };
        if let Err(e) = notified {
            error!(admin_state_up, error = %e, "Failed to report port state");
        }
        Ok(vlan)
    }

    async fn provision_local_vlan(&self, segment: &NetworkSegment, vlan: VlanId) -> AgentResult<()> {
        let lvid = vlan.as_u16();
        match segment.network_type {
            NetworkType::Gre => {
                let (Some(tunnel), Some(seg)) = (self.topology.tunnel(), segment.segmentation_id)
                else {
                    error!(
                        network_id = %segment.network_id,
                        "Cannot provision GRE network: tunneling disabled"
                    );
                    return Ok(());
                };
                tunnel
                    .bridge
                    .add_flow(&Flow::new(
                        4,
                        FlowMatch::new()
                            .in_port(tunnel.patch_int_ofport)
                            .dl_vlan(lvid),
                        vec![FlowAction::SetTunnel(seg), FlowAction::Normal],
                    ))
                    .await?;
                tunnel
                    .bridge
                    .add_flow(&Flow::new(
                        3,
                        FlowMatch::new().tun_id(seg).dl_dst_masked(
                            MacAddress::MULTICAST_MASK,
                            MacAddress::MULTICAST_MASK,
                        ),
                        vec![
                            FlowAction::ModVlanVid(lvid),
                            FlowAction::Output(tunnel.patch_int_ofport),
                        ],
                    ))
                    .await?;
            }
            NetworkType::Flat | NetworkType::Vlan => {
                let Some(phys) = segment
                    .physical_network
                    .as_deref()
                    .and_then(|p| self.topology.physical(p))
                else {
                    error!(
                        network_id = %segment.network_id,
                        physical_network = ?segment.physical_network,
                        "Cannot provision network: physical network not mapped"
                    );
                    return Ok(());
                };
                let (outbound, inbound_vlan) = match segment.network_type {
                    NetworkType::Flat => (FlowAction::StripVlan, UNTAGGED_VLAN),
                    _ => {
                        let Some(seg) = segment.segmentation_id.and_then(|s| u16::try_from(s).ok())
                        else {
                            error!(
                                network_id = %segment.network_id,
                                segmentation_id = ?segment.segmentation_id,
                                "Cannot provision VLAN network: invalid segmentation id"
                            );
                            return Ok(());
                        };
                        (FlowAction::ModVlanVid(seg), seg)
                    }
                };
                phys.bridge
                    .add_flow(&Flow::new(
                        4,
                        FlowMatch::new().in_port(phys.phys_ofport).dl_vlan(lvid),
                        vec![outbound, FlowAction::Normal],
                    ))
                    .await?;
                self.topology
                    .int_br()
                    .add_flow(&Flow::new(
                        3,
                        FlowMatch::new().in_port(phys.int_ofport).dl_vlan(inbound_vlan),
                        vec![FlowAction::ModVlanVid(lvid), FlowAction::Normal],
                    ))
                    .await?;
            }
            NetworkType::Local => {}
        }
        info!(
            network_id = %segment.network_id,
            network_type = %segment.network_type,
            vlan = lvid,
            "Provisioned local VLAN"
        );
        Ok(())
    }

    /// Deletes the provisioning flows of a reclaimed network.
    ///
    /// The VLAN is already back in the pool, so failures are only logged.
    async fn reclaim_flows(&self, mapping: &LocalVlanMapping) {
        let lvid = mapping.vlan().as_u16();
        let mut deletions: Vec<(Arc<dyn Bridge>, FlowMatch)> = Vec::new();

        match mapping.network_type() {
            NetworkType::Gre => {
                if let (Some(tunnel), Some(seg)) = (self.topology.tunnel(), mapping.segmentation_id())
                {
                    deletions.push((tunnel.bridge.clone(), FlowMatch::new().tun_id(seg)));
                    deletions.push((
                        tunnel.bridge.clone(),
                        FlowMatch::new()
                            .in_port(tunnel.patch_int_ofport)
                            .dl_vlan(lvid),
                    ));
                }
            }
            NetworkType::Flat | NetworkType::Vlan => {
                if let Some(phys) = mapping
                    .physical_network()
                    .and_then(|p| self.topology.physical(p))
                {
                    let inbound_vlan = match mapping.network_type() {
                        NetworkType::Flat => Some(UNTAGGED_VLAN),
                        _ => mapping.segmentation_id().and_then(|s| u16::try_from(s).ok()),
                    };
                    deletions.push((
                        phys.bridge.clone(),
                        FlowMatch::new().in_port(phys.phys_ofport).dl_vlan(lvid),
                    ));
                    if let Some(inbound_vlan) = inbound_vlan {
                        deletions.push((
                            self.topology.int_br().clone(),
                            FlowMatch::new().in_port(phys.int_ofport).dl_vlan(inbound_vlan),
                        ));
                    }
                }
            }
            NetworkType::Local => {}
        }

        for (bridge, matches) in deletions {
            if let Err(e) = bridge.delete_flows(&matches).await {
                warn!(bridge = %bridge.name(), flows = %matches, error = %e, "Failed to delete flows");
            }
        }
    }

    async fn delete_unicast_flow(
        &self,
        mapping: &LocalVlanMapping,
        vif_mac: Option<MacAddress>,
    ) -> AgentResult<()> {
        if let (Some(tunnel), Some(seg), Some(mac)) =
            (self.topology.tunnel(), mapping.segmentation_id(), vif_mac)
        {
            tunnel
                .bridge
                .delete_flows(&FlowMatch::new().tun_id(seg).dl_dst(mac))
                .await?;
        }
        Ok(())
    }
}
