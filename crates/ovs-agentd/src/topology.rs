//! Bridge topology: integration, tunnel, physical and secondary bridges.
//!
//! Setup runs once at startup through `&mut self`; afterwards the topology
//! is shared behind an `Arc` and only read, so the heartbeat task and the
//! reconciliation loop can both enumerate ports without locking.

use ovs_types::{MacAddress, OfPort};
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::bridge::{Bridge, BridgeProvider};
use crate::error::{AgentError, AgentResult};
use crate::flow::{Flow, FlowAction, FlowMatch};
use crate::link::LinkLayer;
use crate::port_diff::PortRecord;
use crate::rpc::TunnelEndpoint;

/// Prefix of the veth end attached to the integration bridge.
pub const INT_VETH_PREFIX: &str = "int-";

/// Prefix of the veth end attached to a physical bridge.
pub const PHYS_VETH_PREFIX: &str = "phy-";

/// Prefix of GRE tunnel port names.
pub const TUNNEL_PORT_PREFIX: &str = "gre-";

/// Wiring of one physical network.
#[derive(Clone)]
pub struct PhysicalBridge {
    pub bridge: Arc<dyn Bridge>,
    /// Port of the veth on the integration bridge.
    pub int_ofport: u32,
    /// Port of the veth on the physical bridge.
    pub phys_ofport: u32,
}

/// Tunnel bridge state, present only when tunneling is enabled.
#[derive(Clone)]
pub struct TunnelBridge {
    pub bridge: Arc<dyn Bridge>,
    /// Patch port on the tunnel bridge leading to the integration bridge.
    pub patch_int_ofport: u32,
    /// Patch port on the integration bridge leading to the tunnel bridge.
    pub patch_tun_ofport: u32,
    pub local_ip: IpAddr,
}

/// Bridge wiring owned by the agent.
pub struct BridgeTopology {
    provider: Arc<dyn BridgeProvider>,
    link: Arc<dyn LinkLayer>,
    int_br: Arc<dyn Bridge>,
    tunnel: Option<TunnelBridge>,
    physical: BTreeMap<String, PhysicalBridge>,
    bridge_mappings: BTreeMap<String, String>,
    domu_br: Option<Arc<dyn Bridge>>,
    /// Valid until restart.
    domu_macs: OnceCell<HashSet<MacAddress>>,
}

impl BridgeTopology {
    pub fn new(
        provider: Arc<dyn BridgeProvider>,
        link: Arc<dyn LinkLayer>,
        integration_bridge: &str,
    ) -> Self {
        let int_br = provider.bridge(integration_bridge);
        Self {
            provider,
            link,
            int_br,
            tunnel: None,
            physical: BTreeMap::new(),
            bridge_mappings: BTreeMap::new(),
            domu_br: None,
            domu_macs: OnceCell::new(),
        }
    }

    pub fn int_br(&self) -> &Arc<dyn Bridge> {
        &self.int_br
    }

    pub fn tunnel(&self) -> Option<&TunnelBridge> {
        self.tunnel.as_ref()
    }

    pub fn physical(&self, physical_network: &str) -> Option<&PhysicalBridge> {
        self.physical.get(physical_network)
    }

    pub fn bridge_mappings(&self) -> &BTreeMap<String, String> {
        &self.bridge_mappings
    }

    pub fn domu_br(&self) -> Option<&Arc<dyn Bridge>> {
        self.domu_br.as_ref()
    }

    /// Bridge a VIF was observed on.
    pub fn bridge_by_name(&self, name: &str) -> Option<&Arc<dyn Bridge>> {
        if self.int_br.name() == name {
            return Some(&self.int_br);
        }
        self.domu_br.as_ref().filter(|br| br.name() == name)
    }

    /// Resets the integration bridge to plain L2 forwarding.
    #[instrument(skip(self))]
    pub async fn setup_integration_br(&self, int_peer_patch_port: &str) -> AgentResult<()> {
        self.int_br.ensure_bridge().await?;
        self.int_br.delete_port(int_peer_patch_port).await?;
        self.int_br.remove_all_flows().await?;
        self.int_br
            .add_flow(&Flow::new(1, FlowMatch::new(), vec![FlowAction::Normal]))
            .await?;
        info!(bridge = %self.int_br.name(), "Integration bridge ready");
        Ok(())
    }

    /// Recreates the tunnel bridge and patches it to the integration bridge.
    ///
    /// # Errors
    ///
    /// [`AgentError::Topology`] if either patch port fails to attach.
    #[instrument(skip(self))]
    pub async fn setup_tunnel_br(
        &mut self,
        tunnel_bridge: &str,
        int_peer_patch_port: &str,
        tun_peer_patch_port: &str,
        local_ip: IpAddr,
    ) -> AgentResult<()> {
        let tun_br = self.provider.bridge(tunnel_bridge);
        tun_br.reset_bridge().await?;

        let patch_tun = self
            .int_br
            .add_patch_port(int_peer_patch_port, tun_peer_patch_port)
            .await?;
        let patch_int = tun_br
            .add_patch_port(tun_peer_patch_port, int_peer_patch_port)
            .await?;

        let (Some(patch_tun_ofport), Some(patch_int_ofport)) =
            (patch_tun.number(), patch_int.number())
        else {
            return Err(AgentError::topology(
                tunnel_bridge,
                format!(
                    "patch ports failed to attach ({}={}, {}={}); is GRE tunneling supported by this Open vSwitch?",
                    int_peer_patch_port, patch_tun, tun_peer_patch_port, patch_int
                ),
            ));
        };

        tun_br.remove_all_flows().await?;
        tun_br
            .add_flow(&Flow::new(1, FlowMatch::new(), vec![FlowAction::Drop]))
            .await?;

        info!(
            bridge = tunnel_bridge,
            patch_int_ofport, patch_tun_ofport, "Tunnel bridge ready"
        );
        self.tunnel = Some(TunnelBridge {
            bridge: tun_br,
            patch_int_ofport,
            patch_tun_ofport,
            local_ip,
        });
        Ok(())
    }

    /// Wires every physical network's bridge to the integration bridge.
    ///
    /// # Errors
    ///
    /// [`AgentError::Topology`] when a mapped bridge does not exist or a
    /// veth end fails to attach.
    #[instrument(skip(self, mappings))]
    pub async fn setup_physical_bridges(
        &mut self,
        mappings: &BTreeMap<String, String>,
    ) -> AgentResult<()> {
        for (physical_network, bridge_name) in mappings {
            let wiring = self.wire_physical_bridge(physical_network, bridge_name).await?;
            self.physical.insert(physical_network.clone(), wiring);
            self.bridge_mappings
                .insert(physical_network.clone(), bridge_name.clone());
        }
        Ok(())
    }

    async fn wire_physical_bridge(
        &self,
        physical_network: &str,
        bridge_name: &str,
    ) -> AgentResult<PhysicalBridge> {
        info!(physical_network, bridge = bridge_name, "Mapping physical network");

        if !self.link.device_exists(bridge_name).await? {
            return Err(AgentError::topology(
                bridge_name,
                format!("bridge for physical network {} does not exist", physical_network),
            ));
        }

        let br = self.provider.bridge(bridge_name);
        br.remove_all_flows().await?;
        br.add_flow(&Flow::new(1, FlowMatch::new(), vec![FlowAction::Normal]))
            .await?;

        let int_veth = format!("{}{}", INT_VETH_PREFIX, bridge_name);
        let phys_veth = format!("{}{}", PHYS_VETH_PREFIX, bridge_name);

        let int_present = self.link.device_exists(&int_veth).await?;
        let phys_present = self.link.device_exists(&phys_veth).await?;
        if int_present && phys_present {
            debug!(int_veth = %int_veth, phys_veth = %phys_veth, "Reusing veth pair");
        } else {
            self.int_br.delete_port(&int_veth).await?;
            br.delete_port(&phys_veth).await?;
            if int_present {
                self.link.delete_link(&int_veth).await?;
            }
            if phys_present {
                self.link.delete_link(&phys_veth).await?;
            }
            self.link.add_veth(&int_veth, &phys_veth).await?;
        }

        let int_ofport = attached(self.int_br.add_port(&int_veth).await?, &int_veth)?;
        let phys_ofport = attached(br.add_port(&phys_veth).await?, &phys_veth)?;

        // Nothing crosses the pair until a network is provisioned on it.
        self.int_br
            .add_flow(&Flow::new(
                2,
                FlowMatch::new().in_port(int_ofport),
                vec![FlowAction::Drop],
            ))
            .await?;
        br.add_flow(&Flow::new(
            2,
            FlowMatch::new().in_port(phys_ofport),
            vec![FlowAction::Drop],
        ))
        .await?;

        self.link.set_up(&int_veth).await?;
        self.link.set_up(&phys_veth).await?;

        Ok(PhysicalBridge {
            bridge: br,
            int_ofport,
            phys_ofport,
        })
    }

    /// Registers the secondary integration bridge, if one is configured.
    pub fn setup_domu_integration_br(&mut self, name: Option<&str>) -> Option<Arc<dyn Bridge>> {
        let name = name.map(str::trim).filter(|n| !n.is_empty())?;
        let br = self.provider.bridge(name);
        info!(bridge = name, "Managing secondary integration bridge");
        self.domu_br = Some(br.clone());
        Some(br)
    }

    /// MACs of the ports on the secondary bridge.
    ///
    /// Enumerated once; a failed enumeration is not cached and is retried on
    /// the next call. `None` when no secondary bridge is configured or the
    /// enumeration failed.
    pub async fn get_domu_mac_addresses(&self) -> Option<HashSet<MacAddress>> {
        let domu_br = self.domu_br.as_ref()?;
        match self
            .domu_macs
            .get_or_try_init(|| domu_br.get_port_macs())
            .await
        {
            Ok(macs) => Some(macs.clone()),
            Err(e) => {
                warn!(bridge = %domu_br.name(), error = %e, "Failed to read secondary bridge MACs");
                None
            }
        }
    }

    /// VIFs across the integration bridge and the secondary bridge.
    ///
    /// A VIF whose MAC belongs to a secondary-bridge port is reported once,
    /// under the secondary bridge.
    pub async fn get_all_ports_set(&self) -> AgentResult<HashSet<PortRecord>> {
        let domu_macs = self.get_domu_mac_addresses().await;

        let mut ports: HashSet<PortRecord> = self
            .int_br
            .get_vif_ports()
            .await?
            .into_iter()
            .filter(|vif| match (&domu_macs, vif.vif_mac) {
                (Some(macs), Some(mac)) => !macs.contains(&mac),
                _ => true,
            })
            .map(|vif| PortRecord::from(&vif))
            .collect();

        if let Some(domu_br) = &self.domu_br {
            ports.extend(domu_br.get_vif_port_set().await?);
        }

        Ok(ports)
    }

    /// Adds a GRE port towards a remote endpoint. Returns false when the
    /// endpoint is this host or tunneling is disabled.
    #[instrument(skip(self))]
    pub async fn add_tunnel_port(&self, endpoint: &TunnelEndpoint) -> AgentResult<bool> {
        let Some(tunnel) = &self.tunnel else {
            debug!("Tunneling disabled, ignoring tunnel endpoint");
            return Ok(false);
        };
        if endpoint.ip_address == tunnel.local_ip {
            return Ok(false);
        }
        let port_name = format!("{}{}", TUNNEL_PORT_PREFIX, endpoint.id);
        let ofport = tunnel
            .bridge
            .add_tunnel_port(&port_name, endpoint.ip_address, tunnel.local_ip)
            .await?;
        if !ofport.is_attached() {
            warn!(port = %port_name, remote_ip = %endpoint.ip_address, "Tunnel port not attached");
        }
        Ok(true)
    }
}

fn attached(ofport: OfPort, port_name: &str) -> AgentResult<u32> {
    ofport
        .number()
        .ok_or_else(|| AgentError::topology(port_name, "port failed to attach"))
}
