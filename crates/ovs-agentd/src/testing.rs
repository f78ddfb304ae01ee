//! Recording fakes for unit tests.

use async_trait::async_trait;
use ovs_agent_common::{OvsError, OvsResult};
use ovs_types::{MacAddress, NetworkType, OfPort};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use crate::bridge::{Bridge, BridgeProvider, VifPort};
use crate::error::{AgentError, AgentResult};
use crate::flow::{Flow, FlowMatch};
use crate::link::LinkLayer;
use crate::rpc::{AgentState, DeviceDetails, DeviceDownResult, PluginRpc, TunnelEndpoint};

pub(crate) fn vif(bridge: &str, port_name: &str, vif_id: &str, ofport: OfPort, mac: &str) -> VifPort {
    VifPort {
        port_name: port_name.to_string(),
        ofport,
        vif_id: vif_id.to_string(),
        vif_mac: Some(mac.parse().unwrap()),
        bridge: bridge.to_string(),
    }
}

pub(crate) fn known(
    device: &str,
    network_id: &str,
    network_type: NetworkType,
    segmentation_id: Option<u32>,
    physical_network: Option<&str>,
) -> DeviceDetails {
    DeviceDetails::Known {
        device: device.to_string(),
        port_id: device.to_string(),
        network_id: network_id.to_string(),
        network_type,
        segmentation_id,
        physical_network: physical_network.map(str::to_string),
        admin_state_up: true,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BridgeCall {
    SetPortTag { port: String, tag: u16 },
    AddFlow(String),
    DeleteFlows(String),
    RemoveAllFlows,
    AddPort(String),
    DeletePort(String),
    AddPatchPort { local: String, peer: String },
    AddTunnelPort { port: String, remote_ip: IpAddr },
    ResetBridge,
    EnsureBridge,
}

#[derive(Default)]
struct FakeBridgeState {
    vifs: BTreeMap<String, VifPort>,
    port_macs: HashSet<MacAddress>,
    tags: HashMap<String, u16>,
    ofports: HashMap<String, OfPort>,
    next_ofport: u32,
    calls: Vec<BridgeCall>,
    mac_queries: usize,
    fail_listing: bool,
    fail_tagging: bool,
}

pub(crate) struct FakeBridge {
    name: String,
    state: Mutex<FakeBridgeState>,
}

impl FakeBridge {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(FakeBridgeState {
                next_ofport: 1,
                ..Default::default()
            }),
        })
    }

    pub(crate) fn plug(&self, port: VifPort) {
        self.state.lock().vifs.insert(port.vif_id.clone(), port);
    }

    pub(crate) fn unplug(&self, vif_id: &str) {
        self.state.lock().vifs.remove(vif_id);
    }

    pub(crate) fn set_port_macs(&self, macs: &[&str]) {
        self.state.lock().port_macs = macs.iter().map(|m| m.parse().unwrap()).collect();
    }

    pub(crate) fn set_tag(&self, port: &str, tag: u16) {
        self.state.lock().tags.insert(port.to_string(), tag);
    }

    /// Forces the ofport returned when `port` is added.
    pub(crate) fn set_ofport(&self, port: &str, ofport: OfPort) {
        self.state.lock().ofports.insert(port.to_string(), ofport);
    }

    pub(crate) fn fail_listing(&self, fail: bool) {
        self.state.lock().fail_listing = fail;
    }

    /// Makes `set_port_tag` fail the way a non-zero `ovs-vsctl` exit does.
    pub(crate) fn fail_tagging(&self, fail: bool) {
        self.state.lock().fail_tagging = fail;
    }

    pub(crate) fn tag_of(&self, port: &str) -> Option<u16> {
        self.state.lock().tags.get(port).copied()
    }

    pub(crate) fn calls(&self) -> Vec<BridgeCall> {
        self.state.lock().calls.clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub(crate) fn flows_added(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BridgeCall::AddFlow(flow) => Some(flow),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn flows_deleted(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BridgeCall::DeleteFlows(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn mac_queries(&self) -> usize {
        self.state.lock().mac_queries
    }

    fn record(&self, call: BridgeCall) {
        self.state.lock().calls.push(call);
    }

    fn assign_ofport(&self, port: &str) -> OfPort {
        let mut state = self.state.lock();
        if let Some(ofport) = state.ofports.get(port) {
            return *ofport;
        }
        let ofport = OfPort::Attached(state.next_ofport);
        state.next_ofport += 1;
        state.ofports.insert(port.to_string(), ofport);
        ofport
    }
}

#[async_trait]
impl Bridge for FakeBridge {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_vif_ports(&self) -> OvsResult<Vec<VifPort>> {
        let state = self.state.lock();
        if state.fail_listing {
            return Err(OvsError::internal("listing failed"));
        }
        Ok(state.vifs.values().cloned().collect())
    }

    async fn get_vif_port_by_id(&self, vif_id: &str) -> OvsResult<Option<VifPort>> {
        Ok(self.state.lock().vifs.get(vif_id).cloned())
    }

    async fn get_port_macs(&self) -> OvsResult<HashSet<MacAddress>> {
        let mut state = self.state.lock();
        state.mac_queries += 1;
        if state.fail_listing {
            return Err(OvsError::internal("listing failed"));
        }
        Ok(state.port_macs.clone())
    }

    async fn set_port_tag(&self, port_name: &str, tag: u16) -> OvsResult<()> {
        if self.state.lock().fail_tagging {
            return Err(OvsError::ShellCommandFailed {
                command: format!("ovs-vsctl set Port {} tag={}", port_name, tag),
                exit_code: 1,
                output: "database connection failed".to_string(),
            });
        }
        self.set_tag(port_name, tag);
        self.record(BridgeCall::SetPortTag {
            port: port_name.to_string(),
            tag,
        });
        Ok(())
    }

    async fn get_port_tag(&self, port_name: &str) -> OvsResult<Option<u16>> {
        Ok(self.tag_of(port_name))
    }

    async fn add_flow(&self, flow: &Flow) -> OvsResult<()> {
        self.record(BridgeCall::AddFlow(flow.to_string()));
        Ok(())
    }

    async fn delete_flows(&self, matches: &FlowMatch) -> OvsResult<()> {
        self.record(BridgeCall::DeleteFlows(matches.to_string()));
        Ok(())
    }

    async fn remove_all_flows(&self) -> OvsResult<()> {
        self.record(BridgeCall::RemoveAllFlows);
        Ok(())
    }

    async fn add_port(&self, port_name: &str) -> OvsResult<OfPort> {
        self.record(BridgeCall::AddPort(port_name.to_string()));
        Ok(self.assign_ofport(port_name))
    }

    async fn delete_port(&self, port_name: &str) -> OvsResult<()> {
        self.record(BridgeCall::DeletePort(port_name.to_string()));
        Ok(())
    }

    async fn add_patch_port(&self, local_name: &str, peer_name: &str) -> OvsResult<OfPort> {
        self.record(BridgeCall::AddPatchPort {
            local: local_name.to_string(),
            peer: peer_name.to_string(),
        });
        Ok(self.assign_ofport(local_name))
    }

    async fn add_tunnel_port(
        &self,
        port_name: &str,
        remote_ip: IpAddr,
        _local_ip: IpAddr,
    ) -> OvsResult<OfPort> {
        self.record(BridgeCall::AddTunnelPort {
            port: port_name.to_string(),
            remote_ip,
        });
        Ok(self.assign_ofport(port_name))
    }

    async fn reset_bridge(&self) -> OvsResult<()> {
        self.record(BridgeCall::ResetBridge);
        Ok(())
    }

    async fn ensure_bridge(&self) -> OvsResult<()> {
        self.record(BridgeCall::EnsureBridge);
        Ok(())
    }
}

/// Hands out one shared [`FakeBridge`] per name.
#[derive(Default)]
pub(crate) struct FakeProvider {
    bridges: Mutex<HashMap<String, Arc<FakeBridge>>>,
}

impl FakeProvider {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fake(&self, name: &str) -> Arc<FakeBridge> {
        self.bridges
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| FakeBridge::new(name))
            .clone()
    }
}

impl BridgeProvider for FakeProvider {
    fn bridge(&self, name: &str) -> Arc<dyn Bridge> {
        self.fake(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkCall {
    AddVeth(String, String),
    DeleteLink(String),
    SetUp(String),
}

#[derive(Default)]
pub(crate) struct FakeLink {
    devices: Mutex<HashSet<String>>,
    calls: Mutex<Vec<LinkCall>>,
}

impl FakeLink {
    pub(crate) fn with_devices(devices: &[&str]) -> Arc<Self> {
        let link = Self::default();
        link.devices
            .lock()
            .extend(devices.iter().map(|d| d.to_string()));
        Arc::new(link)
    }

    pub(crate) fn calls(&self) -> Vec<LinkCall> {
        self.calls.lock().clone()
    }

    pub(crate) fn remove_device(&self, name: &str) {
        self.devices.lock().remove(name);
    }
}

#[async_trait]
impl LinkLayer for FakeLink {
    async fn device_exists(&self, name: &str) -> OvsResult<bool> {
        Ok(self.devices.lock().contains(name))
    }

    async fn add_veth(&self, local: &str, peer: &str) -> OvsResult<()> {
        let mut devices = self.devices.lock();
        devices.insert(local.to_string());
        devices.insert(peer.to_string());
        self.calls
            .lock()
            .push(LinkCall::AddVeth(local.to_string(), peer.to_string()));
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> OvsResult<()> {
        self.devices.lock().remove(name);
        self.calls.lock().push(LinkCall::DeleteLink(name.to_string()));
        Ok(())
    }

    async fn set_up(&self, name: &str) -> OvsResult<()> {
        self.calls.lock().push(LinkCall::SetUp(name.to_string()));
        Ok(())
    }

    async fn interface_mac(&self, name: &str) -> OvsResult<MacAddress> {
        if self.devices.lock().contains(name) {
            Ok("00:11:22:33:44:55".parse().unwrap())
        } else {
            Err(OvsError::internal(format!("no device {}", name)))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RpcCall {
    GetDeviceDetails(String),
    UpdateDeviceDown(String),
    UpdateDeviceUp(String),
    ReportState,
    TunnelSync,
}

#[derive(Default)]
struct FakeRpcState {
    details: HashMap<String, DeviceDetails>,
    details_failures: HashSet<String>,
    still_exists: HashSet<String>,
    down_failures: HashSet<String>,
    fail_report: bool,
    fail_tunnel_sync: bool,
    tunnels: Vec<TunnelEndpoint>,
    calls: Vec<RpcCall>,
    reports: Vec<AgentState>,
}

#[derive(Default)]
pub(crate) struct FakeRpc {
    state: Mutex<FakeRpcState>,
}

impl FakeRpc {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_details(&self, details: DeviceDetails) {
        self.state
            .lock()
            .details
            .insert(details.device().to_string(), details);
    }

    pub(crate) fn fail_details(&self, device: &str) {
        self.state.lock().details_failures.insert(device.to_string());
    }

    pub(crate) fn set_still_exists(&self, device: &str) {
        self.state.lock().still_exists.insert(device.to_string());
    }

    pub(crate) fn fail_down(&self, device: &str) {
        self.state.lock().down_failures.insert(device.to_string());
    }

    pub(crate) fn recover_down(&self, device: &str) {
        self.state.lock().down_failures.remove(device);
    }

    pub(crate) fn set_fail_report(&self, fail: bool) {
        self.state.lock().fail_report = fail;
    }

    pub(crate) fn set_fail_tunnel_sync(&self, fail: bool) {
        self.state.lock().fail_tunnel_sync = fail;
    }

    pub(crate) fn set_tunnels(&self, tunnels: Vec<TunnelEndpoint>) {
        self.state.lock().tunnels = tunnels;
    }

    pub(crate) fn calls(&self) -> Vec<RpcCall> {
        self.state.lock().calls.clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub(crate) fn reports(&self) -> Vec<AgentState> {
        self.state.lock().reports.clone()
    }

    fn record(&self, call: RpcCall) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl PluginRpc for FakeRpc {
    async fn get_device_details(&self, device: &str, _agent_id: &str) -> AgentResult<DeviceDetails> {
        self.record(RpcCall::GetDeviceDetails(device.to_string()));
        let state = self.state.lock();
        if state.details_failures.contains(device) {
            return Err(AgentError::transport("get_device_details", "timed out"));
        }
        Ok(state
            .details
            .get(device)
            .cloned()
            .unwrap_or_else(|| DeviceDetails::Unknown {
                device: device.to_string(),
            }))
    }

    async fn update_device_down(
        &self,
        device: &str,
        _agent_id: &str,
    ) -> AgentResult<DeviceDownResult> {
        self.record(RpcCall::UpdateDeviceDown(device.to_string()));
        let state = self.state.lock();
        if state.down_failures.contains(device) {
            return Err(AgentError::transport("update_device_down", "timed out"));
        }
        Ok(DeviceDownResult {
            exists: state.still_exists.contains(device),
        })
    }

    async fn update_device_up(&self, device: &str, _agent_id: &str) -> AgentResult<()> {
        self.record(RpcCall::UpdateDeviceUp(device.to_string()));
        Ok(())
    }

    async fn report_state(&self, state: &AgentState) -> AgentResult<()> {
        self.record(RpcCall::ReportState);
        let mut inner = self.state.lock();
        if inner.fail_report {
            return Err(AgentError::transport("report_state", "timed out"));
        }
        inner.reports.push(state.clone());
        Ok(())
    }

    async fn tunnel_sync(&self, _local_ip: IpAddr) -> AgentResult<Vec<TunnelEndpoint>> {
        self.record(RpcCall::TunnelSync);
        let state = self.state.lock();
        if state.fail_tunnel_sync {
            return Err(AgentError::transport("tunnel_sync", "timed out"));
        }
        Ok(state.tunnels.clone())
    }
}

/// A topology wired to fakes: `br-int`, `physnet1` on `br-eth1`
/// (ofports 11 / 22) and, optionally, `br-tun` with patch ports 1 / 2
/// and local endpoint 10.0.0.1.
pub(crate) struct Harness {
    pub provider: Arc<FakeProvider>,
    pub link: Arc<FakeLink>,
    pub rpc: Arc<FakeRpc>,
    pub topology: Arc<crate::topology::BridgeTopology>,
}

impl Harness {
    pub(crate) async fn new(tunneling: bool) -> Self {
        Self::build(tunneling, None).await
    }

    pub(crate) async fn with_domu(domu: &str) -> Self {
        Self::build(false, Some(domu)).await
    }

    async fn build(tunneling: bool, domu: Option<&str>) -> Self {
        let provider = FakeProvider::new();
        let link = FakeLink::with_devices(&["br-int", "br-eth1"]);
        provider.fake("br-int").set_ofport("int-br-eth1", OfPort::Attached(11));
        provider.fake("br-eth1").set_ofport("phy-br-eth1", OfPort::Attached(22));
        provider.fake("br-int").set_ofport("patch-tun", OfPort::Attached(1));
        provider.fake("br-tun").set_ofport("patch-int", OfPort::Attached(2));

        let mut topology =
            crate::topology::BridgeTopology::new(provider.clone(), link.clone(), "br-int");
        let mappings: BTreeMap<String, String> =
            [("physnet1".to_string(), "br-eth1".to_string())].into_iter().collect();
        topology.setup_physical_bridges(&mappings).await.unwrap();
        if tunneling {
            topology
                .setup_tunnel_br("br-tun", "patch-tun", "patch-int", "10.0.0.1".parse().unwrap())
                .await
                .unwrap();
        }
        topology.setup_domu_integration_br(domu);

        for name in ["br-int", "br-eth1", "br-tun"] {
            provider.fake(name).clear_calls();
        }

        Self {
            provider,
            link,
            rpc: FakeRpc::new(),
            topology: Arc::new(topology),
        }
    }

    pub(crate) fn int_br(&self) -> Arc<FakeBridge> {
        self.provider.fake("br-int")
    }

    pub(crate) fn tun_br(&self) -> Arc<FakeBridge> {
        self.provider.fake("br-tun")
    }

    pub(crate) fn phys_br(&self) -> Arc<FakeBridge> {
        self.provider.fake("br-eth1")
    }

    pub(crate) fn lifecycle(&self) -> crate::lifecycle::PortLifecycle {
        self.lifecycle_with(crate::vlan_allocator::VlanAllocator::new())
    }

    pub(crate) fn lifecycle_with(
        &self,
        allocator: crate::vlan_allocator::VlanAllocator,
    ) -> crate::lifecycle::PortLifecycle {
        crate::lifecycle::PortLifecycle::new(
            allocator,
            self.topology.clone(),
            self.rpc.clone(),
            AGENT_ID,
        )
    }
}

pub(crate) const AGENT_ID: &str = "ovs001122334455";
