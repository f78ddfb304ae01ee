//! Open vSwitch bridge driver.
//!
//! [`Bridge`] is the switch-programming seam used by the rest of the agent.
//! [`OvsBridge`] implements it by shelling out to `ovs-vsctl` and
//! `ovs-ofctl`; unit tests elsewhere in the crate use recording fakes.

use async_trait::async_trait;
use ovs_agent_common::{shell, OvsError, OvsResult};
use ovs_types::{MacAddress, OfPort};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::warn;

use crate::commands::*;
use crate::flow::{Flow, FlowMatch};
use crate::port_diff::PortRecord;

/// `external_ids` key holding the control-plane port id of a VIF.
pub const IFACE_ID_KEY: &str = "iface-id";

/// `external_ids` key holding the guest MAC of a VIF.
pub const ATTACHED_MAC_KEY: &str = "attached-mac";

/// A VIF as seen on a bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VifPort {
    /// OVS port (and interface) name, e.g. `tap5f0c11aa-bb`.
    pub port_name: String,
    pub ofport: OfPort,
    /// Control-plane port id (`external_ids:iface-id`).
    pub vif_id: String,
    pub vif_mac: Option<MacAddress>,
    /// Bridge the port is attached to.
    pub bridge: String,
}

/// Switch-programming operations on one bridge.
#[async_trait]
pub trait Bridge: Send + Sync {
    /// Bridge name.
    fn name(&self) -> &str;

    /// All VIFs currently attached to the bridge.
    async fn get_vif_ports(&self) -> OvsResult<Vec<VifPort>>;

    /// VIFs currently attached to the bridge, keyed for diffing.
    async fn get_vif_port_set(&self) -> OvsResult<HashSet<PortRecord>> {
        Ok(self
            .get_vif_ports()
            .await?
            .iter()
            .map(PortRecord::from)
            .collect())
    }

    /// Looks up a VIF on this bridge by control-plane id.
    async fn get_vif_port_by_id(&self, vif_id: &str) -> OvsResult<Option<VifPort>>;

    /// MACs in use by every port on the bridge.
    async fn get_port_macs(&self) -> OvsResult<HashSet<MacAddress>>;

    async fn set_port_tag(&self, port_name: &str, tag: u16) -> OvsResult<()>;

    /// Current tag, `None` when the port is untagged.
    async fn get_port_tag(&self, port_name: &str) -> OvsResult<Option<u16>>;

    async fn add_flow(&self, flow: &Flow) -> OvsResult<()>;

    async fn delete_flows(&self, matches: &FlowMatch) -> OvsResult<()>;

    async fn remove_all_flows(&self) -> OvsResult<()>;

    /// Adds a port and returns its OpenFlow number.
    async fn add_port(&self, port_name: &str) -> OvsResult<OfPort>;

    async fn delete_port(&self, port_name: &str) -> OvsResult<()>;

    /// Adds one end of a patch pair and returns its OpenFlow number.
    async fn add_patch_port(&self, local_name: &str, peer_name: &str) -> OvsResult<OfPort>;

    /// Adds a GRE port towards `remote_ip` and returns its OpenFlow number.
    async fn add_tunnel_port(
        &self,
        port_name: &str,
        remote_ip: IpAddr,
        local_ip: IpAddr,
    ) -> OvsResult<OfPort>;

    /// Deletes and recreates the bridge.
    async fn reset_bridge(&self) -> OvsResult<()>;

    /// Creates the bridge if it does not exist.
    async fn ensure_bridge(&self) -> OvsResult<()>;
}

/// Builds bridge handles by name.
pub trait BridgeProvider: Send + Sync {
    fn bridge(&self, name: &str) -> Arc<dyn Bridge>;
}

/// Provider for shell-backed [`OvsBridge`] handles.
#[derive(Debug, Clone, Default)]
pub struct OvsBridgeProvider {
    root_helper: Option<String>,
}

impl OvsBridgeProvider {
    pub fn new(root_helper: Option<String>) -> Self {
        Self { root_helper }
    }
}

impl BridgeProvider for OvsBridgeProvider {
    fn bridge(&self, name: &str) -> Arc<dyn Bridge> {
        Arc::new(OvsBridge::new(name, self.root_helper.clone()))
    }
}

/// Shell-backed bridge driver.
pub struct OvsBridge {
    name: String,
    root_helper: Option<String>,

    /// Mock mode for testing
    #[cfg(test)]
    mock_mode: bool,

    /// Captured commands in mock mode
    #[cfg(test)]
    captured_commands: parking_lot::Mutex<Vec<String>>,

    /// Canned stdout per command in mock mode
    #[cfg(test)]
    mock_responses: parking_lot::Mutex<HashMap<String, String>>,
}

impl OvsBridge {
    pub fn new(name: impl Into<String>, root_helper: Option<String>) -> Self {
        Self {
            name: name.into(),
            root_helper,
            #[cfg(test)]
            mock_mode: false,
            #[cfg(test)]
            captured_commands: parking_lot::Mutex::new(Vec::new()),
            #[cfg(test)]
            mock_responses: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Enables mock mode for testing
    #[cfg(test)]
    pub fn with_mock_mode(mut self) -> Self {
        self.mock_mode = true;
        self
    }

    /// Sets the stdout returned for `cmd` in mock mode
    #[cfg(test)]
    pub fn with_mock_response(self, cmd: impl Into<String>, output: impl Into<String>) -> Self {
        self.mock_responses.lock().insert(cmd.into(), output.into());
        self
    }

    /// Gets captured commands (for testing)
    #[cfg(test)]
    pub fn captured_commands(&self) -> Vec<String> {
        self.captured_commands.lock().clone()
    }

    /// Execute a command (with mock mode support)
    async fn exec(&self, cmd: &str) -> OvsResult<String> {
        #[cfg(test)]
        if self.mock_mode {
            self.captured_commands.lock().push(cmd.to_string());
            tracing::debug!("Mock exec: {}", cmd);
            return Ok(self
                .mock_responses
                .lock()
                .get(cmd)
                .cloned()
                .unwrap_or_default());
        }

        let cmd = shell::with_root_helper(self.root_helper.as_deref(), cmd);
        shell::exec_or_throw(&cmd).await
    }

    async fn port_names(&self) -> OvsResult<HashSet<String>> {
        let output = self.exec(&build_list_ports_cmd(&self.name)).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn get_ofport(&self, port_name: &str) -> OvsResult<OfPort> {
        let output = self.exec(&build_get_ofport_cmd(port_name)).await?;
        output
            .parse::<OfPort>()
            .map_err(|e| OvsError::parse("ofport", e.to_string()))
    }

    fn to_vif_port(&self, row: InterfaceRow) -> Option<VifPort> {
        let vif_id = row.external_ids.get(IFACE_ID_KEY)?.clone();
        let vif_mac = match row.external_ids.get(ATTACHED_MAC_KEY) {
            Some(raw) => match raw.parse::<MacAddress>() {
                Ok(mac) => Some(mac),
                Err(e) => {
                    warn!(port = %row.name, error = %e, "Ignoring malformed attached-mac");
                    None
                }
            },
            None => return None,
        };
        Some(VifPort {
            port_name: row.name,
            ofport: row.ofport,
            vif_id,
            vif_mac,
            bridge: self.name.clone(),
        })
    }
}

#[async_trait]
impl Bridge for OvsBridge {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_vif_ports(&self) -> OvsResult<Vec<VifPort>> {
        let names = self.port_names().await?;
        let rows = parse_interface_rows(&self.exec(&build_list_interfaces_cmd()).await?)?;
        Ok(rows
            .into_iter()
            .filter(|row| names.contains(&row.name))
            .filter_map(|row| self.to_vif_port(row))
            .collect())
    }

    async fn get_vif_port_by_id(&self, vif_id: &str) -> OvsResult<Option<VifPort>> {
        let output = self
            .exec(&build_find_interface_by_iface_id_cmd(vif_id))
            .await?;
        let rows = parse_interface_rows(&output)?;
        if rows.is_empty() {
            return Ok(None);
        }
        let names = self.port_names().await?;
        Ok(rows
            .into_iter()
            .filter(|row| names.contains(&row.name))
            .find_map(|row| self.to_vif_port(row)))
    }

    async fn get_port_macs(&self) -> OvsResult<HashSet<MacAddress>> {
        let names = self.port_names().await?;
        let output = self.exec(&build_list_interface_macs_cmd()).await?;
        let table = OvsdbTable::parse(&output)?;
        let mut macs = HashSet::new();
        for row in &table.data {
            let Some(name) = table.column(row, "name").and_then(atom_string) else {
                continue;
            };
            if !names.contains(&name) {
                continue;
            }
            if let Some(mac) = table
                .column(row, "mac_in_use")
                .and_then(atom_string)
                .and_then(|raw| raw.parse::<MacAddress>().ok())
            {
                macs.insert(mac);
            }
        }
        Ok(macs)
    }

    async fn set_port_tag(&self, port_name: &str, tag: u16) -> OvsResult<()> {
        self.exec(&build_set_port_tag_cmd(port_name, tag)).await?;
        Ok(())
    }

    async fn get_port_tag(&self, port_name: &str) -> OvsResult<Option<u16>> {
        let output = self.exec(&build_get_port_tag_cmd(port_name)).await?;
        let raw = output.trim();
        if raw.is_empty() || raw == "[]" {
            return Ok(None);
        }
        raw.parse::<u16>()
            .map(Some)
            .map_err(|e| OvsError::parse("port tag", format!("'{}': {}", raw, e)))
    }

    async fn add_flow(&self, flow: &Flow) -> OvsResult<()> {
        self.exec(&build_add_flow_cmd(&self.name, flow)).await?;
        Ok(())
    }

    async fn delete_flows(&self, matches: &FlowMatch) -> OvsResult<()> {
        if matches.is_empty() {
            return Err(OvsError::internal(
                "refusing to delete flows with an empty match; use remove_all_flows",
            ));
        }
        self.exec(&build_del_flows_cmd(&self.name, matches)).await?;
        Ok(())
    }

    async fn remove_all_flows(&self) -> OvsResult<()> {
        self.exec(&build_del_flows_cmd(&self.name, &FlowMatch::new()))
            .await?;
        Ok(())
    }

    async fn add_port(&self, port_name: &str) -> OvsResult<OfPort> {
        self.exec(&build_add_port_cmd(&self.name, port_name)).await?;
        self.get_ofport(port_name).await
    }

    async fn delete_port(&self, port_name: &str) -> OvsResult<()> {
        self.exec(&build_del_port_cmd(&self.name, port_name)).await?;
        Ok(())
    }

    async fn add_patch_port(&self, local_name: &str, peer_name: &str) -> OvsResult<OfPort> {
        self.exec(&build_add_patch_port_cmd(&self.name, local_name, peer_name))
            .await?;
        self.get_ofport(local_name).await
    }

    async fn add_tunnel_port(
        &self,
        port_name: &str,
        remote_ip: IpAddr,
        local_ip: IpAddr,
    ) -> OvsResult<OfPort> {
        self.exec(&build_add_tunnel_port_cmd(
            &self.name, port_name, remote_ip, local_ip,
        ))
        .await?;
        self.get_ofport(port_name).await
    }

    async fn reset_bridge(&self) -> OvsResult<()> {
        self.exec(&build_reset_bridge_cmd(&self.name)).await?;
        Ok(())
    }

    async fn ensure_bridge(&self) -> OvsResult<()> {
        self.exec(&build_ensure_bridge_cmd(&self.name)).await?;
        Ok(())
    }
}

/// One row of `list Interface` / `find Interface` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InterfaceRow {
    pub name: String,
    pub external_ids: HashMap<String, String>,
    pub ofport: OfPort,
}

/// `ovs-vsctl --format=json` table.
#[derive(Debug, Deserialize)]
struct OvsdbTable {
    headings: Vec<String>,
    data: Vec<Vec<Value>>,
}

impl OvsdbTable {
    fn parse(json: &str) -> OvsResult<Self> {
        if json.trim().is_empty() {
            return Ok(Self {
                headings: Vec::new(),
                data: Vec::new(),
            });
        }
        serde_json::from_str(json).map_err(|e| OvsError::parse("OVSDB table", e.to_string()))
    }

    fn column<'a>(&self, row: &'a [Value], heading: &str) -> Option<&'a Value> {
        let index = self.headings.iter().position(|h| h == heading)?;
        row.get(index)
    }
}

/// Parses interface rows from `--columns=name,external_ids,ofport` JSON.
pub(crate) fn parse_interface_rows(json: &str) -> OvsResult<Vec<InterfaceRow>> {
    let table = OvsdbTable::parse(json)?;
    let mut rows = Vec::with_capacity(table.data.len());
    for row in &table.data {
        let name = table
            .column(row, "name")
            .and_then(atom_string)
            .ok_or_else(|| OvsError::parse("Interface table", "row without name"))?;
        let external_ids = table
            .column(row, "external_ids")
            .map(atom_map)
            .unwrap_or_default();
        let ofport = table
            .column(row, "ofport")
            .and_then(Value::as_i64)
            .map(OfPort::from_raw)
            .unwrap_or(OfPort::Unattached);
        rows.push(InterfaceRow {
            name,
            external_ids,
            ofport,
        });
    }
    Ok(rows)
}

/// Decodes a string atom; empty strings and empty sets are absent.
fn atom_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(pair) if pair.len() == 2 && pair[0] == "set" => pair[1]
            .as_array()
            .and_then(|items| items.first())
            .and_then(atom_string),
        _ => None,
    }
}

/// Decodes `["map", [[k, v], ...]]`.
fn atom_map(value: &Value) -> HashMap<String, String> {
    let Some(pair) = value.as_array() else {
        return HashMap::new();
    };
    if pair.len() != 2 || pair[0] != "map" {
        return HashMap::new();
    }
    pair[1]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let kv = entry.as_array()?;
                    Some((kv.first()?.as_str()?.to_string(), kv.get(1)?.as_str()?.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowAction;
    use pretty_assertions::assert_eq;

    const INTERFACES_JSON: &str = r#"{"data":[
        ["tap1",["map",[["attached-mac","fa:16:3e:00:00:01"],["iface-id","vif-1"]]],5],
        ["tap2",["map",[["attached-mac","fa:16:3e:00:00:02"],["iface-id","vif-2"]]],-1],
        ["patch-tun",["map",[]],1],
        ["tap9",["map",[["attached-mac","fa:16:3e:00:00:09"],["iface-id","vif-9"]]],["set",[]]]
    ],"headings":["name","external_ids","ofport"]}"#;

    fn mock_bridge() -> OvsBridge {
        OvsBridge::new("br-int", None)
            .with_mock_mode()
            .with_mock_response(build_list_ports_cmd("br-int"), "tap1\ntap2\npatch-tun\n")
            .with_mock_response(build_list_interfaces_cmd(), INTERFACES_JSON)
    }

    #[test]
    fn test_parse_interface_rows() {
        let rows = parse_interface_rows(INTERFACES_JSON).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].name, "tap1");
        assert_eq!(rows[0].ofport, OfPort::Attached(5));
        assert_eq!(rows[0].external_ids.get(IFACE_ID_KEY).unwrap(), "vif-1");
        assert_eq!(rows[1].ofport, OfPort::Unattached);
        assert!(rows[2].external_ids.is_empty());
        assert_eq!(rows[3].ofport, OfPort::Unattached);
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_interface_rows("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_interface_rows("not json").is_err());
    }

    #[tokio::test]
    async fn test_get_vif_ports_filters_by_bridge() {
        let bridge = mock_bridge();
        let ports = bridge.get_vif_ports().await.unwrap();

        // tap9 is not on br-int and patch-tun is not a VIF
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].vif_id, "vif-1");
        assert_eq!(ports[0].bridge, "br-int");
        assert_eq!(
            ports[0].vif_mac,
            Some("fa:16:3e:00:00:01".parse().unwrap())
        );
        assert_eq!(ports[1].ofport, OfPort::Unattached);

        let set = bridge.get_vif_port_set().await.unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&PortRecord::new("br-int", "vif-1", OfPort::Attached(5))));
        assert!(set.contains(&PortRecord::new("br-int", "vif-2", OfPort::Unattached)));
    }

    #[tokio::test]
    async fn test_get_vif_port_by_id() {
        let find_json = r#"{"data":[["tap1",["map",[["attached-mac","fa:16:3e:00:00:01"],["iface-id","vif-1"]]],5]],"headings":["name","external_ids","ofport"]}"#;
        let bridge =
            mock_bridge().with_mock_response(build_find_interface_by_iface_id_cmd("vif-1"), find_json);

        let port = bridge.get_vif_port_by_id("vif-1").await.unwrap().unwrap();
        assert_eq!(port.port_name, "tap1");
        assert_eq!(port.ofport, OfPort::Attached(5));

        assert!(bridge.get_vif_port_by_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_port_macs() {
        let macs_json = r#"{"data":[["vif1.0","fe:ff:ff:ff:ff:ff"],["eth0","00:11:22:33:44:55"],["vif2.0",["set",[]]]],"headings":["name","mac_in_use"]}"#;
        let bridge = OvsBridge::new("xapi1", None)
            .with_mock_mode()
            .with_mock_response(build_list_ports_cmd("xapi1"), "vif1.0\nvif2.0")
            .with_mock_response(build_list_interface_macs_cmd(), macs_json);

        let macs = bridge.get_port_macs().await.unwrap();
        assert_eq!(macs.len(), 1);
        assert!(macs.contains(&"fe:ff:ff:ff:ff:ff".parse::<MacAddress>().unwrap()));
    }

    #[tokio::test]
    async fn test_get_port_tag() {
        let bridge = OvsBridge::new("br-int", None)
            .with_mock_mode()
            .with_mock_response(build_get_port_tag_cmd("tap1"), "4095")
            .with_mock_response(build_get_port_tag_cmd("tap2"), "[]");

        assert_eq!(bridge.get_port_tag("tap1").await.unwrap(), Some(4095));
        assert_eq!(bridge.get_port_tag("tap2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_add_port_returns_ofport() {
        let bridge = OvsBridge::new("br-int", None)
            .with_mock_mode()
            .with_mock_response(build_get_ofport_cmd("int-br-eth1"), "7");

        let ofport = bridge.add_port("int-br-eth1").await.unwrap();
        assert_eq!(ofport, OfPort::Attached(7));

        let cmds = bridge.captured_commands();
        assert_eq!(cmds.len(), 2);
        assert!(cmds[0].contains("add-port \"br-int\" \"int-br-eth1\""));
    }

    #[tokio::test]
    async fn test_flow_commands() {
        let bridge = OvsBridge::new("br-int", None).with_mock_mode();
        bridge
            .add_flow(&Flow::new(1, FlowMatch::new(), vec![FlowAction::Normal]))
            .await
            .unwrap();
        bridge
            .delete_flows(&FlowMatch::new().in_port(4))
            .await
            .unwrap();
        bridge.remove_all_flows().await.unwrap();

        let cmds = bridge.captured_commands();
        assert_eq!(cmds.len(), 3);
        assert!(cmds[0].ends_with("add-flow \"br-int\" \"priority=1,actions=normal\""));
        assert!(cmds[1].ends_with("del-flows \"br-int\" \"in_port=4\""));
        assert!(cmds[2].ends_with("del-flows \"br-int\""));
    }

    #[tokio::test]
    async fn test_delete_flows_rejects_empty_match() {
        let bridge = OvsBridge::new("br-int", None).with_mock_mode();
        assert!(bridge.delete_flows(&FlowMatch::new()).await.is_err());
        assert!(bridge.captured_commands().is_empty());
    }
}
