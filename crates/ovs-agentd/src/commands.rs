//! Shell command builders for bridge, flow and link operations.
//!
//! Every name that can come from outside the agent (bridge and port names
//! from configuration or OVSDB) is passed through [`shell::shellquote`].

use crate::flow::{Flow, FlowMatch};
use ovs_agent_common::shell;
use std::net::IpAddr;

/// Columns requested when enumerating interfaces.
const INTERFACE_COLUMNS: &str = "name,external_ids,ofport";

fn vsctl(args: &str) -> String {
    format!(
        "{} --timeout={} {}",
        shell::OVS_VSCTL_CMD,
        shell::VSCTL_TIMEOUT_SECS,
        args
    )
}

/// Build list ports command
pub fn build_list_ports_cmd(bridge: &str) -> String {
    vsctl(&format!("list-ports {}", shell::shellquote(bridge)))
}

/// Build interface table dump (JSON) for all interfaces
pub fn build_list_interfaces_cmd() -> String {
    vsctl(&format!(
        "--format=json -- --columns={} list Interface",
        INTERFACE_COLUMNS
    ))
}

/// Build interface lookup (JSON) by `external_ids:iface-id`
pub fn build_find_interface_by_iface_id_cmd(vif_id: &str) -> String {
    vsctl(&format!(
        "--format=json -- --columns={} find Interface external_ids:iface-id={}",
        INTERFACE_COLUMNS,
        shell::shellquote(vif_id)
    ))
}

/// Build MAC listing (JSON) for all interfaces
pub fn build_list_interface_macs_cmd() -> String {
    vsctl("--format=json -- --columns=name,mac_in_use list Interface")
}

/// Build set port tag command
pub fn build_set_port_tag_cmd(port: &str, tag: u16) -> String {
    vsctl(&format!("set Port {} tag={}", shell::shellquote(port), tag))
}

/// Build get port tag command
pub fn build_get_port_tag_cmd(port: &str) -> String {
    vsctl(&format!("get Port {} tag", shell::shellquote(port)))
}

/// Build get interface ofport command
pub fn build_get_ofport_cmd(port: &str) -> String {
    vsctl(&format!("get Interface {} ofport", shell::shellquote(port)))
}

/// Build add port command
pub fn build_add_port_cmd(bridge: &str, port: &str) -> String {
    vsctl(&format!(
        "-- --may-exist add-port {} {}",
        shell::shellquote(bridge),
        shell::shellquote(port)
    ))
}

/// Build delete port command
pub fn build_del_port_cmd(bridge: &str, port: &str) -> String {
    vsctl(&format!(
        "-- --if-exists del-port {} {}",
        shell::shellquote(bridge),
        shell::shellquote(port)
    ))
}

/// Build patch port command
///
/// Creates `local` on `bridge` as one end of a patch pair whose other end
/// is `peer`.
pub fn build_add_patch_port_cmd(bridge: &str, local: &str, peer: &str) -> String {
    let local = shell::shellquote(local);
    vsctl(&format!(
        "-- --may-exist add-port {} {} -- set Interface {} type=patch options:peer={}",
        shell::shellquote(bridge),
        local,
        local,
        shell::shellquote(peer)
    ))
}

/// Build GRE tunnel port command
///
/// Keys are taken from the flow (`set_tunnel` / `tun_id`) so one port
/// serves every overlay network towards `remote_ip`.
pub fn build_add_tunnel_port_cmd(
    bridge: &str,
    port: &str,
    remote_ip: IpAddr,
    local_ip: IpAddr,
) -> String {
    let port = shell::shellquote(port);
    vsctl(&format!(
        "-- --may-exist add-port {} {} -- set Interface {} type=gre \
         options:remote_ip={} options:local_ip={} options:in_key=flow options:out_key=flow",
        shell::shellquote(bridge),
        port,
        port,
        remote_ip,
        local_ip
    ))
}

/// Build bridge reset command (delete and recreate)
pub fn build_reset_bridge_cmd(bridge: &str) -> String {
    let bridge = shell::shellquote(bridge);
    vsctl(&format!("-- --if-exists del-br {} -- add-br {}", bridge, bridge))
}

/// Build ensure bridge command
pub fn build_ensure_bridge_cmd(bridge: &str) -> String {
    vsctl(&format!("-- --may-exist add-br {}", shell::shellquote(bridge)))
}

/// Build add flow command
pub fn build_add_flow_cmd(bridge: &str, flow: &Flow) -> String {
    format!(
        "{} add-flow {} \"{}\"",
        shell::OVS_OFCTL_CMD,
        shell::shellquote(bridge),
        flow
    )
}

/// Build delete flows command
///
/// An empty match deletes every flow on the bridge.
pub fn build_del_flows_cmd(bridge: &str, matches: &FlowMatch) -> String {
    if matches.is_empty() {
        format!("{} del-flows {}", shell::OVS_OFCTL_CMD, shell::shellquote(bridge))
    } else {
        format!(
            "{} del-flows {} \"{}\"",
            shell::OVS_OFCTL_CMD,
            shell::shellquote(bridge),
            matches
        )
    }
}

/// Build link existence check command
pub fn build_link_show_cmd(device: &str) -> String {
    format!("{} link show {} 2>/dev/null", shell::IP_CMD, shell::shellquote(device))
}

/// Build veth pair creation command
pub fn build_add_veth_cmd(local: &str, peer: &str) -> String {
    format!(
        "{} link add {} type veth peer name {}",
        shell::IP_CMD,
        shell::shellquote(local),
        shell::shellquote(peer)
    )
}

/// Build link delete command
pub fn build_link_delete_cmd(device: &str) -> String {
    format!("{} link delete {}", shell::IP_CMD, shell::shellquote(device))
}

/// Build link up command
pub fn build_link_set_up_cmd(device: &str) -> String {
    format!("{} link set {} up", shell::IP_CMD, shell::shellquote(device))
}
