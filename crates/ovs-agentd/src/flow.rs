//! Typed OpenFlow rules rendered to `ovs-ofctl` syntax.

use ovs_types::MacAddress;
use std::fmt;

/// Match fields used by the agent.
///
/// Only the fields the agent actually programs are modelled; rendering
/// emits them in a fixed order so that identical matches always produce
/// identical command lines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FlowMatch {
    in_port: Option<u32>,
    dl_vlan: Option<u16>,
    dl_dst: Option<String>,
    tun_id: Option<u32>,
}

impl FlowMatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_port(mut self, port: u32) -> Self {
        self.in_port = Some(port);
        self
    }

    pub fn dl_vlan(mut self, vlan: u16) -> Self {
        self.dl_vlan = Some(vlan);
        self
    }

    pub fn dl_dst(mut self, mac: MacAddress) -> Self {
        self.dl_dst = Some(mac.to_string());
        self
    }

    /// Matches destination MACs under `mask` (e.g. the multicast bit).
    pub fn dl_dst_masked(mut self, mac: MacAddress, mask: MacAddress) -> Self {
        self.dl_dst = Some(format!("{}/{}", mac, mask));
        self
    }

    pub fn tun_id(mut self, id: u32) -> Self {
        self.tun_id = Some(id);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for FlowMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields = Vec::with_capacity(4);
        if let Some(port) = self.in_port {
            fields.push(format!("in_port={}", port));
        }
        if let Some(vlan) = self.dl_vlan {
            fields.push(format!("dl_vlan={}", render_vlan(vlan)));
        }
        if let Some(ref dst) = self.dl_dst {
            fields.push(format!("dl_dst={}", dst));
        }
        if let Some(id) = self.tun_id {
            fields.push(format!("tun_id={}", id));
        }
        f.write_str(&fields.join(","))
    }
}

fn render_vlan(vlan: u16) -> String {
    if vlan == ovs_types::UNTAGGED_VLAN {
        "0xffff".to_string()
    } else {
        vlan.to_string()
    }
}

/// A single OpenFlow action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowAction {
    Drop,
    Normal,
    StripVlan,
    ModVlanVid(u16),
    SetTunnel(u32),
    Output(u32),
}

impl fmt::Display for FlowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowAction::Drop => f.write_str("drop"),
            FlowAction::Normal => f.write_str("normal"),
            FlowAction::StripVlan => f.write_str("strip_vlan"),
            FlowAction::ModVlanVid(vid) => write!(f, "mod_vlan_vid:{}", vid),
            FlowAction::SetTunnel(id) => write!(f, "set_tunnel:{}", id),
            FlowAction::Output(port) => write!(f, "output:{}", port),
        }
    }
}

/// A flow rule: priority, match and an ordered action list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Flow {
    pub priority: u16,
    pub matches: FlowMatch,
    pub actions: Vec<FlowAction>,
}

impl Flow {
    pub fn new(priority: u16, matches: FlowMatch, actions: Vec<FlowAction>) -> Self {
        Self {
            priority,
            matches,
            actions,
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "priority={}", self.priority)?;
        if !self.matches.is_empty() {
            write!(f, ",{}", self.matches)?;
        }
        let actions: Vec<String> = self.actions.iter().map(ToString::to_string).collect();
        write!(f, ",actions={}", actions.join(","))
    }
}
