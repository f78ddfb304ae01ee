//! ovs-agentd - Open vSwitch L2 agent
//!
//! Keeps the local Open vSwitch bridges in line with the network control
//! plane. Every polling interval the agent lists the VIFs plugged into the
//! integration bridge, diffs them against the previous poll, resolves new
//! devices through the control plane and wires them to a host-local VLAN.
//! Removed devices are reported down and their VLANs reclaimed once unused.
//!
//! - [`vlan_allocator`]: local VLAN pool and network to VLAN table
//! - [`port_diff`]: poll-to-poll port set comparison
//! - [`lifecycle`]: bind / dead / unbind transitions of a VIF
//! - [`reconciler`]: per-cycle handling of added and removed devices
//! - [`topology`]: integration, tunnel, physical and secondary bridges
//! - [`state_report`]: periodic heartbeat
//! - [`agent`]: startup wiring and the reconciliation loop

pub mod agent;
pub mod bridge;
pub mod commands;
pub mod config;
pub mod error;
pub mod flow;
pub mod lifecycle;
pub mod link;
pub mod port_diff;
pub mod reconciler;
pub mod rpc;
pub mod state_report;
pub mod topology;
pub mod vlan_allocator;

#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentNotification, PortUpdate, ReconciliationLoop};
pub use bridge::{Bridge, BridgeProvider, OvsBridge, OvsBridgeProvider, VifPort};
pub use config::AgentConfig;
pub use error::{AgentError, AgentResult};
pub use lifecycle::{BindingState, NetworkSegment, PortLifecycle};
pub use link::{IpLink, LinkLayer};
pub use port_diff::{PortDiff, PortRecord};
pub use reconciler::DeviceReconciler;
pub use rpc::{DeviceDetails, HttpPluginClient, PluginRpc};
pub use state_report::AgentStateReporter;
pub use topology::BridgeTopology;
pub use vlan_allocator::VlanAllocator;
