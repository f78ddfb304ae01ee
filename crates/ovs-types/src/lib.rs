//! Common types for the Open vSwitch L2 agent.
//!
//! This crate provides type-safe representations of the primitives the
//! agent passes between the control plane and the local virtual switch:
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`VlanId`]: host-local 802.1Q tags used to isolate networks on the integration bridge
//! - [`OfPort`]: OpenFlow port numbers, with an explicit unattached state
//! - [`NetworkType`]: provider network types (flat, vlan, gre, local)

mod mac;
mod network;
mod ofport;
mod vlan;

pub use mac::MacAddress;
pub use network::NetworkType;
pub use ofport::OfPort;
pub use vlan::{VlanId, DEAD_VLAN_TAG, UNTAGGED_VLAN};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid VLAN ID: {0} (must be 1-4094)")]
    InvalidVlanId(u16),

    #[error("invalid OpenFlow port: {0}")]
    InvalidOfPort(String),

    #[error("invalid network type: {0}")]
    InvalidNetworkType(String),
}
