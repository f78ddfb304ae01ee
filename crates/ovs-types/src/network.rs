//! Provider network types.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a logical network is realised outside the integration bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Untagged traffic on a physical network.
    Flat,
    /// 802.1Q tagged traffic on a physical network.
    Vlan,
    /// GRE overlay between agents; segmentation id is the tunnel key.
    Gre,
    /// Traffic never leaves the host.
    Local,
}

impl NetworkType {
    /// Returns true for overlay types that need tunnel bridge flows.
    pub const fn is_tunnel(&self) -> bool {
        matches!(self, NetworkType::Gre)
    }

    /// Returns true for types wired through a physical bridge.
    pub const fn uses_physical_network(&self) -> bool {
        matches!(self, NetworkType::Flat | NetworkType::Vlan)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Flat => "flat",
            NetworkType::Vlan => "vlan",
            NetworkType::Gre => "gre",
            NetworkType::Local => "local",
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "flat" => Ok(NetworkType::Flat),
            "vlan" => Ok(NetworkType::Vlan),
            "gre" => Ok(NetworkType::Gre),
            "local" => Ok(NetworkType::Local),
            _ => Err(ParseError::InvalidNetworkType(s.to_string())),
        }
    }
}
