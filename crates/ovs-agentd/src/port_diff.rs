//! Port-set diffing between two polls of the switch.

use ovs_types::OfPort;
use std::collections::HashSet;
use std::fmt;

use crate::bridge::VifPort;

/// A VIF observed on a bridge.
///
/// The OpenFlow port number is part of the identity, so a VIF that attaches
/// or is renumbered shows up as one removal plus one addition. `device` is
/// the control-plane id (`iface-id`) every control-plane call takes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortRecord {
    pub bridge: String,
    pub device: String,
    pub ofport: OfPort,
}

impl PortRecord {
    pub fn new(bridge: impl Into<String>, device: impl Into<String>, ofport: OfPort) -> Self {
        Self {
            bridge: bridge.into(),
            device: device.into(),
            ofport,
        }
    }
}

impl From<&VifPort> for PortRecord {
    fn from(vif: &VifPort) -> Self {
        Self::new(vif.bridge.clone(), vif.vif_id.clone(), vif.ofport)
    }
}

impl fmt::Display for PortRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.bridge, self.device, self.ofport)
    }
}

/// Result of comparing two polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortDiff {
    /// Nothing was added or removed; the cycle can be skipped.
    Unchanged,
    Changed {
        current: HashSet<PortRecord>,
        added: HashSet<PortRecord>,
        removed: HashSet<PortRecord>,
    },
}

impl PortDiff {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, PortDiff::Unchanged)
    }
}

/// Compares the registered set against the latest poll.
pub fn diff(previous: &HashSet<PortRecord>, current: HashSet<PortRecord>) -> PortDiff {
    let added: HashSet<PortRecord> = current.difference(previous).cloned().collect();
    let removed: HashSet<PortRecord> = previous.difference(&current).cloned().collect();

    if added.is_empty() && removed.is_empty() {
        return PortDiff::Unchanged;
    }

    PortDiff::Changed {
        current,
        added,
        removed,
    }
}
