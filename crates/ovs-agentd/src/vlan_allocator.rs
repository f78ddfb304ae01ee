//! Local VLAN id pool and the network to local VLAN table.
//!
//! This is the only place where mappings are created, changed or destroyed.
//! Other components go through [`VlanAllocator::allocate`],
//! [`VlanAllocator::bind_vif`], [`VlanAllocator::unbind_vif`] and
//! [`VlanAllocator::reclaim`]; reads go through [`VlanAllocator::get`].

use ovs_types::{NetworkType, VlanId};
use std::collections::{BTreeSet, HashMap};
use std::ops::RangeInclusive;
use tracing::{debug, info};

use crate::bridge::VifPort;
use crate::error::{AgentError, AgentResult};

/// A locally provisioned network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVlanMapping {
    vlan: VlanId,
    network_type: NetworkType,
    physical_network: Option<String>,
    segmentation_id: Option<u32>,
    vif_ports: HashMap<String, VifPort>,
}

impl LocalVlanMapping {
    pub fn vlan(&self) -> VlanId {
        self.vlan
    }

    pub fn network_type(&self) -> NetworkType {
        self.network_type
    }

    pub fn physical_network(&self) -> Option<&str> {
        self.physical_network.as_deref()
    }

    pub fn segmentation_id(&self) -> Option<u32> {
        self.segmentation_id
    }

    pub fn vif_ports(&self) -> &HashMap<String, VifPort> {
        &self.vif_ports
    }

    pub fn contains_vif(&self, vif_id: &str) -> bool {
        self.vif_ports.contains_key(vif_id)
    }
}

/// Owner of the local VLAN pool.
///
/// Ids are handed out lowest first. An id goes back to the pool exactly
/// once, when its mapping is destroyed.
#[derive(Debug)]
pub struct VlanAllocator {
    free: BTreeSet<u16>,
    mappings: HashMap<String, LocalVlanMapping>,
}

impl VlanAllocator {
    /// Creates an allocator over the full 1-4094 range.
    pub fn new() -> Self {
        Self::with_range(VlanId::MIN..=VlanId::MAX)
    }

    /// Creates an allocator over `range`, clipped to 1-4094.
    pub fn with_range(range: RangeInclusive<u16>) -> Self {
        let start = (*range.start()).max(VlanId::MIN);
        let end = (*range.end()).min(VlanId::MAX);
        Self {
            free: (start..=end).collect(),
            mappings: HashMap::new(),
        }
    }

    /// Returns the local VLAN of `network_id`, creating the mapping if needed.
    ///
    /// # Errors
    ///
    /// [`AgentError::PoolExhausted`] when a new mapping is needed and no id
    /// is free.
    pub fn allocate(
        &mut self,
        network_id: &str,
        network_type: NetworkType,
        physical_network: Option<&str>,
        segmentation_id: Option<u32>,
    ) -> AgentResult<VlanId> {
        if let Some(mapping) = self.mappings.get(network_id) {
            return Ok(mapping.vlan);
        }

        let vlan = self
            .free
            .pop_first()
            .and_then(|id| VlanId::new(id).ok())
            .ok_or_else(|| AgentError::PoolExhausted {
                network_id: network_id.to_string(),
            })?;

        info!(
            network_id,
            vlan = vlan.as_u16(),
            network_type = %network_type,
            "Allocated local VLAN"
        );
        self.mappings.insert(
            network_id.to_string(),
            LocalVlanMapping {
                vlan,
                network_type,
                physical_network: physical_network.map(str::to_string),
                segmentation_id,
                vif_ports: HashMap::new(),
            },
        );
        Ok(vlan)
    }

    pub fn get(&self, network_id: &str) -> Option<&LocalVlanMapping> {
        self.mappings.get(network_id)
    }

    /// Adds a VIF to an existing mapping. Returns false if there is no
    /// mapping for `network_id`.
    pub fn bind_vif(&mut self, network_id: &str, port: VifPort) -> bool {
        match self.mappings.get_mut(network_id) {
            Some(mapping) => {
                mapping.vif_ports.insert(port.vif_id.clone(), port);
                true
            }
            None => false,
        }
    }

    /// Removes a VIF from its mapping and destroys the mapping once it is
    /// empty. Returns true if the mapping was reclaimed.
    pub fn unbind_vif(&mut self, network_id: &str, vif_id: &str) -> bool {
        let Some(mapping) = self.mappings.get_mut(network_id) else {
            return false;
        };
        if mapping.vif_ports.remove(vif_id).is_none() {
            debug!(network_id, vif_id, "VIF not bound to network");
            return false;
        }
        if !mapping.vif_ports.is_empty() {
            return false;
        }
        self.reclaim(network_id).is_some()
    }

    /// Destroys the mapping for `network_id` regardless of its VIFs.
    ///
    /// Returns the destroyed mapping, or `None` if there was none.
    pub fn reclaim(&mut self, network_id: &str) -> Option<LocalVlanMapping> {
        let mapping = self.mappings.remove(network_id)?;
        let returned = self.free.insert(mapping.vlan.as_u16());
        debug_assert!(returned, "local VLAN {} reclaimed twice", mapping.vlan);
        info!(network_id, vlan = mapping.vlan.as_u16(), "Reclaimed local VLAN");
        Some(mapping)
    }

    /// Network a VIF is currently bound to.
    pub fn network_of_vif(&self, vif_id: &str) -> Option<&str> {
        self.mappings
            .iter()
            .find(|(_, mapping)| mapping.contains_vif(vif_id))
            .map(|(network_id, _)| network_id.as_str())
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Number of ids left in the pool.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl Default for VlanAllocator {
    fn default() -> Self {
        Self::new()
    }
}
