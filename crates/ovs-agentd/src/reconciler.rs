//! Per-cycle handling of added and removed devices.
//!
//! Failures never escape a cycle: each one is logged and folded into the
//! returned resync flag, and the device is retried once the loop re-polls
//! from a full snapshot. Removals that could not be completed are kept
//! until the loop collects them, since a fresh snapshot no longer lists
//! those devices.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::AgentError;
use crate::lifecycle::{NetworkSegment, PortLifecycle};
use crate::port_diff::{PortDiff, PortRecord};
use crate::rpc::{DeviceDetails, PluginRpc};

/// Resolves devices against the control plane and drives their lifecycle.
pub struct DeviceReconciler {
    lifecycle: PortLifecycle,
    rpc: Arc<dyn PluginRpc>,
    agent_id: String,
    unconfirmed_removals: HashSet<PortRecord>,
}

fn sorted(devices: &HashSet<PortRecord>) -> Vec<&PortRecord> {
    let mut devices: Vec<&PortRecord> = devices.iter().collect();
    devices.sort();
    devices
}

/// Logs a lifecycle failure and returns whether the device should be
/// processed again.
fn should_retry(device: &str, action: &str, err: &AgentError) -> bool {
    match err {
        AgentError::PoolExhausted { network_id } => {
            error!(device, network_id = %network_id, "No local VLAN left, port left unbound");
        }
        e if e.is_retryable() => warn!(device, error = %e, "Failed to {}", action),
        e => error!(device, error = %e, "Failed to {}, not retrying", action),
    }
    err.is_retryable()
}

impl DeviceReconciler {
    pub fn new(lifecycle: PortLifecycle, rpc: Arc<dyn PluginRpc>, agent_id: impl Into<String>) -> Self {
        Self {
            lifecycle,
            rpc,
            agent_id: agent_id.into(),
            unconfirmed_removals: HashSet::new(),
        }
    }

    pub fn lifecycle(&self) -> &PortLifecycle {
        &self.lifecycle
    }

    pub fn lifecycle_mut(&mut self) -> &mut PortLifecycle {
        &mut self.lifecycle
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Removed devices whose teardown failed since the last call. They must
    /// be offered to [`treat_removed`](Self::treat_removed) again.
    pub fn take_unconfirmed_removals(&mut self) -> HashSet<PortRecord> {
        std::mem::take(&mut self.unconfirmed_removals)
    }

    /// Resolves and wires newly seen devices. Returns true if any device
    /// needs another attempt.
    pub async fn treat_added(&mut self, devices: &HashSet<PortRecord>) -> bool {
        let mut resync = false;

        for record in sorted(devices) {
            let device = record.device.as_str();
            let details = match self.rpc.get_device_details(device, &self.agent_id).await {
                Ok(details) => details,
                Err(e) => {
                    warn!(device, error = %e, "Unable to get device details");
                    resync = true;
                    continue;
                }
            };

            let Some(bridge) = self.lifecycle.topology().bridge_by_name(&record.bridge).cloned()
            else {
                warn!(device, bridge = %record.bridge, "Device reported on unmanaged bridge");
                continue;
            };
            let port = match bridge.get_vif_port_by_id(device).await {
                Ok(port) => port,
                Err(e) => {
                    warn!(device, error = %e, "Unable to look up VIF port");
                    resync |= e.is_retryable();
                    continue;
                }
            };

            match details {
                DeviceDetails::Known {
                    network_id,
                    network_type,
                    segmentation_id,
                    physical_network,
                    admin_state_up,
                    ..
                } => {
                    let Some(port) = port else {
                        info!(device, "VIF port disappeared before it could be bound");
                        continue;
                    };
                    debug!(
                        device,
                        network_id = %network_id,
                        network_type = %network_type,
                        admin_state_up,
                        "Port added"
                    );
                    let segment = NetworkSegment {
                        network_id,
                        network_type,
                        physical_network,
                        segmentation_id,
                    };
                    if let Err(e) = self.lifecycle.bind(&port, &segment).await {
                        resync |= should_retry(device, "bind port", &e);
                    }
                }
                DeviceDetails::Unknown { .. } => match port {
                    Some(port) if port.ofport.is_attached() => {
                        info!(device, "Device not defined on control plane");
                        if let Err(e) = self.lifecycle.mark_dead(&port).await {
                            resync |= should_retry(device, "isolate port", &e);
                        }
                    }
                    _ => debug!(device, "Ignoring unattached unknown device"),
                },
            }
        }

        resync
    }

    /// Reports removed devices and tears down their state. Returns true if
    /// any device needs another attempt; those devices are kept for
    /// [`take_unconfirmed_removals`](Self::take_unconfirmed_removals).
    pub async fn treat_removed(&mut self, devices: &HashSet<PortRecord>) -> bool {
        let mut resync = false;

        for record in sorted(devices) {
            let device = record.device.as_str();
            info!(device, "Attachment removed");
            let result = match self.rpc.update_device_down(device, &self.agent_id).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(device, error = %e, "Failed to report device down");
                    self.unconfirmed_removals.insert(record.clone());
                    resync = true;
                    continue;
                }
            };

            if result.exists {
                info!(device, "Device still exists on control plane");
                continue;
            }
            if let Err(e) = self.lifecycle.unbind_device(device).await {
                if should_retry(device, "unbind port", &e) {
                    self.unconfirmed_removals.insert(record.clone());
                    resync = true;
                }
            }
        }

        resync
    }

    /// Handles one poll's diff, added devices first.
    ///
    /// A removed record whose device is also among the added ones was only
    /// attached or renumbered; the re-added VIF already went through
    /// [`treat_added`](Self::treat_added) and must not be torn down.
    pub async fn process(&mut self, diff: &PortDiff) -> bool {
        match diff {
            PortDiff::Unchanged => false,
            PortDiff::Changed { added, removed, .. } => {
                let added_resync = self.treat_added(added).await;

                let present: HashSet<&str> = added.iter().map(|r| r.device.as_str()).collect();
                let removed: HashSet<PortRecord> = removed
                    .iter()
                    .filter(|r| {
                        let renumbered = present.contains(r.device.as_str());
                        if renumbered {
                            debug!(device = %r.device, ofport = %r.ofport, "Port renumbered");
                        }
                        !renumbered
                    })
                    .cloned()
                    .collect();
                let removed_resync = self.treat_removed(&removed).await;

                added_resync || removed_resync
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::BindingState;
    use crate::testing::*;
    use crate::vlan_allocator::VlanAllocator;
    use ovs_types::{NetworkType, OfPort, DEAD_VLAN_TAG};
    use pretty_assertions::assert_eq;

    fn reconciler(h: &Harness) -> DeviceReconciler {
        DeviceReconciler::new(h.lifecycle(), h.rpc.clone(), AGENT_ID)
    }

    fn records(devices: &[&str]) -> HashSet<PortRecord> {
        (5u32..)
            .zip(devices)
            .map(|(n, d)| PortRecord::new("br-int", *d, OfPort::Attached(n)))
            .collect()
    }

    fn plug(h: &Harness, vif_id: &str, ofport: OfPort) {
        h.int_br().plug(vif(
            "br-int",
            &format!("tap{}", vif_id),
            vif_id,
            ofport,
            "fa:16:3e:00:00:01",
        ));
    }

    #[tokio::test]
    async fn test_treat_added_transport_error() {
        let h = Harness::new(false).await;
        plug(&h, "v1", OfPort::Attached(5));
        h.rpc.fail_details("v1");
        let mut r = reconciler(&h);

        assert!(r.treat_added(&records(&["v1"])).await);
        assert!(h.int_br().calls().is_empty());
        assert_eq!(r.lifecycle().state("v1"), BindingState::Unbound);
    }

    #[tokio::test]
    async fn test_treat_added_continues_after_failure() {
        let h = Harness::new(false).await;
        plug(&h, "v1", OfPort::Attached(5));
        plug(&h, "v2", OfPort::Attached(6));
        h.rpc.fail_details("v1");
        h.rpc.set_details(known("v2", "net-1", NetworkType::Local, None, None));
        let mut r = reconciler(&h);

        assert!(r.treat_added(&records(&["v1", "v2"])).await);
        assert!(matches!(r.lifecycle().state("v2"), BindingState::Bound(_)));
    }

    #[tokio::test]
    async fn test_treat_added_known_device_binds() {
        let h = Harness::new(false).await;
        plug(&h, "v1", OfPort::Attached(5));
        h.rpc
            .set_details(known("v1", "net-1", NetworkType::Vlan, Some(101), Some("physnet1")));
        let mut r = reconciler(&h);

        assert!(!r.treat_added(&records(&["v1"])).await);
        assert_eq!(h.int_br().tag_of("tapv1"), Some(1));
        assert_eq!(r.lifecycle().allocator().get("net-1").unwrap().vlan().as_u16(), 1);
    }

    #[tokio::test]
    async fn test_treat_added_unknown_device_marked_dead() {
        let h = Harness::new(false).await;
        plug(&h, "v1", OfPort::Attached(5));
        let mut r = reconciler(&h);

        assert!(!r.treat_added(&records(&["v1"])).await);
        assert_eq!(h.int_br().tag_of("tapv1"), Some(DEAD_VLAN_TAG));
        assert_eq!(r.lifecycle().state("v1"), BindingState::Dead);
    }

    #[tokio::test]
    async fn test_treat_added_ignores_unattached_unknown_device() {
        let h = Harness::new(false).await;
        plug(&h, "v1", OfPort::Unattached);
        let mut r = reconciler(&h);

        assert!(!r.treat_added(&records(&["v1"])).await);
        assert!(h.int_br().calls().is_empty());
        assert_eq!(r.lifecycle().state("v1"), BindingState::Unbound);
    }

    #[tokio::test]
    async fn test_treat_added_vanished_port() {
        let h = Harness::new(false).await;
        h.rpc.set_details(known("v1", "net-1", NetworkType::Local, None, None));
        let mut r = reconciler(&h);

        assert!(!r.treat_added(&records(&["v1"])).await);
        assert!(r.lifecycle().allocator().is_empty());
    }

    #[tokio::test]
    async fn test_treat_added_pool_exhausted_requests_resync() {
        let h = Harness::new(false).await;
        plug(&h, "v1", OfPort::Attached(5));
        plug(&h, "v2", OfPort::Attached(6));
        h.rpc.set_details(known("v1", "net-1", NetworkType::Local, None, None));
        h.rpc.set_details(known("v2", "net-2", NetworkType::Local, None, None));
        let mut r = DeviceReconciler::new(
            h.lifecycle_with(VlanAllocator::with_range(1..=1)),
            h.rpc.clone(),
            AGENT_ID,
        );

        assert!(r.treat_added(&records(&["v1", "v2"])).await);
        assert!(matches!(r.lifecycle().state("v1"), BindingState::Bound(_)));
        assert_eq!(r.lifecycle().state("v2"), BindingState::Unbound);
        assert_eq!(h.int_br().tag_of("tapv2"), None);
    }

    #[tokio::test]
    async fn test_treat_removed_device_still_exists() {
        let h = Harness::new(false).await;
        plug(&h, "v1", OfPort::Attached(5));
        h.rpc.set_details(known("v1", "net-1", NetworkType::Local, None, None));
        let mut r = reconciler(&h);
        r.treat_added(&records(&["v1"])).await;

        h.rpc.set_still_exists("v1");
        assert!(!r.treat_removed(&records(&["v1"])).await);
        assert!(r.lifecycle().allocator().get("net-1").is_some());
    }

    #[tokio::test]
    async fn test_treat_removed_unbinds() {
        let h = Harness::new(false).await;
        plug(&h, "v1", OfPort::Attached(5));
        h.rpc.set_details(known("v1", "net-1", NetworkType::Local, None, None));
        let mut r = reconciler(&h);
        r.treat_added(&records(&["v1"])).await;

        assert!(!r.treat_removed(&records(&["v1"])).await);
        assert!(r.lifecycle().allocator().get("net-1").is_none());
        assert_eq!(r.lifecycle().state("v1"), BindingState::Unbound);
    }

    #[tokio::test]
    async fn test_treat_removed_transport_error() {
        let h = Harness::new(false).await;
        plug(&h, "v1", OfPort::Attached(5));
        h.rpc.set_details(known("v1", "net-1", NetworkType::Local, None, None));
        let mut r = reconciler(&h);
        r.treat_added(&records(&["v1"])).await;

        h.rpc.fail_down("v1");
        assert!(r.treat_removed(&records(&["v1"])).await);
        assert!(r.lifecycle().allocator().get("net-1").is_some());
        assert_eq!(r.take_unconfirmed_removals(), records(&["v1"]));
        assert!(r.take_unconfirmed_removals().is_empty());

        h.rpc.recover_down("v1");
        assert!(!r.treat_removed(&records(&["v1"])).await);
        assert!(r.lifecycle().allocator().is_empty());
        assert!(r.take_unconfirmed_removals().is_empty());
    }

    #[tokio::test]
    async fn test_treat_added_switch_failure_resyncs() {
        let h = Harness::new(false).await;
        plug(&h, "v1", OfPort::Attached(5));
        h.rpc.set_details(known("v1", "net-1", NetworkType::Local, None, None));
        h.int_br().fail_tagging(true);
        let mut r = reconciler(&h);

        assert!(r.treat_added(&records(&["v1"])).await);
        assert_eq!(r.lifecycle().state("v1"), BindingState::Unbound);

        h.int_br().fail_tagging(false);
        assert!(!r.treat_added(&records(&["v1"])).await);
        assert!(matches!(r.lifecycle().state("v1"), BindingState::Bound(_)));
    }

    #[tokio::test]
    async fn test_treat_added_permanent_failure_not_retried() {
        let h = Harness::new(false).await;
        h.int_br().plug(vif("br-x", "tapv1", "v1", OfPort::Attached(5), "fa:16:3e:00:00:01"));
        h.rpc.set_details(known("v1", "net-1", NetworkType::Local, None, None));
        let mut r = reconciler(&h);

        assert!(!r.treat_added(&records(&["v1"])).await);
        assert_eq!(r.lifecycle().state("v1"), BindingState::Unbound);
        assert!(h.int_br().calls().is_empty());
    }

    #[tokio::test]
    async fn test_process_unchanged_makes_no_calls() {
        let h = Harness::new(false).await;
        let mut r = reconciler(&h);

        assert!(!r.process(&PortDiff::Unchanged).await);
        assert!(h.rpc.calls().is_empty());
    }

    #[tokio::test]
    async fn test_process_adds_before_removing() {
        let h = Harness::new(false).await;
        plug(&h, "new", OfPort::Attached(5));
        h.rpc.set_details(known("new", "net-1", NetworkType::Local, None, None));
        let mut r = reconciler(&h);

        let diff = PortDiff::Changed {
            current: records(&["new"]),
            added: records(&["new"]),
            removed: records(&["old"]),
        };
        assert!(!r.process(&diff).await);
        assert_eq!(
            h.rpc.calls(),
            vec![
                RpcCall::GetDeviceDetails("new".to_string()),
                RpcCall::UpdateDeviceDown("old".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_process_ors_both_results() {
        let h = Harness::new(false).await;
        h.rpc.fail_down("old");
        let mut r = reconciler(&h);

        let diff = PortDiff::Changed {
            current: HashSet::new(),
            added: HashSet::new(),
            removed: records(&["old"]),
        };
        assert!(r.process(&diff).await);
    }

    #[tokio::test]
    async fn test_process_keeps_renumbered_device() {
        let h = Harness::new(false).await;
        plug(&h, "v1", OfPort::Attached(9));
        h.rpc.set_details(known("v1", "net-1", NetworkType::Local, None, None));
        let mut r = reconciler(&h);

        let old = PortRecord::new("br-int", "v1", OfPort::Unattached);
        let new = PortRecord::new("br-int", "v1", OfPort::Attached(9));
        let diff = PortDiff::Changed {
            current: HashSet::from([new.clone()]),
            added: HashSet::from([new]),
            removed: HashSet::from([old]),
        };
        assert!(!r.process(&diff).await);
        assert!(matches!(r.lifecycle().state("v1"), BindingState::Bound(_)));
        assert_eq!(h.rpc.calls(), vec![RpcCall::GetDeviceDetails("v1".to_string())]);
    }
}
