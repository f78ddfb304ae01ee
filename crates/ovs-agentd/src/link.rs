//! Host link layer (`ip link`) operations used for physical bridge wiring.

use async_trait::async_trait;
use ovs_agent_common::{shell, OvsError, OvsResult};
use ovs_types::MacAddress;

use crate::commands::*;

/// Sysfs directory holding one entry per network device.
const SYS_CLASS_NET: &str = "/sys/class/net";

/// Host network device operations.
#[async_trait]
pub trait LinkLayer: Send + Sync {
    async fn device_exists(&self, name: &str) -> OvsResult<bool>;

    /// Creates a veth pair `local` <-> `peer`.
    async fn add_veth(&self, local: &str, peer: &str) -> OvsResult<()>;

    async fn delete_link(&self, name: &str) -> OvsResult<()>;

    async fn set_up(&self, name: &str) -> OvsResult<()>;

    async fn interface_mac(&self, name: &str) -> OvsResult<MacAddress>;
}

/// [`LinkLayer`] backed by iproute2 and sysfs.
#[derive(Debug, Clone, Default)]
pub struct IpLink {
    root_helper: Option<String>,
}

impl IpLink {
    pub fn new(root_helper: Option<String>) -> Self {
        Self { root_helper }
    }

    fn privileged(&self, cmd: &str) -> String {
        shell::with_root_helper(self.root_helper.as_deref(), cmd)
    }
}

#[async_trait]
impl LinkLayer for IpLink {
    async fn device_exists(&self, name: &str) -> OvsResult<bool> {
        let result = shell::exec(&build_link_show_cmd(name)).await?;
        Ok(result.success())
    }

    async fn add_veth(&self, local: &str, peer: &str) -> OvsResult<()> {
        shell::exec_or_throw(&self.privileged(&build_add_veth_cmd(local, peer))).await?;
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> OvsResult<()> {
        shell::exec_or_throw(&self.privileged(&build_link_delete_cmd(name))).await?;
        Ok(())
    }

    async fn set_up(&self, name: &str) -> OvsResult<()> {
        shell::exec_or_throw(&self.privileged(&build_link_set_up_cmd(name))).await?;
        Ok(())
    }

    async fn interface_mac(&self, name: &str) -> OvsResult<MacAddress> {
        let path = format!("{}/{}/address", SYS_CLASS_NET, name);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| OvsError::internal(format!("cannot read {}: {}", path, e)))?;
        raw.parse::<MacAddress>()
            .map_err(|e| OvsError::parse("interface MAC", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_device() {
        let link = IpLink::default();
        assert!(!link
            .device_exists("ovs-agent-test-no-such-dev")
            .await
            .unwrap());
        assert!(link.interface_mac("ovs-agent-test-no-such-dev").await.is_err());
    }

    #[test]
    fn test_root_helper_prefix() {
        let link = IpLink::new(Some("sudo".to_string()));
        assert_eq!(
            link.privileged("/sbin/ip link set \"eth1\" up"),
            "sudo /sbin/ip link set \"eth1\" up"
        );
    }
}
