//! Configuration file support for ovs-agentd
//!
//! Loads and validates agent configuration from TOML files.
//! Default location: /etc/ovs-agent/ovs_agent.toml

use crate::error::{AgentError, AgentResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ovs-agent/ovs_agent.toml";

/// Switch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OvsConfig {
    /// Bridge guest VIFs attach to
    #[serde(default = "default_integration_bridge")]
    pub integration_bridge: String,

    /// Bridge holding GRE tunnel ports
    #[serde(default = "default_tunnel_bridge")]
    pub tunnel_bridge: String,

    /// Patch port on the integration bridge towards the tunnel bridge
    #[serde(default = "default_int_peer_patch_port")]
    pub int_peer_patch_port: String,

    /// Patch port on the tunnel bridge towards the integration bridge
    #[serde(default = "default_tun_peer_patch_port")]
    pub tun_peer_patch_port: String,

    #[serde(default)]
    pub enable_tunneling: bool,

    /// Local tunnel endpoint address. Required when tunneling is enabled.
    #[serde(default)]
    pub local_ip: Option<IpAddr>,

    /// `physical_network:bridge` entries
    #[serde(default)]
    pub bridge_mappings: Vec<String>,

    /// Secondary integration bridge for an isolated execution domain
    #[serde(default)]
    pub domu_integration_bridge: Option<String>,
}

/// Agent loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Seconds between polls of the integration bridge
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,

    /// Seconds between heartbeats; 0 disables them
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,

    /// Command prefix for privileged tools (e.g. "sudo")
    #[serde(default)]
    pub root_helper: Option<String>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Control plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    #[serde(default = "default_control_plane_url")]
    pub url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Host name reported in heartbeats
    #[serde(default = "default_host")]
    pub host: String,
}

/// Complete agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub ovs: OvsConfig,

    #[serde(default)]
    pub agent: AgentSection,

    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
}

// Default functions
fn default_integration_bridge() -> String {
    "br-int".to_string()
}

fn default_tunnel_bridge() -> String {
    "br-tun".to_string()
}

fn default_int_peer_patch_port() -> String {
    "patch-tun".to_string()
}

fn default_tun_peer_patch_port() -> String {
    "patch-int".to_string()
}

fn default_polling_interval() -> u64 {
    2
}

fn default_report_interval() -> u64 {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_control_plane_url() -> String {
    "http://127.0.0.1:9696".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_host() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

// Default implementations
impl Default for OvsConfig {
    fn default() -> Self {
        Self {
            integration_bridge: default_integration_bridge(),
            tunnel_bridge: default_tunnel_bridge(),
            int_peer_patch_port: default_int_peer_patch_port(),
            tun_peer_patch_port: default_tun_peer_patch_port(),
            enable_tunneling: false,
            local_ip: None,
            bridge_mappings: Vec::new(),
            domu_integration_bridge: None,
        }
    }
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            polling_interval_secs: default_polling_interval(),
            report_interval_secs: default_report_interval(),
            root_helper: None,
            log_level: default_log_level(),
        }
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            url: default_control_plane_url(),
            timeout_secs: default_timeout(),
            host: default_host(),
        }
    }
}

/// Parses `physical_network:bridge` entries.
///
/// Each physical network and each bridge may appear only once.
pub fn parse_mappings(entries: &[String]) -> AgentResult<BTreeMap<String, String>> {
    let mut mappings = BTreeMap::new();
    let mut bridges = HashSet::new();

    for entry in entries {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (physnet, bridge) = entry.split_once(':').ok_or_else(|| {
            AgentError::configuration(
                "ovs.bridge_mappings",
                format!("invalid mapping '{}', expected physical_network:bridge", entry),
            )
        })?;
        let (physnet, bridge) = (physnet.trim(), bridge.trim());
        if physnet.is_empty() || bridge.is_empty() {
            return Err(AgentError::configuration(
                "ovs.bridge_mappings",
                format!("missing physical network or bridge in '{}'", entry),
            ));
        }
        if mappings.contains_key(physnet) {
            return Err(AgentError::configuration(
                "ovs.bridge_mappings",
                format!("duplicate physical network '{}'", physnet),
            ));
        }
        if !bridges.insert(bridge.to_string()) {
            return Err(AgentError::configuration(
                "ovs.bridge_mappings",
                format!("duplicate bridge '{}'", bridge),
            ));
        }
        mappings.insert(physnet.to_string(), bridge.to_string());
    }

    Ok(mappings)
}

impl AgentConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> AgentResult<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                AgentError::configuration(
                    "config_file",
                    format!("failed to parse {}: {}", path.display(), e),
                )
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                eprintln!(
                    "ovs-agentd: Config file {} not found, using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(e) => Err(AgentError::configuration(
                "config_file",
                format!("failed to read {}: {}", path.display(), e),
            )),
        }
    }

    /// Get polling interval as Duration
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.agent.polling_interval_secs)
    }

    /// Get heartbeat interval as Duration, `None` when disabled
    pub fn report_interval(&self) -> Option<Duration> {
        match self.agent.report_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Get control plane request timeout as Duration
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.control_plane.timeout_secs)
    }

    /// Parsed bridge mappings
    pub fn bridge_mappings(&self) -> AgentResult<BTreeMap<String, String>> {
        parse_mappings(&self.ovs.bridge_mappings)
    }

    /// Validate configuration
    pub fn validate(&self) -> AgentResult<()> {
        if self.ovs.enable_tunneling && self.ovs.local_ip.is_none() {
            return Err(AgentError::configuration(
                "ovs.local_ip",
                "tunneling is enabled but no local_ip is configured",
            ));
        }

        if self.agent.polling_interval_secs == 0 {
            return Err(AgentError::configuration(
                "agent.polling_interval_secs",
                "must be > 0",
            ));
        }

        if self.ovs.integration_bridge.trim().is_empty() {
            return Err(AgentError::configuration(
                "ovs.integration_bridge",
                "must not be empty",
            ));
        }

        self.bridge_mappings()?;

        Ok(())
    }
}
