//! Control-plane RPC.
//!
//! [`PluginRpc`] is the contract the reconciliation engine consumes.
//! [`HttpPluginClient`] implements it over JSON/HTTP. Responses with
//! optional fields are resolved into [`DeviceDetails`] here, once, so the
//! rest of the agent never inspects raw payloads.

use async_trait::async_trait;
use ovs_types::NetworkType;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::error::{AgentError, AgentResult};

/// Resolution of a device id by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceDetails {
    /// The device belongs to a network this agent can wire.
    Known {
        device: String,
        port_id: String,
        network_id: String,
        network_type: NetworkType,
        segmentation_id: Option<u32>,
        physical_network: Option<String>,
        admin_state_up: bool,
    },
    /// The control plane has no usable record of the device.
    Unknown { device: String },
}

impl DeviceDetails {
    pub fn device(&self) -> &str {
        match self {
            DeviceDetails::Known { device, .. } | DeviceDetails::Unknown { device } => device,
        }
    }
}

/// Raw `get_device_details` payload. Every field but `device` is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceDetailsResponse {
    pub device: String,
    #[serde(default)]
    pub port_id: Option<String>,
    #[serde(default)]
    pub network_id: Option<String>,
    #[serde(default)]
    pub network_type: Option<String>,
    #[serde(default)]
    pub segmentation_id: Option<u32>,
    #[serde(default)]
    pub physical_network: Option<String>,
    #[serde(default)]
    pub admin_state_up: Option<bool>,
}

impl DeviceDetailsResponse {
    /// Resolves the payload.
    ///
    /// A response is `Known` only when it names a port, a network and a
    /// supported network type together with the segment fields that type
    /// requires.
    pub fn resolve(self) -> DeviceDetails {
        let unknown = |device: String| DeviceDetails::Unknown { device };

        let (Some(port_id), Some(network_id), Some(raw_type)) =
            (self.port_id, self.network_id, self.network_type)
        else {
            return unknown(self.device);
        };

        let network_type = match raw_type.parse::<NetworkType>() {
            Ok(t) => t,
            Err(e) => {
                warn!(device = %self.device, error = %e, "Unsupported network type");
                return unknown(self.device);
            }
        };

        let complete = match network_type {
            NetworkType::Flat => self.physical_network.is_some(),
            NetworkType::Vlan => {
                self.physical_network.is_some() && self.segmentation_id.is_some()
            }
            NetworkType::Gre => self.segmentation_id.is_some(),
            NetworkType::Local => true,
        };
        if !complete {
            warn!(
                device = %self.device,
                network_type = %network_type,
                "Device details lack segment information"
            );
            return unknown(self.device);
        }

        DeviceDetails::Known {
            device: self.device,
            port_id,
            network_id,
            network_type,
            segmentation_id: self.segmentation_id,
            physical_network: self.physical_network,
            admin_state_up: self.admin_state_up.unwrap_or(true),
        }
    }
}

/// Result of `update_device_down`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDownResult {
    /// The device is still known to the control plane.
    pub exists: bool,
}

/// A remote tunnel endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEndpoint {
    pub id: u32,
    pub ip_address: IpAddr,
}

/// Heartbeat payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    pub binary: String,
    pub host: String,
    pub topic: String,
    pub agent_type: String,
    pub configurations: AgentConfigurations,
    /// Present only on the first report after process start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_flag: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfigurations {
    pub bridge_mappings: BTreeMap<String, String>,
    pub devices: usize,
}

/// Calls the agent makes on the control plane.
///
/// Every failure is an [`AgentError::Transport`]; no call is retried here.
#[async_trait]
pub trait PluginRpc: Send + Sync {
    async fn get_device_details(&self, device: &str, agent_id: &str)
        -> AgentResult<DeviceDetails>;

    async fn update_device_down(
        &self,
        device: &str,
        agent_id: &str,
    ) -> AgentResult<DeviceDownResult>;

    async fn update_device_up(&self, device: &str, agent_id: &str) -> AgentResult<()>;

    async fn report_state(&self, state: &AgentState) -> AgentResult<()>;

    async fn tunnel_sync(&self, local_ip: IpAddr) -> AgentResult<Vec<TunnelEndpoint>>;
}

#[derive(Serialize)]
struct AgentRequest<'a> {
    agent_id: &'a str,
}

#[derive(Serialize)]
struct TunnelSyncRequest {
    tunnel_ip: IpAddr,
}

#[derive(Deserialize)]
struct TunnelSyncResponse {
    #[serde(default)]
    tunnels: Vec<TunnelEndpoint>,
}

#[derive(Serialize)]
struct ReportStateRequest<'a> {
    agent_state: &'a AgentState,
}

/// JSON/HTTP implementation of [`PluginRpc`].
pub struct HttpPluginClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPluginClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> AgentResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::configuration("control_plane", e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B, R>(&self, operation: &str, path: &str, body: &B) -> AgentResult<R>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let url = self.url(path);
        debug!(operation, url = %url, "Calling control plane");

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::transport(operation, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(operation, status = %status, body = %body, "Control plane call failed");
            return Err(AgentError::transport(
                operation,
                format!("{} - {}", status, body),
            ));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| AgentError::transport(operation, e))
    }
}

#[async_trait]
impl PluginRpc for HttpPluginClient {
    async fn get_device_details(
        &self,
        device: &str,
        agent_id: &str,
    ) -> AgentResult<DeviceDetails> {
        let response: DeviceDetailsResponse = self
            .post(
                "get_device_details",
                &format!("/v1/devices/{}/details", device),
                &AgentRequest { agent_id },
            )
            .await?;
        Ok(response.resolve())
    }

    async fn update_device_down(
        &self,
        device: &str,
        agent_id: &str,
    ) -> AgentResult<DeviceDownResult> {
        self.post(
            "update_device_down",
            &format!("/v1/devices/{}/down", device),
            &AgentRequest { agent_id },
        )
        .await
    }

    async fn update_device_up(&self, device: &str, agent_id: &str) -> AgentResult<()> {
        let _: serde_json::Value = self
            .post(
                "update_device_up",
                &format!("/v1/devices/{}/up", device),
                &AgentRequest { agent_id },
            )
            .await?;
        Ok(())
    }

    async fn report_state(&self, state: &AgentState) -> AgentResult<()> {
        let _: serde_json::Value = self
            .post(
                "report_state",
                "/v1/agents/state",
                &ReportStateRequest { agent_state: state },
            )
            .await?;
        Ok(())
    }

    async fn tunnel_sync(&self, local_ip: IpAddr) -> AgentResult<Vec<TunnelEndpoint>> {
        let response: TunnelSyncResponse = self
            .post(
                "tunnel_sync",
                "/v1/tunnels/sync",
                &TunnelSyncRequest { tunnel_ip: local_ip },
            )
            .await?;
        Ok(response.tunnels)
    }
}
