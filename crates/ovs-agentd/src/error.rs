//! Error types for the agent.
//!
//! The variants follow how far a failure is allowed to travel:
//!
//! - [`AgentError::PoolExhausted`] stays inside one bind attempt.
//! - [`AgentError::Transport`] is converted into the cycle resync flag by
//!   the device reconciler and never escapes a polling cycle.
//! - [`AgentError::Configuration`] and [`AgentError::Topology`] are fatal at
//!   startup.
//!
//! Unbind requests for VIFs the agent does not track are not errors at all;
//! they are logged at debug level and ignored.

use ovs_agent_common::OvsError;
use thiserror::Error;

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors raised by the agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// No local VLAN id left for a new network.
    #[error("No local VLAN available for network {network_id}")]
    PoolExhausted {
        /// Network that could not be provisioned.
        network_id: String,
    },

    /// A control-plane call failed.
    #[error("Control plane call {operation} failed: {message}")]
    Transport {
        /// RPC operation (e.g. "get_device_details").
        operation: String,
        /// Error message.
        message: String,
    },

    /// Invalid startup parameters.
    #[error("Invalid configuration for {field}: {message}")]
    Configuration {
        /// The offending configuration key.
        field: String,
        /// Error message.
        message: String,
    },

    /// A host device required by the bridge topology is missing.
    #[error("Topology error on {device}: {message}")]
    Topology {
        /// Bridge, port, or link name.
        device: String,
        /// Error message.
        message: String,
    },

    /// Switch or link command failed.
    #[error(transparent)]
    Switch(#[from] OvsError),
}

impl AgentError {
    /// Creates a transport error.
    pub fn transport(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Creates a configuration error.
    pub fn configuration(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a topology error.
    pub fn topology(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Topology {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Returns true if the process must not keep running after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::Configuration { .. } | AgentError::Topology { .. }
        )
    }

    /// Returns true if the failed step may succeed when the device is
    /// processed again on a later cycle.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::PoolExhausted { .. } | AgentError::Transport { .. } => true,
            AgentError::Switch(e) => e.is_retryable(),
            AgentError::Configuration { .. } | AgentError::Topology { .. } => false,
        }
    }
}
