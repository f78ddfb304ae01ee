//! Common infrastructure for the Open vSwitch agent.
//!
//! - [`shell`]: Safe shell command execution with proper quoting
//! - [`error`]: Error types for switch and host command operations
//!
//! The agent drives Open vSwitch and the host link layer exclusively through
//! the `ovs-vsctl`, `ovs-ofctl` and `ip` tools, so every side effect on the
//! switch ends up in [`shell::exec`].
//!
//! # Example
//!
//! ```ignore
//! use ovs_agent_common::{shell::{self, OVS_VSCTL_CMD, shellquote}, OvsResult};
//!
//! async fn tag_port(port: &str, tag: u16) -> OvsResult<()> {
//!     let cmd = format!("{} --timeout=2 set Port {} tag={}",
//!         OVS_VSCTL_CMD, shellquote(port), tag);
//!     shell::exec_or_throw(&cmd).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod shell;

pub use error::{OvsError, OvsResult};
