//! Shell command execution for switch and link programming.
//!
//! Commands are assembled as strings by the callers (see the command
//! builders in the agent crate) and run through `/bin/sh -c`. Any value that
//! originates outside the agent (port names, bridge names, MACs reported by
//! OVSDB) must pass through [`shellquote`] before it is interpolated.
//!
//! Privileged tools are optionally prefixed with a root helper such as
//! `sudo`; see [`with_root_helper`].

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{OvsError, OvsResult};

/// Path to the `ovs-vsctl` command for OVSDB configuration.
pub const OVS_VSCTL_CMD: &str = "/usr/bin/ovs-vsctl";

/// Path to the `ovs-ofctl` command for OpenFlow table programming.
pub const OVS_OFCTL_CMD: &str = "/usr/bin/ovs-ofctl";

/// Path to the `ip` command for host link configuration.
pub const IP_CMD: &str = "/sbin/ip";

/// Timeout passed to every `ovs-vsctl` invocation, in seconds.
pub const VSCTL_TIMEOUT_SECS: u32 = 2;

/// Characters that need escaping inside shell double quotes:
/// `$`, `` ` ``, `"`, `\` and newline.
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// ```
/// use ovs_agent_common::shell::shellquote;
///
/// assert_eq!(shellquote("tap0"), "\"tap0\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Prefixes `cmd` with the configured root helper, if any.
///
/// ```
/// use ovs_agent_common::shell::with_root_helper;
///
/// assert_eq!(with_root_helper(Some("sudo"), "ip link"), "sudo ip link");
/// assert_eq!(with_root_helper(None, "ip link"), "ip link");
/// assert_eq!(with_root_helper(Some("  "), "ip link"), "ip link");
/// ```
pub fn with_root_helper(root_helper: Option<&str>, cmd: &str) -> String {
    match root_helper.map(str::trim) {
        Some(helper) if !helper.is_empty() => format!("{} {}", helper, cmd),
        _ => cmd.to_string(),
    }
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// The trimmed stdout output.
    pub stdout: String,
    /// The trimmed stderr output.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Executes a shell command asynchronously.
///
/// A non-zero exit status is not an error here; inspect
/// [`ExecResult::success`] or use [`exec_or_throw`].
///
/// # Errors
///
/// Returns [`OvsError::ShellExec`] if the shell could not be spawned.
pub async fn exec(cmd: &str) -> OvsResult<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| OvsError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let result = ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    if result.success() {
        tracing::trace!(command = %cmd, "Command succeeded");
    } else {
        tracing::warn!(
            command = %cmd,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

/// Executes a shell command and fails on non-zero exit.
///
/// # Returns
///
/// * `Ok(String)` - The stdout output on success
/// * `Err(OvsError)` - If the command fails or returns non-zero
pub async fn exec_or_throw(cmd: &str) -> OvsResult<String> {
    let result = exec(cmd).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(OvsError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}
