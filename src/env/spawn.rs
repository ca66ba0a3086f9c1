// src/env/spawn.rs
//! Spawning and terminating subordinate node processes.
//!
//! Slave environments run as child processes of the current binary; remote
//! nodes run behind an `ssh` child whose connection stays open for the
//! node's lifetime.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::utils::errors::{AgoraError, Result};

/// Grace period between SIGTERM and SIGKILL during teardown
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Re-execute the current binary with the given arguments
///
/// Stdout and stderr are inherited so subordinate logs end up in the parent
/// process's stream.
pub fn spawn_node_process(args: &[String]) -> Result<Child> {
    let exe = std::env::current_exe()
        .map_err(|e| AgoraError::SpawnFailed(format!("cannot resolve current executable: {}", e)))?;

    debug!(?exe, ?args, "spawning node process");
    let child = Command::new(exe)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AgoraError::SpawnFailed(e.to_string()))?;

    debug!(pid = ?child.id(), "node process spawned");
    Ok(child)
}

/// Arguments for an `ssh` invocation executing `command` on `host`
///
/// `BatchMode` is forced: node spawning assumes passwordless access and
/// must fail fast instead of prompting.
pub fn ssh_args(host: &str, ssh_port: u16, command: &str) -> Vec<String> {
    vec![
        "-p".to_string(),
        ssh_port.to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        host.to_string(),
        command.to_string(),
    ]
}

/// Execute a command line on a remote host over SSH
///
/// The returned child is the SSH connection itself; it stays open until the
/// remote command finishes or the child is terminated.
pub fn spawn_ssh_process(host: &str, ssh_port: u16, command: &str) -> Result<Child> {
    let args = ssh_args(host, ssh_port, command);
    debug!(host, ssh_port, command, "spawning remote node over ssh");
    let child = Command::new("ssh")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AgoraError::SpawnFailed(format!("ssh to {}: {}", host, e)))?;

    debug!(pid = ?child.id(), host, "ssh process spawned");
    Ok(child)
}

/// Terminate a child: SIGTERM, a grace period, then SIGKILL
pub async fn terminate(child: &mut Child, grace: Duration) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        // Already reaped
        return;
    };
    let pid = Pid::from_raw(pid as i32);

    debug!(%pid, "sending SIGTERM");
    if let Err(e) = kill(pid, Signal::SIGTERM) {
        warn!(%pid, "failed to send SIGTERM: {}", e);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(%pid, %status, "child exited");
            return;
        }
        Ok(Err(e)) => {
            warn!(%pid, "error waiting for child: {}", e);
        }
        Err(_) => {
            debug!(%pid, "child still alive, sending SIGKILL");
        }
    }

    if let Err(e) = child.kill().await {
        warn!(%pid, "failed to kill child: {}", e);
    }
    let _ = child.wait().await;
}
