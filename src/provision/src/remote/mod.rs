//! Remote execution against the two cluster roles.
//!
//! Every orchestration step talks to either the cluster-manager node or the
//! compute node through [`RemoteExecutor`]. Transport failures are never
//! retried here; the caller aborts the current step.

pub mod commands;
pub mod ssh;

use crate::provisioner::ProvisionError;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use ssh::SshExecutor;

/// Logical remote host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteTarget {
    ClusterManager,
    Compute,
}

impl RemoteTarget {
    pub fn default_role_pattern(&self) -> &'static str {
        match self {
            RemoteTarget::ClusterManager => r"^cm-.+\.sos\.ethz\.ch$",
            RemoteTarget::Compute => r"^comp-.+\.sos\.ethz\.ch$",
        }
    }
}

impl std::fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteTarget::ClusterManager => f.write_str("cluster-manager"),
            RemoteTarget::Compute => f.write_str("compute"),
        }
    }
}

/// Output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty stderr line, for error messages.
    pub fn last_error_line(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("No output available")
            .to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Failed to start ssh for {target}: {source}")]
    Spawn {
        target: RemoteTarget,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to {target} failed: {message}")]
    Transport {
        target: RemoteTarget,
        message: String,
    },

    #[error("Command on {target} exited with {exit_code}: `{command}`: {stderr}")]
    CommandFailed {
        target: RemoteTarget,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Command on {target} timed out after {secs}s: `{command}`")]
    Timeout {
        target: RemoteTarget,
        command: String,
        secs: u64,
    },

    #[error("No {0} host configured")]
    NotConfigured(RemoteTarget),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lines streamed from a long-running remote command. The stream ends when
/// the command exits; dropping the receiver stops the command.
pub type LineStream = mpsc::Receiver<Result<String, RemoteError>>;

/// Command and file access on a remote target.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(&self, target: RemoteTarget, command: &str) -> Result<CommandOutput, RemoteError>;

    /// Like [`run`](Self::run) but a non-zero exit is an error.
    async fn run_checked(
        &self,
        target: RemoteTarget,
        command: &str,
    ) -> Result<CommandOutput, RemoteError> {
        let output = self.run(target, command).await?;
        if !output.success() {
            return Err(RemoteError::CommandFailed {
                target,
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.last_error_line(),
            });
        }
        Ok(output)
    }

    /// Create or truncate `path` and write `contents` to it.
    async fn write_file(
        &self,
        target: RemoteTarget,
        path: &str,
        contents: &[u8],
    ) -> Result<(), RemoteError>;

    async fn read_file(&self, target: RemoteTarget, path: &str) -> Result<Vec<u8>, RemoteError>;

    async fn file_exists(&self, target: RemoteTarget, path: &str) -> Result<bool, RemoteError>;

    async fn remove_file(&self, target: RemoteTarget, path: &str) -> Result<(), RemoteError>;

    async fn stream_lines(
        &self,
        target: RemoteTarget,
        command: &str,
    ) -> Result<LineStream, RemoteError>;
}

/// Check that `target` really is the role it is configured as.
///
/// Runs `hostname --fqdn` and matches the answer against `pattern`.
pub async fn verify_role(
    executor: &dyn RemoteExecutor,
    target: RemoteTarget,
    pattern: &Regex,
) -> Result<String, ProvisionError> {
    let output = executor
        .run_checked(target, commands::hostname_query())
        .await?;
    let hostname = output.stdout.trim().to_string();

    if !pattern.is_match(&hostname) {
        return Err(ProvisionError::RoleMismatch {
            target: target.to_string(),
            hostname,
            pattern: pattern.as_str().to_string(),
        });
    }

    tracing::info!("[Remote] {} host verified as {}", target, hostname);
    Ok(hostname)
}
