use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;

use super::rule::IptablesCommand;

#[derive(Debug, thiserror::Error)]
pub enum IptablesError {
    #[error("failed to run {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with status {status}: {stderr}")]
    Exit {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("`{command}` rejected: {reason}")]
    Rejected { command: String, reason: String },
}

impl IptablesError {
    /// iptables exits with 1 when the chain or rule named does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, IptablesError::Exit { status: 1, .. })
    }
}

/// Runs packet-filter commands and returns their standard output.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &IptablesCommand) -> Result<String, IptablesError>;
}

/// Executes commands with the host's iptables binary.
pub struct SystemExecutor {
    binary: PathBuf,
}

impl SystemExecutor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for SystemExecutor {
    fn default() -> Self {
        Self::new(pkg_constants::paths::DEFAULT_IPTABLES_PATH)
    }
}

#[async_trait]
impl CommandExecutor for SystemExecutor {
    async fn execute(&self, command: &IptablesCommand) -> Result<String, IptablesError> {
        let output = Command::new(&self.binary)
            .args(command.args())
            .output()
            .await
            .map_err(|source| IptablesError::Spawn {
                binary: self.binary.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(IptablesError::Exit {
                command: command.to_string(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
