//! Remote execution channel used to stage and launch node processes.

use std::path::Path;
use std::process::{Command, Output, Stdio};

use crate::cli::config::Node;
use crate::engine::distributed::NodeError;

/// Moves files to a node and runs commands there.
pub trait RemoteChannel: Send + Sync {
    fn transfer(&self, node: &Node, local: &Path, remote: &str) -> Result<(), NodeError>;

    /// Run `command` in the node's login directory and return its stdout.
    fn execute(&self, node: &Node, command: &str) -> Result<Vec<u8>, NodeError>;
}

/// Drives the system `ssh` and `scp` clients with key authentication.
#[derive(Debug, Clone)]
pub struct SshChannel {
    ssh: String,
    scp: String,
    connect_timeout_secs: u64,
}

impl Default for SshChannel {
    fn default() -> Self {
        Self {
            ssh: "ssh".to_string(),
            scp: "scp".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl SshChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn common_options(&self, node: &Node) -> Vec<String> {
        vec![
            "-i".to_string(),
            node.ssh_key.display().to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ]
    }

    pub fn scp_command(&self, node: &Node, local: &Path, remote: &str) -> Command {
        let mut cmd = Command::new(&self.scp);
        cmd.args(self.common_options(node))
            .arg("-P")
            .arg(node.port.to_string())
            // keep the executable bit on the staged binary
            .arg("-p")
            .arg(local)
            .arg(format!("{}@{}:{}", node.user, node.host, remote));
        cmd
    }

    pub fn ssh_command(&self, node: &Node, command: &str) -> Command {
        let mut cmd = Command::new(&self.ssh);
        cmd.args(self.common_options(node))
            .arg("-p")
            .arg(node.port.to_string())
            .arg(format!("{}@{}", node.user, node.host))
            .arg(command);
        cmd
    }
}

fn run(node: &Node, mut cmd: Command) -> Result<Output, NodeError> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|source| NodeError::Spawn {
            host: node.host.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(NodeError::CommandFailed {
            host: node.host.clone(),
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

impl RemoteChannel for SshChannel {
    fn transfer(&self, node: &Node, local: &Path, remote: &str) -> Result<(), NodeError> {
        tracing::debug!(host = %node.host, local = %local.display(), remote, "scp");
        run(node, self.scp_command(node, local, remote))
            .map(|_| ())
            .map_err(|e| NodeError::Transfer {
                file: remote.to_string(),
                source: Box::new(e),
            })
    }

    fn execute(&self, node: &Node, command: &str) -> Result<Vec<u8>, NodeError> {
        tracing::debug!(host = %node.host, command, "ssh");
        Ok(run(node, self.ssh_command(node, command))?.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::path::PathBuf;

    fn node() -> Node {
        Node {
            procs: 2,
            host: "10.1.2.3".to_string(),
            port: 2222,
            user: "bench".to_string(),
            ssh_key: PathBuf::from("/keys/id_rsa"),
        }
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(OsStr::to_string_lossy)
            .map(|s| s.into_owned())
            .collect()
    }

    #[test]
    fn test_ssh_command_line() {
        let cmd = SshChannel::new().ssh_command(&node(), "echo hi");
        assert_eq!(cmd.get_program(), "ssh");
        let a = args(&cmd);
        assert_eq!(&a[0..2], ["-i", "/keys/id_rsa"]);
        assert!(a.contains(&"BatchMode=yes".to_string()));
        let p = a.iter().position(|s| s == "-p").unwrap();
        assert_eq!(a[p + 1], "2222");
        assert_eq!(a[a.len() - 2], "bench@10.1.2.3");
        assert_eq!(a[a.len() - 1], "echo hi");
    }

    #[test]
    fn test_scp_command_line() {
        let cmd = SshChannel::new().scp_command(&node(), Path::new("/tmp/snap"), ".hakai.snapshot");
        assert_eq!(cmd.get_program(), "scp");
        let a = args(&cmd);
        let p = a.iter().position(|s| s == "-P").unwrap();
        assert_eq!(a[p + 1], "2222");
        assert_eq!(a[a.len() - 2], "/tmp/snap");
        assert_eq!(a[a.len() - 1], "bench@10.1.2.3:.hakai.snapshot");
    }

    #[test]
    fn test_missing_client_is_a_spawn_error() {
        let channel = SshChannel {
            ssh: "/nonexistent/hakai-ssh".to_string(),
            ..SshChannel::default()
        };
        let err = channel.execute(&node(), "true").unwrap_err();
        assert!(matches!(err, NodeError::Spawn { .. }));
    }
}
