// External command execution for the wg / ipset / iptables reconcilers

use crate::error::CommandError;
use async_trait::async_trait;
use tokio::process::Command;

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args` and returns stdout. Non-zero exit is an error.
    async fn run(&self, program: &str, args: &[String]) -> Result<String, CommandError>;
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommand;

#[async_trait]
impl CommandRunner for SystemCommand {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, CommandError> {
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CommandError::Spawn {
                command: display(program, args),
                source,
            })?;
        if !output.status.success() {
            return Err(CommandError::Failed {
                command: display(program, args),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

pub fn display(program: &str, args: &[String]) -> String {
    let mut s = program.to_string();
    for a in args {
        s.push(' ');
        s.push_str(a);
    }
    s
}

/// Builds an owned argument list from string slices.
pub fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}
