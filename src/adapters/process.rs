//! Process Command Adapter
//!
//! Implements the `CommandRunner` port by spawning a child process.

use async_trait::async_trait;
use tokio::process::Command;

use crate::domain::{CommandOutput, CommandRunner};
use crate::error::{Error, Result};

/// Runs programs from `PATH` and captures stdout + stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessCommandRunner;

#[async_trait]
impl CommandRunner for ProcessCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::StorageCommandFailed {
                command: format!("{} {}", program, args.first().map(String::as_str).unwrap_or("")),
                output: format!("failed to launch: {}", e),
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutput {
            success: output.status.success(),
            output: combined,
        })
    }
}
