//! External command execution
//!
//! Drivers reach local tools (rbd, ceph, mount, umount, replication tools)
//! through a [`CommandRunner`]. Every invocation carries a timeout and
//! captures stdout and stderr.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

/// Captured output of a successful command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs external programs on behalf of drivers
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`; a non-zero exit is an error carrying the combined output
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

pub type CommandRunnerRef = Arc<dyn CommandRunner>;

/// Runs commands on the local host
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let line = command_line(program, args);
        debug!("Running command: {}", line);

        let started = Instant::now();
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(Error::CommandFailed {
                    command: line,
                    output: e.to_string(),
                })
            }
            Err(_) => {
                return Err(Error::Timeout {
                    operation: format!("command {}", program),
                    elapsed: started.elapsed(),
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: line,
                output: combined(&stdout, &stderr),
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }
}

/// Program and arguments as one loggable line
pub fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

fn combined(stdout: &str, stderr: &str) -> String {
    match (stdout.trim(), stderr.trim()) {
        ("", err) => err.to_string(),
        (out, "") => out.to_string(),
        (out, err) => format!("{}\n{}", out, err),
    }
}
