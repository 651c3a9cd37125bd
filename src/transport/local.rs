//! GT-011: Local process transport.

use super::{CancelToken, CommandSpec, ExecOutput, Invoker};
use crate::core::error::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Runs commands as child processes of gantry. Children are killed when
/// the run is cancelled.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalInvoker;

#[async_trait]
impl Invoker for LocalInvoker {
    async fn invoke(&self, cmd: &CommandSpec, cancel: &CancelToken) -> Result<ExecOutput> {
        if cancel.is_cancelled() {
            return Err(Error::RunCancelled);
        }
        debug!(command = %cmd, dir = %cmd.working_dir.display(), "spawning");

        let child = Command::new(&cmd.program)
            .args(&cmd.args)
            .current_dir(&cmd.working_dir)
            .envs(&cmd.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::invocation(&cmd.program, format!("failed to spawn: {}", e)))?;

        tokio::select! {
            output = child.wait_with_output() => {
                let output = output
                    .map_err(|e| Error::invocation(&cmd.program, format!("wait error: {}", e)))?;
                Ok(ExecOutput {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                })
            }
            // Dropping the wait future drops the child, which kills it.
            _ = cancel.cancelled() => Err(Error::RunCancelled),
        }
    }
}
