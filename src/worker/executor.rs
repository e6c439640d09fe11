use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Outcome of one command execution. Captured output is stdout and
/// stderr merged in arrival order.
#[derive(Debug)]
pub enum ExecutionResult {
    /// The command exited zero.
    Success { output: String },
    /// Non-zero exit or spawn failure; `reason` describes which.
    Failure { output: String, reason: String },
    /// The worker's cancellation scope fired mid-run; the child was
    /// killed and the partial output kept.
    Cancelled { output: String },
}

/// Runs job commands through a shell.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner;

impl CommandRunner {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(
        &self,
        job_id: &str,
        command: &str,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        tracing::info!(job_id, command, "executing job");

        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id, error = %e, "failed to spawn command");
                return ExecutionResult::Failure {
                    output: String::new(),
                    reason: format!("failed to spawn command: {e}"),
                };
            }
        };

        let mut merged = Vec::new();
        let cancelled = tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(job_id, error = %e, "failed to kill child process");
                }
                true
            }
            _ = drain_merged(&mut child, &mut merged) => false,
        };

        let output = String::from_utf8_lossy(&merged).into_owned();
        let waited = child.wait().await;

        if cancelled {
            tracing::warn!(job_id, "job cancelled during execution");
            return ExecutionResult::Cancelled { output };
        }

        match waited {
            Ok(status) if status.success() => {
                tracing::info!(job_id, "job completed successfully");
                ExecutionResult::Success { output }
            }
            Ok(status) => {
                tracing::info!(job_id, exit = ?status.code(), "job command failed");
                ExecutionResult::Failure {
                    output,
                    reason: status.to_string(),
                }
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "failed to reap command");
                ExecutionResult::Failure {
                    output,
                    reason: format!("failed to reap command: {e}"),
                }
            }
        }
    }
}

/// Read both child pipes to EOF, interleaving chunks as they arrive so
/// the capture preserves the order the process produced them in.
async fn drain_merged(child: &mut Child, merged: &mut Vec<u8>) {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = [0u8; 8192];
    let mut err_buf = [0u8; 8192];

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            n = read_chunk(&mut stdout, &mut out_buf), if stdout.is_some() => match n {
                Ok(n) if n > 0 => merged.extend_from_slice(&out_buf[..n]),
                _ => stdout = None,
            },
            n = read_chunk(&mut stderr, &mut err_buf), if stderr.is_some() => match n {
                Ok(n) if n > 0 => merged.extend_from_slice(&err_buf[..n]),
                _ => stderr = None,
            },
        }
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => Ok(0),
    }
}
