//! Infrastructure implementation of the `CommandRunner` port.
//!
//! `TokioCommandRunner` runs local processes (mostly `ssh`) with a hard
//! timeout: on expiry the child is killed explicitly instead of relying on
//! the future being dropped.

use std::process::{ExitStatus, Output, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::application::ports::{CommandRunner, ExecOutcome, KillSwitch};

/// Timeout for short housekeeping commands (uploads, log appends, reads).
pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioCommandRunner;

impl TokioCommandRunner {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn spawn(program: &str, args: &[&str], stdin: bool) -> Result<Child> {
    Command::new(program)
        .args(args)
        .stdin(if stdin { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))
}

async fn drain<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = h.read_to_end(&mut buf).await;
    }
    buf
}

/// Wait for exit while draining both pipes, killing the child on timeout.
async fn collect(mut child: Child, program: &str, timeout: Duration) -> Result<Output> {
    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();

    tokio::select! {
        result = async {
            let (status, stdout, stderr) =
                tokio::join!(child.wait(), drain(stdout_handle), drain(stderr_handle));
            Ok(Output {
                status: status.with_context(|| format!("waiting for {program}"))?,
                stdout,
                stderr,
            })
        } => result,
        () = tokio::time::sleep(timeout) => {
            let _ = child.kill().await;
            anyhow::bail!("{program} timed out after {}s", timeout.as_secs())
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Output> {
        let child = spawn(program, args, false)?;
        collect(child, program, timeout).await
    }

    async fn run_with_stdin(
        &self,
        program: &str,
        args: &[&str],
        input: &[u8],
        timeout: Duration,
    ) -> Result<Output> {
        let mut child = spawn(program, args, true)?;
        let stdin_handle = child.stdin.take();
        let input_owned = input.to_vec();
        let stdin_task = tokio::spawn(async move {
            if let Some(mut stdin) = stdin_handle {
                let _ = stdin.write_all(&input_owned).await;
            }
        });
        let output = collect(child, program, timeout).await;
        let _ = stdin_task.await;
        output
    }

    async fn run_killable(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
        kill: &KillSwitch,
    ) -> Result<ExecOutcome> {
        let mut child = spawn(program, args, false)?;
        let stdout_handle = child.stdout.take();
        let stderr_handle = child.stderr.take();
        // Output goes to the remote log; local pipes are only drained.
        let drained = tokio::spawn(async move {
            tokio::join!(drain(stdout_handle), drain(stderr_handle));
        });

        let outcome = tokio::select! {
            status = child.wait() => {
                let status = status.with_context(|| format!("waiting for {program}"))?;
                ExecOutcome::Exited(exit_code(status))
            }
            () = tokio::time::sleep(timeout) => {
                let _ = child.kill().await;
                tracing::warn!(
                    program,
                    timeout_secs = timeout.as_secs(),
                    "command timed out; killed"
                );
                ExecOutcome::TimedOut
            }
            () = kill.killed() => {
                let _ = child.kill().await;
                tracing::info!(program, "command killed on request");
                ExecOutcome::Killed
            }
        };
        drained.abort();
        Ok(outcome)
    }
}
