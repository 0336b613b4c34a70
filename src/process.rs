//! Subprocess execution with combined output capture and deadline handling.
//!
//! Commands are spawned in their own process group so that a deadline expiry
//! can terminate the command together with anything it forked.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// How long to wait for the output pipes to drain after the process exits.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Exit code reported when no real exit code is available.
pub const NO_EXIT_CODE: i32 = -1;

/// Captured output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Interleaved stdout and stderr, one line per line of output.
    pub output: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Result of racing a command against a deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The command exited on its own.
    Completed(CommandOutput),
    /// The deadline elapsed first and the process group was killed.
    TimedOut { output: String },
}

/// A spawned command whose output is being collected in the background.
pub struct RunningCommand {
    command_line: String,
    child: AsyncGroupChild,
    output: JoinHandle<String>,
}

impl RunningCommand {
    /// Spawns `program` with `args` in `working_dir`.
    pub fn spawn(working_dir: &Path, program: &str, args: &[String]) -> Result<Self> {
        let command_line = crate::types::render_command_line(program, args);

        let mut child = Command::new(program)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .group_spawn()
            .map_err(|e| Error::Spawn {
                command: command_line.clone(),
                reason: e.to_string(),
            })?;

        let stdout = child.inner().stdout.take();
        let stderr = child.inner().stderr.take();
        let output = tokio::spawn(collect_output(stdout, stderr));

        tracing::debug!(command = %command_line, cwd = ?working_dir, "spawned command");

        Ok(Self {
            command_line,
            child,
            output,
        })
    }

    /// The rendered command line.
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Waits for the command to exit.
    pub async fn wait(mut self) -> Result<CommandOutput> {
        let status = self.child.wait().await?;
        let output = drain(self.output).await;
        Ok(CommandOutput {
            output,
            exit_code: exit_code(status),
        })
    }

    /// Waits for the command to exit or for `deadline`, whichever comes first.
    ///
    /// On expiry the whole process group is killed and reaped before returning.
    pub async fn wait_until(mut self, deadline: Instant) -> Result<CommandOutcome> {
        let finished = tokio::select! {
            status = self.child.wait() => Some(status),
            _ = tokio::time::sleep_until(deadline) => None,
        };

        match finished {
            Some(status) => {
                let status = status?;
                let output = drain(self.output).await;
                Ok(CommandOutcome::Completed(CommandOutput {
                    output,
                    exit_code: exit_code(status),
                }))
            }
            None => {
                tracing::warn!(command = %self.command_line, "deadline elapsed, killing process group");
                if let Err(e) = self.child.start_kill() {
                    tracing::error!(command = %self.command_line, error = %e, "failed to kill process group");
                }
                if let Err(e) = self.child.wait().await {
                    tracing::warn!(command = %self.command_line, error = %e, "failed to reap killed command");
                }
                let output = drain(self.output).await;
                Ok(CommandOutcome::TimedOut { output })
            }
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(NO_EXIT_CODE)
}

async fn drain(mut handle: JoinHandle<String>) -> String {
    match tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut handle).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "output collector failed");
            String::new()
        }
        Err(_) => {
            tracing::warn!("output pipes still open after exit, abandoning collection");
            handle.abort();
            String::new()
        }
    }
}

async fn collect_output<O, E>(stdout: Option<O>, stderr: Option<E>) -> String
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out_lines = stdout.map(|s| BufReader::new(s).lines());
    let mut err_lines = stderr.map(|s| BufReader::new(s).lines());
    let mut combined = String::new();

    while out_lines.is_some() || err_lines.is_some() {
        tokio::select! {
            line = next_line(&mut out_lines) => {
                if !push_line(&mut combined, line, "stdout") {
                    out_lines = None;
                }
            }
            line = next_line(&mut err_lines) => {
                if !push_line(&mut combined, line, "stderr") {
                    err_lines = None;
                }
            }
        }
    }

    combined
}

/// Reads the next line, or never resolves once the stream is closed.
async fn next_line<R>(lines: &mut Option<Lines<BufReader<R>>>) -> std::io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

/// Appends a line; returns false once the stream is exhausted.
fn push_line(combined: &mut String, line: std::io::Result<Option<String>>, stream: &str) -> bool {
    match line {
        Ok(Some(line)) => {
            combined.push_str(&line);
            combined.push('\n');
            true
        }
        Ok(None) => false,
        Err(e) => {
            tracing::debug!(stream, error = %e, "error reading command output");
            false
        }
    }
}
