//! External command-line tools (orchestration tool, `tar`, `ansible`).
//!
//! The coordinator never spawns processes directly; it goes through
//! [`ExternalTool`] so tests can substitute a scripted fake.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Maximum stdout or stderr size captured per stream (10 MiB).
const MAX_OUTPUT_BYTES: u64 = 10 * 1024 * 1024;

/// One command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl Invocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: None,
        }
    }

    pub fn in_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// The command line as a user would type it.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a successful invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Both streams, stdout first.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("cannot start `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("`{command}` exited with code {exit_code}\n{output}")]
    Failed {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("`{command}` timed out after {elapsed_ms}ms")]
    Timeout { command: String, elapsed_ms: u64 },
}

/// Capability to run an external program to completion.
#[async_trait]
pub trait ExternalTool: Send + Sync {
    /// Run the command. A non-zero exit is [`ToolError::Failed`].
    async fn execute(&self, invocation: &Invocation) -> Result<ToolOutput, ToolError>;
}

/// [`ExternalTool`] spawning real subprocesses.
#[derive(Debug, Clone, Default)]
pub struct SubprocessTool {
    timeout: Option<Duration>,
}

impl SubprocessTool {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

#[async_trait]
impl ExternalTool for SubprocessTool {
    async fn execute(&self, invocation: &Invocation) -> Result<ToolOutput, ToolError> {
        let command = invocation.command_line();
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            cmd.current_dir(dir);
        }

        tracing::debug!(command = %command, "Running external tool");
        let start = std::time::Instant::now();

        let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
            command: command.clone(),
            source,
        })?;

        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

        // On timeout `child` is dropped, which kills the process.
        let status = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_elapsed) => {
                    return Err(ToolError::Timeout {
                        command,
                        elapsed_ms: start.elapsed().as_millis() as u64,
                    })
                }
            },
            None => child.wait().await,
        }
        .map_err(|source| ToolError::Spawn {
            command: command.clone(),
            source,
        })?;

        let output = ToolOutput {
            stdout: stdout_task.await.unwrap_or_default(),
            stderr: stderr_task.await.unwrap_or_default(),
        };

        if status.success() {
            Ok(output)
        } else {
            Err(ToolError::Failed {
                command,
                exit_code: status.code().unwrap_or(-1),
                output: output.combined(),
            })
        }
    }
}

async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(h) = handle {
        let _ = h.take(MAX_OUTPUT_BYTES).read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}
