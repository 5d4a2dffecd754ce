//! [`ImageEngine`] backed by the `docker` command-line client.
//!
//! Each operation spawns one `docker` subprocess. Build output from both
//! stdout and stderr is streamed line by line to the caller, and a failed
//! build reports the last lines it printed. Other commands capture their
//! output and report only its tail on failure.

use std::collections::VecDeque;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, Split};
use tokio::process::Command;

use crate::credentials::RegistryAuth;
use crate::engine::{BuildRequest, EngineError, ImageEngine, LogSink};

/// Maximum bytes captured per stream for non-streaming commands (1 MiB).
const MAX_OUTPUT_BYTES: u64 = 1024 * 1024;

/// Number of trailing build-log lines kept for error reports.
const ERROR_TAIL_LINES: usize = 20;

/// Drives the local `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run `docker <args>` to completion and return its stdout.
    async fn run(&self, args: &[String]) -> Result<String, EngineError> {
        let mut cmd = self.command();
        cmd.args(args);
        tracing::debug!(command = %describe(&self.binary, args), "Running image engine command");

        let mut child = cmd.spawn().map_err(EngineError::Unavailable)?;
        let stdout_task = tokio::spawn(read_capped(child.stdout.take()));
        let stderr_task = tokio::spawn(read_capped(child.stderr.take()));

        let status = child.wait().await?;
        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if status.success() {
            Ok(stdout)
        } else {
            Err(EngineError::CommandFailed {
                command: describe(&self.binary, args),
                exit_code: status.code(),
                output: tail(&format!("{stdout}{stderr}"), ERROR_TAIL_LINES),
            })
        }
    }
}

#[async_trait]
impl ImageEngine for DockerCli {
    async fn ping(&self) -> Result<(), EngineError> {
        let version = self
            .run(&strings(&["version", "--format", "{{.Server.Version}}"]))
            .await?;
        tracing::info!(server_version = %version.trim(), "Connected to image engine");
        Ok(())
    }

    async fn pull(&self, reference: &str) -> Result<(), EngineError> {
        self.run(&strings(&["pull", reference])).await.map(|_| ())
    }

    async fn build(&self, request: &BuildRequest, log: LogSink<'_>) -> Result<(), EngineError> {
        let args = build_args(request);
        let mut cmd = self.command();
        cmd.args(&args);
        tracing::debug!(command = %describe(&self.binary, &args), "Running image build");

        let mut child = cmd.spawn().map_err(EngineError::Unavailable)?;
        let mut stdout = child.stdout.take().map(|s| BufReader::new(s).split(b'\n'));
        let mut stderr = child.stderr.take().map(|s| BufReader::new(s).split(b'\n'));

        // BuildKit reports progress on stderr, so both streams feed the log.
        let mut recent: VecDeque<String> = VecDeque::with_capacity(ERROR_TAIL_LINES);
        while stdout.is_some() || stderr.is_some() {
            let (from_stdout, line) = tokio::select! {
                line = next_line(&mut stdout), if stdout.is_some() => (true, line?),
                line = next_line(&mut stderr), if stderr.is_some() => (false, line?),
            };
            let Some(line) = line else {
                if from_stdout {
                    stdout = None;
                } else {
                    stderr = None;
                }
                continue;
            };
            if recent.len() == ERROR_TAIL_LINES {
                recent.pop_front();
            }
            recent.push_back(line.clone());
            log(line);
        }

        let status = child.wait().await?;
        if status.success() {
            return Ok(());
        }
        Err(EngineError::CommandFailed {
            command: describe(&self.binary, &args),
            exit_code: status.code(),
            output: Vec::from(recent).join("\n"),
        })
    }

    async fn image_size(&self, reference: &str) -> Result<u64, EngineError> {
        let out = self
            .run(&strings(&["image", "inspect", "--format", "{{.Size}}", reference]))
            .await?;
        parse_size(&out)
    }

    async fn push(&self, reference: &str, auth: &RegistryAuth) -> Result<(), EngineError> {
        // The CLI only takes credentials from a config directory, so write a
        // throwaway one holding just this registry's token.
        let config_dir = tempfile::tempdir()?;
        tokio::fs::write(config_dir.path().join("config.json"), push_config(auth)).await?;

        let config_path = config_dir.path().to_string_lossy().into_owned();
        self.run(&strings(&["--config", &config_path, "push", reference]))
            .await
            .map(|_| ())
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn describe(binary: &str, args: &[String]) -> String {
    let mut parts = vec![binary.to_string()];
    parts.extend(args.iter().cloned());
    parts.join(" ")
}

/// Arguments for `docker build` from a request.
fn build_args(request: &BuildRequest) -> Vec<String> {
    let mut args = strings(&[
        "build",
        "--progress=plain",
        "--file",
        &request.dockerfile,
        "--tag",
        &request.image,
    ]);
    for (key, value) in &request.build_args {
        args.push("--build-arg".into());
        args.push(format!("{key}={value}"));
    }
    args.push(request.context_dir.to_string_lossy().into_owned());
    args
}

/// Minimal client config granting access to one registry.
fn push_config(auth: &RegistryAuth) -> String {
    serde_json::json!({
        "auths": { (auth.registry.as_str()): { "auth": auth.token } }
    })
    .to_string()
}

fn parse_size(output: &str) -> Result<u64, EngineError> {
    let trimmed = output.trim();
    trimmed
        .parse()
        .map_err(|_| EngineError::Parse(format!("image size '{trimmed}' is not a byte count")))
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Next line of a split stream, lossily decoded and without its `\r`.
async fn next_line<R: AsyncBufRead + Unpin>(lines: &mut Option<Split<R>>) -> std::io::Result<Option<String>> {
    let Some(lines) = lines else {
        return Ok(None);
    };
    Ok(lines.next_segment().await?.map(|bytes| {
        let line = String::from_utf8_lossy(&bytes);
        line.strip_suffix('\r').unwrap_or(&line).to_string()
    }))
}

/// Read up to [`MAX_OUTPUT_BYTES`] and discard the rest, so the writer never
/// sees a closed pipe.
async fn read_capped<R: AsyncRead + Unpin>(handle: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h).take(MAX_OUTPUT_BYTES).read_to_end(&mut buf).await;
        let _ = tokio::io::copy(&mut h, &mut tokio::io::sink()).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}
