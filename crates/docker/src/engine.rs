//! The image engine capability.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::credentials::RegistryAuth;

/// Callback receiving build-log lines as the engine produces them.
pub type LogSink<'a> = &'a (dyn Fn(String) + Send + Sync);

/// Everything the engine needs to build one image.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Directory sent to the engine as the build context.
    pub context_dir: PathBuf,
    /// Dockerfile name, relative to the context directory.
    pub dockerfile: String,
    /// Full reference the produced image is tagged with.
    pub image: String,
    pub build_args: BTreeMap<String, String>,
}

/// Whether a build-log line opens a build step.
///
/// Matches the classic builder (`Step 2/4 : RUN ...`) and BuildKit plain
/// progress (`#5 [2/4] RUN ...`).
pub fn is_step_line(line: &str) -> bool {
    if line.starts_with("Step ") {
        return true;
    }
    line.strip_prefix('#')
        .and_then(|rest| rest.split_once(' '))
        .is_some_and(|(id, rest)| {
            !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) && rest.starts_with('[')
        })
}

/// Errors reported by an image engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine binary could not be started.
    #[error("image engine not available: {0}")]
    Unavailable(std::io::Error),

    /// The engine ran and reported failure.
    #[error("`{command}` failed (exit code {exit_code:?}): {output}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        /// Tail of the captured output.
        output: String,
    },

    /// The engine answered with something we could not interpret.
    #[error("unexpected image engine output: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operations the coordinator needs from a container image engine.
///
/// Implementations must be safe to call from many workers at once.
#[async_trait]
pub trait ImageEngine: Send + Sync {
    /// Check that the engine is reachable.
    async fn ping(&self) -> Result<(), EngineError>;

    /// Pull an image by reference.
    async fn pull(&self, reference: &str) -> Result<(), EngineError>;

    /// Build an image, streaming log lines to `log`.
    async fn build(&self, request: &BuildRequest, log: LogSink<'_>) -> Result<(), EngineError>;

    /// On-disk size of a local image, in bytes.
    async fn image_size(&self, reference: &str) -> Result<u64, EngineError>;

    /// Push a local image using the given registry credentials.
    async fn push(&self, reference: &str, auth: &RegistryAuth) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_lines_from_both_builders() {
        assert!(is_step_line("Step 1/2 : FROM centos:7"));
        assert!(is_step_line("#5 [2/4] RUN yum install -y java"));
        assert!(!is_step_line("#5 0.412 Loaded plugins: fastestmirror"));
        assert!(!is_step_line(" ---> 5182e96772bf"));
        assert!(!is_step_line("# [1/2] comment"));
    }
}
