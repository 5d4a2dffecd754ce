//! Image engine client library.
//!
//! Provides the [`ImageEngine`] capability the build coordinator consumes
//! (pull, build, size query, push), an implementation driving the
//! `docker` command-line client, and lookup of saved registry credentials.

pub mod cli;
pub mod credentials;
pub mod engine;

pub use cli::DockerCli;
pub use credentials::{CredentialError, CredentialStore, RegistryAuth};
pub use engine::{is_step_line, BuildRequest, EngineError, ImageEngine, LogSink};
