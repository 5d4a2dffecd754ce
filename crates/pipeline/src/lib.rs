//! Build coordination: phases, worker pool and the collaborators they drive.
//!
//! [`Coordinator::run`] sequences one batch. Everything outside the process
//! (image engine, subprocesses, HTTP probes) is reached through a trait so
//! the whole pipeline runs against fakes in tests.

pub mod build;
pub mod config;
pub mod coordinator;
pub mod license;
pub mod load;
pub mod pool;
pub mod prepare;
pub mod probe;
pub mod secrets;
pub mod solo;
pub mod summary;
pub mod tool;

pub use config::{BuildConfig, ConfigError, DeploymentType, FailurePolicy};
pub use coordinator::{BatchError, BatchPhase, Coordinator};
pub use pool::{Job, JobHandler, PhaseError, PhaseReport, WorkerPool};
pub use probe::{HttpProbe, UrlProbe};
pub use summary::BatchSummary;
pub use tool::{ExternalTool, Invocation, SubprocessTool, ToolError, ToolOutput};
