//! Sandbox engine for stage execution: a uniform surface over the host
//! container daemon plus a host-exec fallback for imageless steps.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use stagehand_logstream::Sink;

pub mod docker;
pub mod errors;
pub mod exec;
pub mod files;
pub mod image;
pub mod spec;

pub use docker::{DockerEngine, Opts};
pub use errors::{trim_daemon_noise, EngineError, Result};
use spec::{PipelineConfig, RunState, Step};

pub const DOCKER_SOCK_UNIX_PATH: &str = "/var/run/docker.sock";
pub const DOCKER_SOCK_WIN_PATH: &str = r"\\.\pipe\docker_engine";
pub const DOCKER_SOCK_VOLUME_NAME: &str = "_docker";

/// A per-stage sandbox. One engine instance is created at stage setup and
/// dropped after destroy; implementations must be safe for concurrent step
/// runs against the shared sandbox.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Provision the stage network, volumes, host paths, and files. Not
    /// atomic: on failure the caller is expected to destroy to reclaim
    /// whatever was created.
    async fn setup(&self, config: &PipelineConfig) -> Result<()>;

    /// Run one step to completion, streaming output into `output`.
    async fn run(
        &self,
        step: &Step,
        output: Arc<dyn Sink>,
        cancel: CancellationToken,
    ) -> Result<RunState>;

    /// Tear down everything the engine created. Failures are logged and
    /// skipped so dependent resources still get a removal attempt;
    /// implementations should always fall through to success. Any error an
    /// implementation does return is treated as retryable by the caller.
    async fn destroy(&self) -> Result<()>;

    /// Liveness check against the backend.
    async fn ping(&self) -> Result<()>;

    /// Feed a command to the interactive shell session of a running step;
    /// `last` closes the session's stdin and lets it exit.
    async fn debug(&self, step_id: &str, command: &str, last: bool) -> Result<()>;
}
