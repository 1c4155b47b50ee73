mod capture;
mod docker_runner;
mod lifecycle;
mod process;
mod runner;
mod simple_runner;

pub use capture::Captured;
pub use docker_runner::DockerRunner;
pub use lifecycle::{Sandbox, SandboxOutcome, SandboxRun, SandboxSettings, SandboxState};
pub use runner::SandboxRunner;
pub use simple_runner::SimpleRunner;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::limits::ResourceLimits;

/// Which step of the recipe a launch belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Build,
    Run,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Run => "run",
        }
    }
}

/// Everything a backend needs to launch one sandboxed step
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Unique name of this step's sandbox (container name for docker)
    pub name: String,
    pub workspace_name: String,
    pub phase: Phase,
    pub image: String,
    pub argv: Vec<String>,
    pub workspace: PathBuf,
    /// Whether the step may write into the workspace
    pub workspace_writable: bool,
    pub limits: ResourceLimits,
    /// Wall-clock allowance, counted from the moment the process is started
    pub timeout: Duration,
    /// Cap for each of stdout and stderr
    pub max_output_bytes: usize,
    pub cancel: CancellationToken,
}

/// How a launched step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepExit {
    Exited(i32),
    TimedOut,
    /// The engine asked every sandbox to stop
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct StepOutput {
    pub exit: StepExit,
    pub stdout: Captured,
    pub stderr: Captured,
    pub elapsed: Duration,
}

/// Creates the sandbox backend selected by the configuration
///
/// `docker` launches every step in a constrained container; `simple` only runs
/// a local process group and is meant for development and testing.
pub fn create_sandbox_runner(config: &RuntimeConfig) -> Result<Arc<dyn SandboxRunner>> {
    match config {
        RuntimeConfig::Docker(docker) => {
            log::info!("Creating DockerRunner (container isolation via {})", docker.binary);
            Ok(Arc::new(DockerRunner::build(docker.clone())))
        }
        RuntimeConfig::Simple => {
            log::info!("Creating SimpleRunner (no isolation)");
            Ok(Arc::new(SimpleRunner::build()))
        }
    }
}
