use anyhow::Result;

use super::{LaunchSpec, StepOutput};

/// Trait for the isolation backends a sandbox can be launched on
///
/// A backend only knows how to start one step under the given limits, supervise
/// it until it exits, times out or is cancelled, and tear it down. Deciding what
/// to launch and what the outcome means is the job of [`super::Sandbox`].
///
/// Methods block the calling thread; callers run them on a blocking worker.
pub trait SandboxRunner: Send + Sync {
    /// Short backend name, reported by the health check
    fn name(&self) -> &'static str;

    /// Launches one step and blocks until it is over.
    ///
    /// Errors mean the isolation environment itself failed (launch refused,
    /// runtime unavailable, I/O error), never that the sandboxed code failed.
    /// Whatever happens, nothing launched by this call outlives it.
    fn launch(&self, spec: &LaunchSpec) -> Result<StepOutput>;

    /// Checks that the backend is usable and returns its version string
    fn probe(&self) -> Result<String>;

    /// Removes sandboxes left behind by a previous process
    fn reclaim_orphans(&self) -> Result<usize> {
        Ok(0)
    }
}
