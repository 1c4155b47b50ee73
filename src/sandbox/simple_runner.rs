use std::process::Stdio;

use anyhow::{Context, Result, bail};
use tokio::process::Command;

use super::process::{Supervised, Waited, exit_code};
use super::{LaunchSpec, SandboxRunner, StepExit, StepOutput};

const FALLBACK_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// A runner that executes steps as plain local processes
///
/// SimpleRunner only provides the deadline, output bounds and process-group
/// teardown. The image reference is ignored and there are no memory, network or
/// filesystem controls. This is intended for development and testing
/// environments where security isolation is not critical.
pub struct SimpleRunner {
    path: String,
}

impl SimpleRunner {
    pub fn build() -> Self {
        log::warn!("SimpleRunner provides NO security isolation - use only in trusted environments");
        Self {
            path: std::env::var("PATH").unwrap_or_else(|_| FALLBACK_PATH.to_string()),
        }
    }

    async fn launch_async(&self, spec: &LaunchSpec) -> Result<StepOutput> {
        let Some((program, args)) = spec.argv.split_first() else {
            bail!("empty {} command", spec.phase.as_str());
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&spec.workspace)
            .env_clear()
            .env("PATH", &self.path)
            .env("HOME", &spec.workspace)
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {program} for {}", spec.name))?;
        let mut supervised = Supervised::attach(child, spec.max_output_bytes);
        let group = supervised.pid();

        let waited = supervised.wait(spec.timeout, &spec.cancel).await;
        // Whatever happened, nothing from this step may keep running
        kill_process_group(group);
        let reaped = supervised.reap().await;

        let exit = match waited.context("failed to wait for sandboxed process")? {
            Waited::Exited(status) => StepExit::Exited(exit_code(status)),
            Waited::DeadlineElapsed => StepExit::TimedOut,
            Waited::Cancelled => StepExit::Cancelled,
        };

        Ok(StepOutput {
            exit,
            stdout: reaped.stdout,
            stderr: reaped.stderr,
            elapsed: reaped.elapsed,
        })
    }
}

impl SandboxRunner for SimpleRunner {
    fn name(&self) -> &'static str {
        "simple"
    }

    fn launch(&self, spec: &LaunchSpec) -> Result<StepOutput> {
        tokio::runtime::Handle::current().block_on(self.launch_async(spec))
    }

    fn probe(&self) -> Result<String> {
        Ok(format!("local processes (pid {})", std::process::id()))
    }
}

/// Sends SIGKILL to every process in the group led by `pid`.
///
/// The group id stays reserved while any member is alive, so this cannot reach
/// an unrelated process as long as the group is non-empty.
fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    // SAFETY: killpg only sends a signal; errors (ESRCH for an empty group) are ignored
    let ret = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if ret != 0 {
        log::trace!("killpg({pid}) failed: {}", std::io::Error::last_os_error());
    }
}
