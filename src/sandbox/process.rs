use std::io;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use super::capture::{Capture, Captured};

/// Upper bound for every wait that happens after a sandbox was told to die
pub(super) const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

pub(super) enum Waited {
    Exited(ExitStatus),
    DeadlineElapsed,
    Cancelled,
}

pub(super) struct Reaped {
    pub stdout: Captured,
    pub stderr: Captured,
    pub elapsed: Duration,
}

/// A started child process whose stdout and stderr are being captured
pub(super) struct Supervised {
    child: Child,
    stdout: Capture,
    stderr: Capture,
    started: Instant,
}

impl Supervised {
    /// Takes over a freshly spawned child; its timeout clock starts now
    pub(super) fn attach(mut child: Child, max_output_bytes: usize) -> Self {
        let stdout = Capture::spawn(child.stdout.take(), max_output_bytes);
        let stderr = Capture::spawn(child.stderr.take(), max_output_bytes);
        Self {
            child,
            stdout,
            stderr,
            started: Instant::now(),
        }
    }

    pub(super) fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Restarts the timeout clock. Used when the spawned process is only a
    /// client and the sandboxed program is confirmed started later.
    pub(super) fn confirm_started(&mut self) {
        self.started = Instant::now();
    }

    pub(super) fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Waits for the child to exit, for `timeout` to elapse since it started, or
    /// for `cancel`, whichever comes first. Never kills anything itself.
    pub(super) async fn wait(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> io::Result<Waited> {
        let remaining = timeout.saturating_sub(self.started.elapsed());
        tokio::select! {
            status = self.child.wait() => Ok(Waited::Exited(status?)),
            _ = tokio::time::sleep(remaining) => Ok(Waited::DeadlineElapsed),
            _ = cancel.cancelled() => Ok(Waited::Cancelled),
        }
    }

    /// Makes sure the child is gone and collects its output
    pub(super) async fn reap(mut self) -> Reaped {
        let elapsed = self.started.elapsed();

        if !matches!(self.child.try_wait(), Ok(Some(_))) {
            if let Err(e) = self.child.start_kill() {
                log::debug!("Failed to kill child process: {e}");
            }
            if tokio::time::timeout(TEARDOWN_GRACE, self.child.wait()).await.is_err() {
                log::error!("Child process did not exit after SIGKILL");
            }
        }

        Reaped {
            stdout: self.stdout.finish(TEARDOWN_GRACE).await,
            stderr: self.stderr.finish(TEARDOWN_GRACE).await,
            elapsed,
        }
    }
}

/// Exit code of a finished process; death by signal N is reported as 128 + N
/// like a shell does
pub(super) fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}
