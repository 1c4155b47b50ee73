use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::{Captured, LaunchSpec, Phase, SandboxRunner, StepExit, StepOutput};
use crate::language::LanguageProfile;
use crate::limits::ResourceLimits;

/// States a sandbox goes through; the last three are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Pending,
    Building,
    Running,
    Completed,
    TimedOut,
    Crashed,
}

impl SandboxState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Crashed)
    }
}

/// Host-wide knobs that are not part of a request's resource limits
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    /// Wall-clock allowance of the build step, independent of the run timeout
    pub build_timeout: Duration,
    /// Memory floor of the build step; compilers need more than most programs
    pub build_memory_bytes: u64,
    /// Cap for each of stdout and stderr
    pub max_output_bytes: usize,
}

/// How a sandbox ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxOutcome {
    /// The run step terminated on its own before the deadline
    Exited {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    /// The build step failed; the run step was never launched
    CompileError { stderr: String },
    /// The run step was killed at its deadline
    TimedOut { stdout: String, stderr: String },
    /// The isolation environment failed or the engine stopped the sandbox
    Crashed {
        reason: String,
        stdout: String,
        stderr: String,
    },
}

impl SandboxOutcome {
    pub fn state(&self) -> SandboxState {
        match self {
            Self::Exited { .. } | Self::CompileError { .. } => SandboxState::Completed,
            Self::TimedOut { .. } => SandboxState::TimedOut,
            Self::Crashed { .. } => SandboxState::Crashed,
        }
    }

    fn crashed(reason: String) -> Self {
        Self::Crashed {
            reason,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxRun {
    pub outcome: SandboxOutcome,
    /// From leaving `Pending` to reaching the terminal state
    pub elapsed: Duration,
    /// Every state the sandbox was in, in order
    pub history: Vec<SandboxState>,
}

/// One build-and-run of a language profile inside a prepared workspace
pub struct Sandbox<'a> {
    runner: &'a dyn SandboxRunner,
    profile: Arc<LanguageProfile>,
    workspace_name: String,
    workspace_dir: PathBuf,
    limits: ResourceLimits,
    settings: SandboxSettings,
    cancel: CancellationToken,
    history: Vec<SandboxState>,
}

impl<'a> Sandbox<'a> {
    pub fn new(
        runner: &'a dyn SandboxRunner,
        profile: Arc<LanguageProfile>,
        workspace_name: impl Into<String>,
        workspace_dir: impl Into<PathBuf>,
        limits: ResourceLimits,
        settings: SandboxSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            profile,
            workspace_name: workspace_name.into(),
            workspace_dir: workspace_dir.into(),
            limits,
            settings,
            cancel,
            history: vec![SandboxState::Pending],
        }
    }

    /// Drives the sandbox to a terminal state. Blocks the calling thread.
    pub fn run(mut self) -> SandboxRun {
        let started = Instant::now();

        let outcome = match self.build() {
            ControlFlow::Break(outcome) => outcome,
            ControlFlow::Continue(()) => self.execute(),
        };

        self.enter(outcome.state());
        SandboxRun {
            outcome,
            elapsed: started.elapsed(),
            history: self.history,
        }
    }

    fn enter(&mut self, state: SandboxState) {
        log::debug!(
            "Sandbox {}: {:?} -> {:?}",
            self.workspace_name,
            self.history.last().copied().unwrap_or(SandboxState::Pending),
            state
        );
        self.history.push(state);
    }

    fn build(&mut self) -> ControlFlow<SandboxOutcome> {
        let Some(argv) = self.profile.build_argv() else {
            return ControlFlow::Continue(());
        };
        self.enter(SandboxState::Building);

        let mut limits = self.limits.clone();
        limits.memory_bytes = limits.memory_bytes.max(self.settings.build_memory_bytes);
        let spec = self.launch_spec(Phase::Build, argv, limits, self.settings.build_timeout, true);

        let output = match self.runner.launch(&spec) {
            Ok(output) => output,
            Err(e) => {
                log::error!("Build step of {} failed to launch: {e:#}", self.workspace_name);
                return ControlFlow::Break(SandboxOutcome::crashed(format!(
                    "build step could not be launched: {e:#}"
                )));
            }
        };

        match output.exit {
            StepExit::Exited(0) => ControlFlow::Continue(()),
            StepExit::Exited(_) => ControlFlow::Break(SandboxOutcome::CompileError {
                stderr: compiler_output(&output),
            }),
            StepExit::TimedOut => {
                let mut stderr = compiler_output(&output);
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(&format!(
                    "build exceeded its {}s time limit\n",
                    self.settings.build_timeout.as_secs()
                ));
                ControlFlow::Break(SandboxOutcome::CompileError { stderr })
            }
            StepExit::Cancelled => ControlFlow::Break(cancelled(&output)),
        }
    }

    fn execute(&mut self) -> SandboxOutcome {
        self.enter(SandboxState::Running);

        let argv = self.profile.run_argv();
        let writable = self.limits.filesystem_writable;
        let spec = self.launch_spec(
            Phase::Run,
            argv,
            self.limits.clone(),
            self.limits.timeout(),
            writable,
        );

        let output = match self.runner.launch(&spec) {
            Ok(output) => output,
            Err(e) => {
                log::error!("Run step of {} failed to launch: {e:#}", self.workspace_name);
                return SandboxOutcome::crashed(format!("run step could not be launched: {e:#}"));
            }
        };

        match output.exit {
            StepExit::Exited(exit_code) => SandboxOutcome::Exited {
                exit_code,
                stdout: render(&output.stdout),
                stderr: render(&output.stderr),
            },
            StepExit::TimedOut => SandboxOutcome::TimedOut {
                stdout: render(&output.stdout),
                stderr: render(&output.stderr),
            },
            StepExit::Cancelled => cancelled(&output),
        }
    }

    fn launch_spec(
        &self,
        phase: Phase,
        argv: Vec<String>,
        limits: ResourceLimits,
        timeout: Duration,
        workspace_writable: bool,
    ) -> LaunchSpec {
        LaunchSpec {
            name: format!("{}-{}", self.workspace_name, phase.as_str()),
            workspace_name: self.workspace_name.clone(),
            phase,
            image: self.profile.image.clone(),
            argv,
            workspace: self.workspace_dir.clone(),
            workspace_writable,
            limits,
            timeout,
            max_output_bytes: self.settings.max_output_bytes,
            cancel: self.cancel.clone(),
        }
    }
}

fn cancelled(output: &StepOutput) -> SandboxOutcome {
    SandboxOutcome::Crashed {
        reason: "sandbox cancelled by engine shutdown".to_string(),
        stdout: render(&output.stdout),
        stderr: render(&output.stderr),
    }
}

/// Compilers report on either stream; both end up in the result's stderr
fn compiler_output(output: &StepOutput) -> String {
    let stdout = render(&output.stdout);
    let stderr = render(&output.stderr);
    match (stdout.is_empty(), stderr.is_empty()) {
        (true, _) => stderr,
        (false, true) => stdout,
        (false, false) if stdout.ends_with('\n') => stdout + &stderr,
        (false, false) => stdout + "\n" + &stderr,
    }
}

fn render(captured: &Captured) -> String {
    let mut text = captured.to_string_lossy();
    if captured.truncated {
        text.push_str(&format!(
            "\n[output truncated: {} of {} bytes shown]\n",
            captured.bytes.len(),
            captured.total_bytes
        ));
    }
    text
}
