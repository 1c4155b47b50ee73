use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::language::LanguageRegistry;
use crate::limits::{LimitPolicy, ResourceOverrides};
use crate::sandbox::{
    Sandbox, SandboxOutcome, SandboxRun, SandboxRunner, SandboxSettings, create_sandbox_runner,
};
use crate::workspace::WorkspaceManager;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub language: String,
    #[serde(alias = "code")]
    pub source_code: String,
    #[serde(default)]
    pub resource_overrides: Option<ResourceOverrides>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExecutionStatus {
    Success,
    RuntimeError,
    CompileError,
    Timeout,
    InternalError,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::RuntimeError => "RuntimeError",
            Self::CompileError => "CompileError",
            Self::Timeout => "Timeout",
            Self::InternalError => "InternalError",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    /// Raw exit code of the run step; absent unless the run step exited on its own
    pub exit_code: Option<i32>,
    pub duration_millis: u64,
}

/// Receives every outcome of [`Engine::execute`], e.g. to keep statistics
pub trait ExecutionObserver: Send + Sync {
    fn on_completed(&self, language: &str, result: &ExecutionResult);

    fn on_rejected(&self, _language: &str, _error: &EngineError) {}
}

/// The execution orchestrator
///
/// Resolves the language, allocates a workspace, runs the sandbox state machine
/// on a blocking worker and folds whatever happened into an [`ExecutionResult`].
pub struct Engine {
    registry: Arc<LanguageRegistry>,
    policy: LimitPolicy,
    workspaces: WorkspaceManager,
    runner: Arc<dyn SandboxRunner>,
    settings: SandboxSettings,
    observers: Vec<Arc<dyn ExecutionObserver>>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(
        registry: LanguageRegistry,
        policy: LimitPolicy,
        workspaces: WorkspaceManager,
        runner: Arc<dyn SandboxRunner>,
        settings: SandboxSettings,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            policy,
            workspaces,
            runner,
            settings,
            observers: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let registry = LanguageRegistry::with_builtin(config.languages.clone())?;
        let workspaces = WorkspaceManager::new(
            config.engine.workspace_root()?,
            config.engine.max_concurrent,
            config.engine.max_source_bytes,
        )?;
        let runner = create_sandbox_runner(&config.engine.runtime)?;
        let settings = SandboxSettings {
            build_timeout: config.engine.build.timeout(),
            build_memory_bytes: config.engine.build.memory_bytes,
            max_output_bytes: config.engine.max_output_bytes,
        };

        log::info!(
            "Engine ready: {} language(s), {} slot(s), workspaces in {}",
            registry.len(),
            workspaces.capacity(),
            workspaces.root().display()
        );
        Ok(Self::new(
            registry,
            config.limits.clone(),
            workspaces,
            runner,
            settings,
        ))
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Cancelling this token stops every running sandbox
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &LimitPolicy {
        &self.policy
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn runner(&self) -> &Arc<dyn SandboxRunner> {
        &self.runner
    }

    /// Executes one request to completion.
    ///
    /// Fails only for rejections that happen before a sandbox is committed;
    /// every outcome of a committed execution is reported in the result. If the
    /// returned future is dropped, the sandbox is cancelled and its workspace
    /// is still removed.
    pub async fn execute(&self, request: &ExecutionRequest) -> EngineResult<ExecutionResult> {
        match self.try_execute(request).await {
            Ok((language, result)) => {
                for observer in &self.observers {
                    observer.on_completed(&language, &result);
                }
                Ok(result)
            }
            Err(e) => {
                log::info!("Rejected {} request: {e}", request.language);
                for observer in &self.observers {
                    observer.on_rejected(&request.language, &e);
                }
                Err(e)
            }
        }
    }

    async fn try_execute(&self, request: &ExecutionRequest) -> EngineResult<(String, ExecutionResult)> {
        let profile = self.registry.resolve(&request.language)?;

        if request.source_code.trim().is_empty() {
            return Err(EngineError::InvalidInput("source code is empty".to_string()));
        }
        let max = self.workspaces.max_source_bytes();
        if request.source_code.len() > max {
            return Err(EngineError::InvalidInput(format!(
                "source code is {} bytes, the limit is {max}",
                request.source_code.len()
            )));
        }
        let limits = self.policy.resolve(request.resource_overrides.as_ref())?;

        let mut workspace = self.workspaces.create()?;
        self.workspaces
            .write_source(&mut workspace, &profile.source_filename, &request.source_code)?;

        let language = profile.id.clone();
        let workspace_name = workspace.name().to_string();
        let cancel = self.shutdown.child_token();
        let _cancel_on_drop = cancel.clone().drop_guard();
        let runner = Arc::clone(&self.runner);
        let settings = self.settings.clone();

        // The workspace moves into the worker so it is torn down even if this
        // future is dropped
        let joined = tokio::task::spawn_blocking(move || {
            let run = Sandbox::new(
                runner.as_ref(),
                profile,
                workspace.name(),
                workspace.path(),
                limits,
                settings,
                cancel,
            )
            .run();
            workspace.destroy();
            run
        })
        .await;

        let result = match joined {
            Ok(run) => normalize(run),
            Err(e) => {
                log::error!("Sandbox worker for {workspace_name} failed: {e}");
                ExecutionResult {
                    status: ExecutionStatus::InternalError,
                    stdout: String::new(),
                    stderr: "sandbox worker failed".to_string(),
                    exit_code: None,
                    duration_millis: 0,
                }
            }
        };

        log::info!(
            "Executed {language} in {workspace_name}: {} after {}ms",
            result.status.as_str(),
            result.duration_millis
        );
        Ok((language, result))
    }
}

/// Folds a finished sandbox into the caller-facing result
pub fn normalize(run: SandboxRun) -> ExecutionResult {
    let duration_millis = run.elapsed.as_millis() as u64;
    match run.outcome {
        SandboxOutcome::Exited {
            exit_code,
            stdout,
            stderr,
        } => ExecutionResult {
            status: if exit_code == 0 {
                ExecutionStatus::Success
            } else {
                ExecutionStatus::RuntimeError
            },
            stdout,
            stderr,
            exit_code: Some(exit_code),
            duration_millis,
        },
        SandboxOutcome::CompileError { stderr } => ExecutionResult {
            status: ExecutionStatus::CompileError,
            stdout: String::new(),
            stderr,
            exit_code: None,
            duration_millis,
        },
        SandboxOutcome::TimedOut { stdout, stderr } => ExecutionResult {
            status: ExecutionStatus::Timeout,
            stdout,
            stderr,
            exit_code: None,
            duration_millis,
        },
        SandboxOutcome::Crashed {
            reason,
            stdout,
            mut stderr,
        } => {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&reason);
            ExecutionResult {
                status: ExecutionStatus::InternalError,
                stdout,
                stderr,
                exit_code: None,
                duration_millis,
            }
        }
    }
}
