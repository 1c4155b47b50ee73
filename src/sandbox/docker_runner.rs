use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::DockerConfig;

use super::process::{Supervised, TEARDOWN_GRACE, Waited};
use super::{LaunchSpec, SandboxRunner, StepExit, StepOutput};

/// Mount point of the workspace inside every container
const CONTAINER_WORKDIR: &str = "/workspace";
/// Label put on every container so leftovers can be found after a crash
const WORKSPACE_LABEL: &str = "execbox.workspace";
const START_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Container state as reported by `docker inspect`
#[derive(Deserialize, Debug)]
struct ContainerState {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "ExitCode")]
    exit_code: i32,
    #[serde(rename = "OOMKilled", default)]
    oom_killed: bool,
    #[serde(rename = "Error", default)]
    error: String,
}

/// A runner that launches every step in its own throwaway container
///
/// Each step is created with the request's limits applied by the container
/// runtime: cgroup memory ceiling without swap, CPU quota, PID limit, no network
/// interface, read-only root filesystem, all capabilities dropped and
/// `no-new-privileges`. Processes run under the engine's own uid and gid, so
/// everything they leave in the workspace can be removed. The container is
/// force-removed on every exit path.
pub struct DockerRunner {
    config: DockerConfig,
    user: String,
}

impl DockerRunner {
    pub fn build(config: DockerConfig) -> Self {
        // SAFETY: getuid and getgid cannot fail and touch no memory
        let user = unsafe { format!("{}:{}", libc::getuid(), libc::getgid()) };
        Self { config, user }
    }

    fn docker(&self) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// Arguments of the `docker create` call for one step
    fn create_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let limits = &spec.limits;
        let memory = format!("{}b", limits.memory_bytes);

        let mut mount = format!(
            "type=bind,source={},target={CONTAINER_WORKDIR}",
            spec.workspace.display()
        );
        if !spec.workspace_writable {
            mount.push_str(",readonly");
        }

        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            spec.name.clone(),
            "--label".into(),
            format!("{WORKSPACE_LABEL}={}", spec.workspace_name),
            "--user".into(),
            self.user.clone(),
            "--pull".into(),
            "missing".into(),
            "--memory".into(),
            memory.clone(),
            "--memory-swap".into(),
            memory,
            "--cpus".into(),
            format!("{:.2}", limits.cpu_share),
            "--pids-limit".into(),
            self.config.pids_limit.to_string(),
            "--ulimit".into(),
            "core=0".into(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--tmpfs".into(),
            format!("/tmp:rw,nosuid,nodev,size={}", self.config.tmpfs_bytes),
            "--mount".into(),
            mount,
            "--workdir".into(),
            CONTAINER_WORKDIR.into(),
            "--env".into(),
            "HOME=/tmp".into(),
        ];

        if !limits.network_enabled {
            args.extend(["--network".into(), "none".into()]);
        }
        if !limits.filesystem_writable {
            args.push("--read-only".into());
        }

        args.push(spec.image.clone());
        args.extend(spec.argv.iter().cloned());
        args
    }

    async fn launch_async(&self, spec: &LaunchSpec) -> Result<StepOutput> {
        if spec.argv.is_empty() {
            bail!("empty {} command", spec.phase.as_str());
        }

        // Installed before `create`: the daemon may still create the container
        // after a timed-out CLI call was killed
        let _guard = ContainerGuard {
            binary: &self.config.binary,
            name: &spec.name,
        };

        let launch_timeout = Duration::from_secs(self.config.launch_timeout_seconds);
        let created = timeout(
            launch_timeout,
            self.docker().args(self.create_args(spec)).output(),
        )
        .await
        .map_err(|_| anyhow!("creating container {} timed out", spec.name))?
        .with_context(|| format!("failed to run {}", self.config.binary))?;

        if !created.status.success() {
            bail!(
                "docker create failed for {}: {}",
                spec.name,
                String::from_utf8_lossy(&created.stderr).trim()
            );
        }

        let child = self
            .docker()
            .args(["start", "--attach", &spec.name])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start container {}", spec.name))?;
        let mut supervised = Supervised::attach(child, spec.max_output_bytes);

        // The run timeout only counts once the container is really running
        let waited = match self
            .await_running(&spec.name, &mut supervised, launch_timeout, &spec.cancel)
            .await
        {
            Ok(true) => {
                supervised.confirm_started();
                supervised.wait(spec.timeout, &spec.cancel).await
            }
            Ok(false) => Ok(Waited::Cancelled),
            Err(e) => {
                self.kill(&spec.name).await;
                supervised.reap().await;
                return Err(e);
            }
        };
        if !matches!(waited, Ok(Waited::Exited(_))) {
            self.kill(&spec.name).await;
        }
        let reaped = supervised.reap().await;

        let exit = match waited.context("failed to wait for container")? {
            Waited::Exited(_) => {
                let state = self.inspect(&spec.name).await?;
                if !state.error.is_empty() {
                    bail!("container {} failed: {}", spec.name, state.error);
                }
                if state.status == "created" {
                    bail!(
                        "container {} never started: {}",
                        spec.name,
                        reaped.stderr.to_string_lossy().trim()
                    );
                }
                if state.oom_killed {
                    log::info!("Container {} hit its memory limit", spec.name);
                }
                StepExit::Exited(state.exit_code)
            }
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

    /// Polls until the container has left the `created` state or the attached
    /// client is gone. Returns false when cancelled first.
    async fn await_running(
        &self,
        name: &str,
        supervised: &mut Supervised,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let deadline = Instant::now() + limit;
        loop {
            if supervised.has_exited() || self.inspect(name).await?.status != "created" {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                bail!("container {name} did not start within {limit:?}");
            }
            tokio::select! {
                _ = tokio::time::sleep(START_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return Ok(false),
            }
        }
    }

    /// SIGKILLs every process of the container at once
    async fn kill(&self, name: &str) {
        let killed = timeout(
            TEARDOWN_GRACE,
            self.docker()
                .args(["kill", "--signal", "KILL", name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status(),
        )
        .await;

        if !matches!(killed, Ok(Ok(status)) if status.success()) {
            log::warn!("Failed to kill container {name}, relying on forced removal");
        }
    }

    async fn inspect(&self, name: &str) -> Result<ContainerState> {
        let stdout = self
            .run_cli(&["inspect", "--format", "{{json .State}}", name], TEARDOWN_GRACE)
            .await?;
        serde_json::from_slice(&stdout)
            .with_context(|| format!("unexpected docker inspect output for {name}"))
    }

    /// Runs a short CLI command, killing it after `limit`. Returns its stdout.
    async fn run_cli(&self, args: &[&str], limit: Duration) -> Result<Vec<u8>> {
        let command = args.first().copied().unwrap_or_default();
        let output = timeout(limit, self.docker().args(args).output())
            .await
            .map_err(|_| anyhow!("docker {command} timed out after {limit:?}"))?
            .with_context(|| format!("failed to run {}", self.config.binary))?;

        if !output.status.success() {
            bail!(
                "docker {command} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }

    async fn probe_async(&self) -> Result<String> {
        let output = self
            .run_cli(&["version", "--format", "{{.Server.Version}}"], TEARDOWN_GRACE)
            .await?;
        let version = String::from_utf8_lossy(&output).trim().to_string();
        if version.is_empty() {
            bail!("docker daemon did not report a version");
        }
        Ok(version)
    }

    async fn reclaim_orphans_async(&self) -> Result<usize> {
        let filter = format!("label={WORKSPACE_LABEL}");
        let output = self
            .run_cli(&["ps", "--all", "--quiet", "--filter", &filter], TEARDOWN_GRACE)
            .await?;
        let listed = String::from_utf8_lossy(&output);
        let ids: Vec<&str> = listed.split_whitespace().collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let mut args = vec!["rm", "--force", "--volumes"];
        args.extend(&ids);
        self.run_cli(&args, Duration::from_secs(60)).await?;
        log::info!("Removed {} orphaned container(s)", ids.len());
        Ok(ids.len())
    }
}

impl SandboxRunner for DockerRunner {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn launch(&self, spec: &LaunchSpec) -> Result<StepOutput> {
        log::debug!(
            "Launching {} step of {} in {}",
            spec.phase.as_str(),
            spec.workspace_name,
            spec.image
        );
        tokio::runtime::Handle::current().block_on(self.launch_async(spec))
    }

    fn probe(&self) -> Result<String> {
        tokio::runtime::Handle::current().block_on(self.probe_async())
    }

    fn reclaim_orphans(&self) -> Result<usize> {
        tokio::runtime::Handle::current().block_on(self.reclaim_orphans_async())
    }
}

/// Force-removes the step's container, if it exists, when dropped
struct ContainerGuard<'a> {
    binary: &'a str,
    name: &'a str,
}

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        let removed = run_bounded(
            std::process::Command::new(self.binary).args(["rm", "--force", "--volumes", self.name]),
            TEARDOWN_GRACE,
        );
        match removed {
            Ok(_) => log::debug!("Container {} removed", self.name),
            Err(e) if format!("{e:#}").contains("No such container") => {
                log::debug!("Container {} was never created", self.name)
            }
            Err(e) => log::error!("Failed to remove container {}: {e:#}", self.name),
        }
    }
}

/// Runs a docker CLI command synchronously, killing it after `limit`. Only for
/// `Drop`, where nothing can be awaited. Returns its stdout on success.
fn run_bounded(cmd: &mut std::process::Command, limit: Duration) -> Result<Vec<u8>> {
    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to spawn docker")?;
    let pid = child.id();

    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(child.wait_with_output());
    });

    let output = match rx.recv_timeout(limit) {
        Ok(output) => output?,
        Err(_) => {
            // SAFETY: the child has not been reaped yet, so the pid is still ours
            unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
            bail!("docker command timed out after {limit:?}");
        }
    };

    if !output.status.success() {
        bail!(
            "docker exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    use super::*;
    use crate::limits::ResourceLimits;
    use crate::sandbox::Phase;

    fn spec(limits: ResourceLimits, workspace_writable: bool) -> LaunchSpec {
        LaunchSpec {
            name: "ws-1234-run".to_string(),
            workspace_name: "ws-1234".to_string(),
            phase: Phase::Run,
            image: "python:3.9-slim".to_string(),
            argv: vec!["python".to_string(), "-u".to_string(), "code.py".to_string()],
            workspace: PathBuf::from("/var/lib/execbox/ws-1234"),
            workspace_writable,
            limits,
            timeout: Duration::from_secs(15),
            max_output_bytes: 1024,
            cancel: CancellationToken::new(),
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_default_limits_lock_everything_down() {
        let runner = DockerRunner::build(DockerConfig::default());
        let args = runner.create_args(&spec(ResourceLimits::default(), false));

        assert_eq!(args[0], "create");
        assert!(has_pair(&args, "--name", "ws-1234-run"));
        assert!(has_pair(&args, "--network", "none"));
        assert!(has_pair(&args, "--memory", "134217728b"));
        assert!(has_pair(&args, "--memory-swap", "134217728b"));
        assert!(has_pair(&args, "--cpus", "0.50"));
        assert!(has_pair(&args, "--cap-drop", "ALL"));
        assert!(has_pair(&args, "--security-opt", "no-new-privileges"));
        assert!(has_pair(&args, "--label", "execbox.workspace=ws-1234"));
        let user = unsafe { format!("{}:{}", libc::getuid(), libc::getgid()) };
        assert!(has_pair(&args, "--user", &user));
        assert!(has_pair(
            &args,
            "--mount",
            "type=bind,source=/var/lib/execbox/ws-1234,target=/workspace,readonly"
        ));
        assert!(args.contains(&"--read-only".to_string()));

        // image then the command, at the very end
        let tail = &args[args.len() - 4..];
        assert_eq!(tail, ["python:3.9-slim", "python", "-u", "code.py"]);
    }

    #[test]
    fn test_relaxed_limits_open_network_and_filesystem() {
        let runner = DockerRunner::build(DockerConfig::default());
        let limits = ResourceLimits {
            network_enabled: true,
            filesystem_writable: true,
            ..ResourceLimits::default()
        };
        let args = runner.create_args(&spec(limits, true));

        assert!(!args.contains(&"--network".to_string()));
        assert!(!args.contains(&"--read-only".to_string()));
        assert!(has_pair(
            &args,
            "--mount",
            "type=bind,source=/var/lib/execbox/ws-1234,target=/workspace"
        ));
    }

    #[test]
    fn test_container_state_parsing() {
        let state: ContainerState = serde_json::from_str(
            r#"{"Status":"exited","Running":false,"OOMKilled":true,"ExitCode":137,"Error":""}"#,
        )
        .unwrap();
        assert_eq!(state.status, "exited");
        assert_eq!(state.exit_code, 137);
        assert!(state.oom_killed);
        assert!(state.error.is_empty());
    }

    /// Stand-in for the docker CLI. `start` spends @STARTUP@ seconds before the
    /// container counts as running, then the program runs for @PROGRAM@ seconds.
    const FAKE_DOCKER: &str = r#"#!/bin/sh
dir='@DIR@'
echo "$*" >> "$dir/calls.log"
case "$1" in
  create) @CREATE@ ;;
  start)
    sleep @STARTUP@
    echo running > "$dir/state"
    sleep @PROGRAM@
    echo hello
    echo exited > "$dir/state"
    ;;
  inspect)
    status=$(cat "$dir/state" 2>/dev/null || echo created)
    echo "{\"Status\":\"$status\",\"ExitCode\":0,\"OOMKilled\":false,\"Error\":\"\"}"
    ;;
  rm)
    [ -e "$dir/state" ] || { echo "Error: No such container: $4" >&2; exit 1; }
    ;;
esac
"#;

    fn fake_runner(
        dir: &Path,
        create: &str,
        startup: &str,
        program: &str,
        launch_timeout_seconds: u64,
    ) -> DockerRunner {
        let script = FAKE_DOCKER
            .replace("@DIR@", &dir.display().to_string())
            .replace("@CREATE@", create)
            .replace("@STARTUP@", startup)
            .replace("@PROGRAM@", program);
        let path = dir.join("docker");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        DockerRunner::build(DockerConfig {
            binary: path.display().to_string(),
            launch_timeout_seconds,
            ..DockerConfig::default()
        })
    }

    fn calls(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    async fn launch(runner: DockerRunner, spec: LaunchSpec) -> Result<StepOutput> {
        tokio::task::spawn_blocking(move || runner.launch(&spec))
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_container_startup_is_not_charged_to_the_run_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let runner = fake_runner(dir.path(), "exit 0", "0.8", "0.5", 120);
        let mut spec = spec(ResourceLimits::default(), false);
        spec.timeout = Duration::from_secs(1);

        let output = launch(runner, spec).await.unwrap();

        assert_eq!(output.exit, StepExit::Exited(0));
        assert_eq!(output.stdout.to_string_lossy(), "hello\n");
        assert!(calls(dir.path()).contains(&"rm --force --volumes ws-1234-run".to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_deadline_applies_once_running() {
        let dir = tempfile::tempdir().unwrap();
        let runner = fake_runner(dir.path(), "exit 0", "0", "2", 120);
        let mut spec = spec(ResourceLimits::default(), false);
        spec.timeout = Duration::from_secs(1);

        let output = launch(runner, spec).await.unwrap();

        assert_eq!(output.exit, StepExit::TimedOut);
        let calls = calls(dir.path());
        assert!(calls.contains(&"kill --signal KILL ws-1234-run".to_string()));
        assert!(calls.contains(&"rm --force --volumes ws-1234-run".to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timed_out_create_still_removes_the_container() {
        let dir = tempfile::tempdir().unwrap();
        let runner = fake_runner(dir.path(), "exec sleep 3", "0", "0", 1);

        let err = launch(runner, spec(ResourceLimits::default(), false))
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("timed out"));
        let calls = calls(dir.path());
        assert!(calls[0].starts_with("create "));
        assert_eq!(calls.last().unwrap(), "rm --force --volumes ws-1234-run");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_binary_fails_probe() {
        let runner = DockerRunner::build(DockerConfig {
            binary: "definitely-not-docker-xyz".to_string(),
            ..DockerConfig::default()
        });
        let probed = tokio::task::spawn_blocking(move || runner.probe())
            .await
            .unwrap();
        assert!(probed.is_err());
    }
}
