use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::language::LanguageProfile;
use crate::limits::LimitPolicy;

#[derive(Parser, Debug, Default)]
#[command(name = "execbox", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file; built-in defaults are used without one
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Isolation runtime, overriding the configuration file
    #[arg(long = "runtime", value_enum)]
    pub runtime: Option<RuntimeKind>,

    /// Maximum number of simultaneous sandboxes, overriding the configuration file
    #[arg(long = "max-concurrent", short = 'j')]
    pub max_concurrent: Option<usize>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Docker,
    Simple,
}

impl CliArgs {
    /// Load the configuration from the specified file and apply the overrides
    pub fn to_config(&self) -> Result<Config> {
        let mut config = match &self.config_path {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        match self.runtime {
            Some(RuntimeKind::Docker) if !matches!(config.engine.runtime, RuntimeConfig::Docker(_)) => {
                config.engine.runtime = RuntimeConfig::Docker(DockerConfig::default());
            }
            Some(RuntimeKind::Simple) => config.engine.runtime = RuntimeConfig::Simple,
            _ => {}
        }
        if let Some(n) = self.max_concurrent {
            config.engine.max_concurrent = n;
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub limits: LimitPolicy,
    /// Extra languages; an entry with a built-in id replaces the built-in
    pub languages: Vec<LanguageProfile>,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open configuration file {path}"))?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader)
            .with_context(|| format!("failed to parse configuration file {path}"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.max_concurrent == 0 {
            bail!("engine.max_concurrent must not be 0");
        }
        if self.engine.max_source_bytes == 0 {
            bail!("engine.max_source_bytes must not be 0");
        }
        if self.engine.max_output_bytes == 0 {
            bail!("engine.max_output_bytes must not be 0");
        }
        if self.engine.build.timeout_seconds == 0 {
            bail!("engine.build.timeout_seconds must not be 0");
        }
        self.limits.validate().context("invalid limits section")
    }
}

#[derive(Deserialize, Debug)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub bind_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 12345,
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the per-request workspaces
    pub workspace_root: Option<PathBuf>,
    pub max_concurrent: usize,
    pub max_source_bytes: usize,
    /// Cap for each of stdout and stderr
    pub max_output_bytes: usize,
    pub build: BuildConfig,
    pub runtime: RuntimeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            max_concurrent: 4,
            max_source_bytes: 10_000,
            max_output_bytes: 64 * 1024,
            build: BuildConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl EngineConfig {
    /// The configured workspace root, or a directory in the user's cache
    pub fn workspace_root(&self) -> Result<PathBuf> {
        use directories::ProjectDirs;

        if let Some(root) = &self.workspace_root {
            return Ok(root.clone());
        }
        let proj_dirs =
            ProjectDirs::from("", "", "execbox").context("unable to find user directory")?;
        Ok(proj_dirs.cache_dir().join("workspaces"))
    }
}

#[derive(Deserialize, Debug)]
#[serde(default)]
pub struct BuildConfig {
    pub timeout_seconds: u64,
    pub memory_bytes: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 60,
            memory_bytes: 512 * 1024 * 1024,
        }
    }
}

impl BuildConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeConfig {
    Docker(DockerConfig),
    Simple,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::Docker(DockerConfig::default())
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DockerConfig {
    /// Docker-compatible CLI to drive (`docker`, `podman`...)
    pub binary: String,
    pub pids_limit: u32,
    /// Size of the writable tmpfs mounted at /tmp
    pub tmpfs_bytes: u64,
    /// Allowance for creating a container, image pull included
    pub launch_timeout_seconds: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            pids_limit: 64,
            tmpfs_bytes: 64 * 1024 * 1024,
            launch_timeout_seconds: 120,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_config_deserialization() {
        let config = Config::from_file("data/example.json").unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert_eq!(config.server.bind_port, 12345);
        assert_eq!(config.engine.max_concurrent, 8);
        assert_eq!(
            config.engine.runtime,
            RuntimeConfig::Docker(DockerConfig {
                pids_limit: 128,
                ..DockerConfig::default()
            })
        );
        assert_eq!(config.limits.default.timeout_seconds, 10);
        assert_eq!(config.languages[0].id, "ruby");
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.engine.max_source_bytes, 10_000);
        assert_eq!(config.engine.runtime, RuntimeConfig::default());
        assert_eq!(config.limits.default.memory_bytes, 128 * 1024 * 1024);
        assert!(config.languages.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_simple_runtime_is_tagged() {
        let config: Config =
            serde_json::from_str(r#"{ "engine": { "runtime": { "type": "simple" } } }"#).unwrap();
        assert_eq!(config.engine.runtime, RuntimeConfig::Simple);
    }

    #[test]
    fn test_cli_overrides() {
        let cli = CliArgs::parse_from(["execbox", "--runtime", "simple", "-j", "2"]);
        let config = cli.to_config().unwrap();
        assert_eq!(config.engine.runtime, RuntimeConfig::Simple);
        assert_eq!(config.engine.max_concurrent, 2);
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let cli = CliArgs::parse_from(["execbox", "-j", "0"]);
        assert!(cli.to_config().is_err());
    }

    #[test]
    fn test_explicit_workspace_root_wins() {
        let engine = EngineConfig {
            workspace_root: Some(PathBuf::from("/srv/execbox")),
            ..EngineConfig::default()
        };
        assert_eq!(engine.workspace_root().unwrap(), PathBuf::from("/srv/execbox"));
    }
}
