use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Smallest memory ceiling the container runtime accepts
pub const MIN_MEMORY_BYTES: u64 = 6 * 1024 * 1024;
pub const MIN_CPU_SHARE: f64 = 0.01;
pub const MIN_TIMEOUT_SECONDS: u64 = 1;

/// Constraints applied to one sandbox
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    /// Fraction of one core
    pub cpu_share: f64,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub network_enabled: bool,
    #[serde(default)]
    pub filesystem_writable: bool,
}

impl ResourceLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 128 * 1024 * 1024,
            cpu_share: 0.5,
            timeout_seconds: 15,
            network_enabled: false,
            filesystem_writable: false,
        }
    }
}

/// Per-request adjustments, merged against the administrator maxima
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOverrides {
    pub memory_bytes: Option<u64>,
    pub cpu_share: Option<f64>,
    pub timeout_seconds: Option<u64>,
    pub network_enabled: Option<bool>,
    pub filesystem_writable: Option<bool>,
}

/// Process-wide default limits plus the maxima a request may ask for
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LimitPolicy {
    #[serde(default)]
    pub default: ResourceLimits,
    #[serde(default = "default_max_limits")]
    pub max: ResourceLimits,
}

fn default_max_limits() -> ResourceLimits {
    ResourceLimits {
        memory_bytes: 512 * 1024 * 1024,
        cpu_share: 2.0,
        timeout_seconds: 60,
        network_enabled: false,
        filesystem_writable: false,
    }
}

impl Default for LimitPolicy {
    fn default() -> Self {
        Self {
            default: ResourceLimits::default(),
            max: default_max_limits(),
        }
    }
}

impl LimitPolicy {
    /// Checks that the policy is usable: every default is sane and within the maxima
    pub fn validate(&self) -> Result<()> {
        let (d, m) = (&self.default, &self.max);

        if d.memory_bytes < MIN_MEMORY_BYTES {
            bail!("default memory limit is below {MIN_MEMORY_BYTES} bytes");
        }
        if !d.cpu_share.is_finite() || d.cpu_share < MIN_CPU_SHARE || !m.cpu_share.is_finite() {
            bail!("cpu shares must be finite and at least {MIN_CPU_SHARE}");
        }
        if d.timeout_seconds < MIN_TIMEOUT_SECONDS {
            bail!("default timeout must be at least {MIN_TIMEOUT_SECONDS}s");
        }
        if d.memory_bytes > m.memory_bytes
            || d.cpu_share > m.cpu_share
            || d.timeout_seconds > m.timeout_seconds
        {
            bail!("default limits exceed the configured maxima");
        }
        if (d.network_enabled && !m.network_enabled)
            || (d.filesystem_writable && !m.filesystem_writable)
        {
            bail!("default permissions exceed the configured maxima");
        }
        Ok(())
    }

    /// Merges `overrides` into the defaults.
    ///
    /// Values above the maxima are clamped down to them; permissions the maxima
    /// do not grant stay off. Values that make no sense at all (zero memory, a
    /// non-finite CPU share...) are rejected with `InvalidInput`.
    pub fn resolve(&self, overrides: Option<&ResourceOverrides>) -> EngineResult<ResourceLimits> {
        let mut limits = self.default.clone();
        let Some(overrides) = overrides else {
            return Ok(limits);
        };

        if let Some(memory) = overrides.memory_bytes {
            if memory == 0 {
                return Err(EngineError::InvalidInput(
                    "memoryBytes must be positive".to_string(),
                ));
            }
            limits.memory_bytes = memory.max(MIN_MEMORY_BYTES).min(self.max.memory_bytes);
        }

        if let Some(cpu) = overrides.cpu_share {
            if !cpu.is_finite() || cpu <= 0.0 {
                return Err(EngineError::InvalidInput(
                    "cpuShare must be a positive number".to_string(),
                ));
            }
            limits.cpu_share = cpu.max(MIN_CPU_SHARE).min(self.max.cpu_share);
        }

        if let Some(timeout) = overrides.timeout_seconds {
            if timeout == 0 {
                return Err(EngineError::InvalidInput(
                    "timeoutSeconds must be positive".to_string(),
                ));
            }
            limits.timeout_seconds = timeout.min(self.max.timeout_seconds);
        }

        if let Some(network) = overrides.network_enabled {
            limits.network_enabled = network && self.max.network_enabled;
        }
        if let Some(writable) = overrides.filesystem_writable {
            limits.filesystem_writable = writable && self.max.filesystem_writable;
        }

        if limits != self.default {
            log::debug!("resource overrides resolved to {limits:?}");
        }
        Ok(limits)
    }
}
