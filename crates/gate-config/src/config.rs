//! Global configuration for llm-gate (`~/.config/llm-gate/config.toml`).
//!
//! Holds the tuning knobs of all four control loops plus per-provider
//! concurrency presets. Every field has a default, so an absent file or an
//! absent section is equivalent to the built-in behavior.

use anyhow::{Context, Result, bail};
use gate_core::{GateError, ModelKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::env::EnvOverrides;
use crate::paths;

/// Default concurrency preset for a provider/model with no explicit entry.
const DEFAULT_CONCURRENCY: u32 = 4;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub adjuster: AdjusterConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Hard cap on concurrently running tasks in this process.
    pub max_total_concurrent: u32,
    /// Preset used when a provider has no `concurrency` entry.
    pub default_concurrency: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_total_concurrent: 8,
            default_concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// Reactive (in-memory) adjuster tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdjusterConfig {
    pub base: u32,
    pub min: u32,
    pub max: u32,
    /// Minimum time since the last adjustment before recovery may run.
    pub cooldown_ms: u64,
    /// Recovery is blocked while an error happened inside this window.
    pub error_window_ms: u64,
    pub recovery_factor: f64,
    pub sample_capacity: usize,
    /// Window used to count recent 429s for health and backoff.
    pub rate_limit_window_ms: u64,
}

impl Default for AdjusterConfig {
    fn default() -> Self {
        Self {
            base: DEFAULT_CONCURRENCY,
            min: 1,
            max: 16,
            cooldown_ms: 30_000,
            error_window_ms: 60_000,
            recovery_factor: 1.25,
            sample_capacity: 50,
            rate_limit_window_ms: 60_000,
        }
    }
}

/// Persisted (learned) limiter tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// `record_429` never cuts concurrency below this.
    pub min_concurrency: u32,
    pub sweep_interval_ms: u64,
    /// A scheduled recovery waits this long after the last 429.
    pub recovery_cooldown_ms: u64,
    /// Three 429s inside this window trigger the aggressive cut.
    pub quick_succession_ms: u64,
    pub state_path: Option<PathBuf>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            sweep_interval_ms: 60_000,
            recovery_cooldown_ms: 120_000,
            quick_succession_ms: 60_000,
            state_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Cluster-wide budget of concurrent LLM calls, split across instances.
    pub total_max_llm: u32,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// Debounce for own-record writes.
    pub min_write_interval_ms: u64,
    pub runtime_dir: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            total_max_llm: 6,
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 60_000,
            min_write_interval_ms: 1_000,
            runtime_dir: None,
        }
    }
}

/// Per-provider presets. `models` entries win over `concurrency`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub concurrency: Option<u32>,
    #[serde(default)]
    pub models: HashMap<String, u32>,
}

impl GateConfig {
    /// Load from the default path, then apply environment overrides.
    ///
    /// Returns defaults if the file does not exist or if the config
    /// directory cannot be determined (e.g., no HOME in containers).
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_path() {
            Ok(path) => Self::load_from(&path)?,
            Err(_) => Self::default(),
        };
        EnvOverrides::from_env().apply(&mut config);
        config
            .validate()
            .map_err(|err| GateError::Config(format!("{err:#}")))?;
        Ok(config)
    }

    /// Load a specific file; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    pub fn config_path() -> Result<PathBuf> {
        let dir = paths::config_dir().context("Failed to determine config directory")?;
        Ok(dir.join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        let adjuster = &self.adjuster;
        if adjuster.min == 0 {
            bail!("adjuster.min must be at least 1");
        }
        if adjuster.min > adjuster.max {
            bail!(
                "adjuster.min ({}) must not exceed adjuster.max ({})",
                adjuster.min,
                adjuster.max
            );
        }
        if !(adjuster.min..=adjuster.max).contains(&adjuster.base) {
            bail!(
                "adjuster.base ({}) must lie within [{}, {}]",
                adjuster.base,
                adjuster.min,
                adjuster.max
            );
        }
        if !(adjuster.recovery_factor.is_finite() && adjuster.recovery_factor > 1.0) {
            bail!("adjuster.recovery_factor must be a finite number greater than 1.0");
        }
        if adjuster.sample_capacity == 0 {
            bail!("adjuster.sample_capacity must be at least 1");
        }
        if self.scheduler.max_total_concurrent == 0 {
            bail!("scheduler.max_total_concurrent must be at least 1");
        }
        if self.coordinator.total_max_llm == 0 {
            bail!("coordinator.total_max_llm must be at least 1");
        }
        if self.coordinator.heartbeat_timeout_ms <= self.coordinator.heartbeat_interval_ms {
            bail!(
                "coordinator.heartbeat_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.coordinator.heartbeat_timeout_ms,
                self.coordinator.heartbeat_interval_ms
            );
        }
        Ok(())
    }

    /// Concurrency preset for a provider/model.
    ///
    /// Lookup order: `providers.<p>.models.<m>` -> `providers.<p>.concurrency`
    /// -> `scheduler.default_concurrency`.
    pub fn preset_for(&self, key: &ModelKey) -> u32 {
        self.providers
            .get(&key.provider)
            .and_then(|p| p.models.get(&key.model).copied().or(p.concurrency))
            .unwrap_or(self.scheduler.default_concurrency)
    }

    pub fn state_path(&self) -> PathBuf {
        self.limiter
            .state_path
            .clone()
            .unwrap_or_else(paths::default_state_path)
    }

    pub fn coordination_dir(&self) -> PathBuf {
        self.coordinator
            .runtime_dir
            .clone()
            .unwrap_or_else(paths::default_coordination_dir)
    }

    /// Generate default config TOML with comments as a template.
    pub fn default_template() -> String {
        r#"# llm-gate configuration
# Location: ~/.config/llm-gate/config.toml

[scheduler]
max_total_concurrent = 8   # Tasks running at once in this process
default_concurrency = 4    # Preset for providers without an entry below

[adjuster]
base = 4
min = 1
max = 16
cooldown_ms = 30000
error_window_ms = 60000
recovery_factor = 1.25

[limiter]
min_concurrency = 1
sweep_interval_ms = 60000
recovery_cooldown_ms = 120000
# state_path = "/path/to/adaptive-limits.json"

[coordinator]
total_max_llm = 6          # Shared by every running instance
heartbeat_interval_ms = 15000
heartbeat_timeout_ms = 60000

# [providers.openai]
# concurrency = 8
# [providers.openai.models]
# "gpt-4" = 4
"#
        .to_string()
    }

    /// Save the default template, creating directories as needed.
    pub fn save_default_template() -> Result<PathBuf> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        std::fs::write(&path, Self::default_template())
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(path)
    }
}
