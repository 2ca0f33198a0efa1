//! Lenient environment overrides.
//!
//! Unparseable or out-of-range values are ignored (logged at debug) so a bad
//! variable degrades to the configured default instead of failing startup.

use std::path::PathBuf;

use crate::config::GateConfig;

pub const ENV_TOTAL_MAX_LLM: &str = "LLM_GATE_TOTAL_MAX_LLM";
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "LLM_GATE_HEARTBEAT_INTERVAL_MS";
pub const ENV_HEARTBEAT_TIMEOUT_MS: &str = "LLM_GATE_HEARTBEAT_TIMEOUT_MS";
pub const ENV_MAX_TOTAL_CONCURRENT: &str = "LLM_GATE_MAX_TOTAL_CONCURRENT";
pub const ENV_RUNTIME_DIR: &str = "LLM_GATE_RUNTIME_DIR";
pub const ENV_STATE_PATH: &str = "LLM_GATE_STATE_PATH";

pub const TOTAL_MAX_LLM_RANGE: (u64, u64) = (1, 64);
pub const HEARTBEAT_INTERVAL_RANGE: (u64, u64) = (1_000, 600_000);
pub const HEARTBEAT_TIMEOUT_RANGE: (u64, u64) = (2_000, 3_600_000);
pub const MAX_TOTAL_CONCURRENT_RANGE: (u64, u64) = (1, 256);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub total_max_llm: Option<u32>,
    pub heartbeat_interval_ms: Option<u64>,
    pub heartbeat_timeout_ms: Option<u64>,
    pub max_total_concurrent: Option<u32>,
    pub runtime_dir: Option<PathBuf>,
    pub state_path: Option<PathBuf>,
}

/// Parse a whole number inside `[min, max]`; anything else is `None`.
pub fn parse_bounded(raw: &str, min: u64, max: u64) -> Option<u64> {
    let value: u64 = raw.trim().parse().ok()?;
    (min..=max).contains(&value).then_some(value)
}

fn bounded(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    (min, max): (u64, u64),
) -> Option<u64> {
    let raw = lookup(name)?;
    let parsed = parse_bounded(&raw, min, max);
    if parsed.is_none() {
        tracing::debug!(
            variable = name,
            value = %raw,
            min,
            max,
            "Ignoring invalid environment override"
        );
    }
    parsed
}

fn non_empty_path(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<PathBuf> {
    lookup(name)
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from)
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build overrides from an arbitrary variable source (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            total_max_llm: bounded(&lookup, ENV_TOTAL_MAX_LLM, TOTAL_MAX_LLM_RANGE)
                .map(|v| v as u32),
            heartbeat_interval_ms: bounded(
                &lookup,
                ENV_HEARTBEAT_INTERVAL_MS,
                HEARTBEAT_INTERVAL_RANGE,
            ),
            heartbeat_timeout_ms: bounded(&lookup, ENV_HEARTBEAT_TIMEOUT_MS, HEARTBEAT_TIMEOUT_RANGE),
            max_total_concurrent: bounded(
                &lookup,
                ENV_MAX_TOTAL_CONCURRENT,
                MAX_TOTAL_CONCURRENT_RANGE,
            )
            .map(|v| v as u32),
            runtime_dir: non_empty_path(&lookup, ENV_RUNTIME_DIR),
            state_path: non_empty_path(&lookup, ENV_STATE_PATH),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, config: &mut GateConfig) {
        if let Some(total) = self.total_max_llm {
            config.coordinator.total_max_llm = total;
        }
        if let Some(interval) = self.heartbeat_interval_ms {
            config.coordinator.heartbeat_interval_ms = interval;
        }
        if let Some(timeout) = self.heartbeat_timeout_ms {
            config.coordinator.heartbeat_timeout_ms = timeout;
        }
        if let Some(max_total) = self.max_total_concurrent {
            config.scheduler.max_total_concurrent = max_total;
        }
        if let Some(dir) = &self.runtime_dir {
            config.coordinator.runtime_dir = Some(dir.clone());
        }
        if let Some(path) = &self.state_path {
            config.limiter.state_path = Some(path.clone());
        }
    }
}
