//! Configuration loading (`~/.config/llm-gate/config.toml`), XDG paths and environment overrides.

pub mod config;
pub mod env;
pub mod paths;

pub use config::{
    AdjusterConfig, CoordinatorConfig, GateConfig, LimiterConfig, ProviderConfig, SchedulerConfig,
};
pub use env::{EnvOverrides, parse_bounded};
