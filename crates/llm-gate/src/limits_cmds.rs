use anyhow::{Result, bail};
use gate_config::GateConfig;
use gate_core::{ModelKey, OutputFormat, system_clock};
use gate_limiter::{AdaptiveLimiter, AdaptiveState, PredictiveAnalysis};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LimitsReport {
    state: AdaptiveState,
    predictive: BTreeMap<String, PredictiveAnalysis>,
}

fn open(config: &GateConfig) -> AdaptiveLimiter {
    AdaptiveLimiter::from_config(config, system_clock())
}

fn report(limiter: &AdaptiveLimiter) -> LimitsReport {
    let state = limiter.get_adaptive_state();
    let predictive = state
        .limits
        .keys()
        .filter_map(|name| {
            let key = ModelKey::parse(name)?;
            Some((name.clone(), limiter.get_predictive_analysis(&key)))
        })
        .collect();
    LimitsReport { state, predictive }
}

fn render_limits(report: &LimitsReport) -> String {
    let state = &report.state;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Global multiplier: {:.2} (version {})",
        state.global_multiplier, state.version
    );
    if state.limits.is_empty() {
        out.push_str("No learned limits.\n");
        return out;
    }
    let _ = writeln!(
        out,
        "{:<32} {:>5} {:>8} {:>7} {:>7} {:>8} {:>6}",
        "MODEL", "LIMIT", "ORIGINAL", "STREAK", "429S", "RECOVERY", "P(429)"
    );
    for (name, limit) in &state.limits {
        let probability = report
            .predictive
            .get(name)
            .map_or(0.0, |analysis| analysis.predicted_429_probability);
        let _ = writeln!(
            out,
            "{:<32} {:>5} {:>8} {:>7} {:>7} {:>8} {:>6.2}",
            name,
            limit.concurrency,
            limit.original_concurrency,
            limit.consecutive_429_count,
            limit.total_429_count,
            if limit.recovery_scheduled { "yes" } else { "no" },
            probability
        );
    }
    out
}

pub(crate) fn handle_limits(config: &GateConfig, format: OutputFormat) -> Result<()> {
    let limiter = open(config);
    let report = report(&limiter);
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print!("{}", render_limits(&report)),
    }
    Ok(())
}

pub(crate) fn handle_multiplier(config: &GateConfig, value: f64, format: OutputFormat) -> Result<()> {
    if !value.is_finite() {
        bail!("Multiplier must be a finite number, got {value}");
    }
    let limiter = open(config);
    let applied = limiter.set_global_multiplier(value);
    limiter.flush()?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::json!({ "globalMultiplier": applied })),
        OutputFormat::Text => println!("Global multiplier set to {applied:.2}"),
    }
    Ok(())
}

/// Which learned limits a `reset` touches.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ResetTarget {
    All,
    Key { key: ModelKey, limit: Option<u32> },
}

impl ResetTarget {
    pub(crate) fn from_args(
        provider: Option<String>,
        model: Option<String>,
        limit: Option<u32>,
    ) -> Result<Self> {
        match (provider, model) {
            (Some(provider), Some(model)) => Ok(Self::Key {
                key: ModelKey::new(provider, model),
                limit,
            }),
            (None, None) if limit.is_none() => Ok(Self::All),
            (None, None) => bail!("--limit needs --provider and --model"),
            _ => bail!("--provider and --model must be given together"),
        }
    }
}

pub(crate) fn handle_reset(config: &GateConfig, target: ResetTarget, format: OutputFormat) -> Result<()> {
    let limiter = open(config);
    apply_reset(&limiter, &target);
    limiter.flush()?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report(&limiter))?),
        OutputFormat::Text => match &target {
            ResetTarget::All => println!("Reset all learned limits"),
            ResetTarget::Key { key, limit: Some(n) } => println!("Pinned {key} to {n}"),
            ResetTarget::Key { key, limit: None } => println!("Reset learned limit for {key}"),
        },
    }
    Ok(())
}

fn apply_reset(limiter: &AdaptiveLimiter, target: &ResetTarget) {
    match target {
        ResetTarget::All => limiter.reset_all_learned_limits(),
        ResetTarget::Key { key, limit } => limiter.reset_learned_limit(key, *limit),
    }
}
