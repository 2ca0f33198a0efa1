//! Persisted, cross-restart concurrency limiter.
//!
//! Learns a per-`provider:model` ceiling from 429s and keeps it in the shared
//! state file so that the next process starts from what this one learned.
//! Decreases are immediate; increases only happen in the recovery sweep.

use anyhow::Result;
use chrono::Duration as ChronoDuration;
use gate_config::{GateConfig, LimiterConfig};
use gate_core::{CancellationToken, ModelKey, SharedClock};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::predictive::{self, PredictiveAnalysis};
use crate::rate_limit;
use crate::store::{AdaptiveState, LearnedLimit, StateStore};

pub const HARD_MIN_CONCURRENCY: u32 = 1;
pub const HARD_MAX_CONCURRENCY: u32 = 16;

const MIN_MULTIPLIER: f64 = 0.1;
const MAX_MULTIPLIER: f64 = 2.0;
const DECREASE_FACTOR: f64 = 0.7;
/// Streak length that triggers the drop to the floor.
const AGGRESSIVE_STREAK: u32 = 3;
const RECENT_429_CAPACITY: usize = 20;
const DEFAULT_PRESET: u32 = 4;

#[derive(Debug)]
struct LimiterInner {
    state: AdaptiveState,
    /// Disk version this process last loaded or wrote.
    last_synced_version: u64,
    dirty: bool,
}

#[derive(Debug)]
struct Controller {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
pub struct AdaptiveLimiter {
    config: LimiterConfig,
    clock: SharedClock,
    store: Option<StateStore>,
    default_preset: u32,
    inner: Mutex<LimiterInner>,
    controller: Mutex<Option<Controller>>,
}

impl AdaptiveLimiter {
    /// Load learned state from `path` (see [`StateStore::load`]).
    pub fn open(config: LimiterConfig, path: impl Into<PathBuf>, clock: SharedClock) -> Self {
        let store = StateStore::new(path);
        let loaded = store.load();
        debug!(
            path = %store.path().display(),
            version = loaded.state.version,
            limits = loaded.state.limits.len(),
            "Loaded adaptive limiter state"
        );
        Self::build(
            config,
            Some(store),
            clock,
            LimiterInner {
                state: loaded.state,
                last_synced_version: loaded.disk_version,
                dirty: false,
            },
        )
    }

    /// Limiter that never touches the filesystem.
    pub fn in_memory(config: LimiterConfig, clock: SharedClock) -> Self {
        Self::build(
            config,
            None,
            clock,
            LimiterInner {
                state: AdaptiveState::default(),
                last_synced_version: 0,
                dirty: false,
            },
        )
    }

    pub fn from_config(config: &GateConfig, clock: SharedClock) -> Self {
        Self::open(config.limiter.clone(), config.state_path(), clock)
            .with_default_preset(config.scheduler.default_concurrency)
    }

    fn build(
        config: LimiterConfig,
        store: Option<StateStore>,
        clock: SharedClock,
        inner: LimiterInner,
    ) -> Self {
        Self {
            config,
            clock,
            store,
            default_preset: DEFAULT_PRESET,
            inner: Mutex::new(inner),
            controller: Mutex::new(None),
        }
    }

    /// Preset used when a key is first seen through `record_429` or
    /// `record_success` instead of `get_effective_limit`.
    pub fn with_default_preset(mut self, preset: u32) -> Self {
        self.default_preset = clamp_hard(preset);
        self
    }

    pub fn state_path(&self) -> Option<&Path> {
        self.store.as_ref().map(StateStore::path)
    }

    fn lock(&self) -> MutexGuard<'_, LimiterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn floor(&self) -> u32 {
        clamp_hard(self.config.min_concurrency)
    }

    /// Write the document now. Failures are logged and leave the state
    /// dirty so the next sweep or flush retries.
    fn persist(&self, inner: &mut LimiterInner) {
        inner.state.updated_at = Some(self.clock.now());
        let Some(store) = &self.store else {
            inner.state.version += 1;
            inner.dirty = false;
            return;
        };
        match store.save(&mut inner.state, inner.last_synced_version) {
            Ok(version) => {
                inner.last_synced_version = version;
                inner.dirty = false;
            }
            Err(err) => {
                warn!(
                    path = %store.path().display(),
                    error = %format!("{err:#}"),
                    "Failed to save adaptive limiter state"
                );
                inner.dirty = true;
            }
        }
    }

    /// Learned ceiling for `key`, scaled by the global multiplier and
    /// clamped to `[1, 16]`. First access seeds the entry from `preset`.
    pub fn get_effective_limit(&self, key: &ModelKey, preset: u32) -> u32 {
        let mut inner = self.lock();
        let name = key.to_string();
        if !inner.state.limits.contains_key(&name) {
            inner
                .state
                .limits
                .insert(name.clone(), LearnedLimit::new(clamp_hard(preset)));
            inner.dirty = true;
        }
        let concurrency = inner.state.limits[&name].concurrency;
        scaled(concurrency, inner.state.global_multiplier)
    }

    pub fn record_429(&self, key: &ModelKey) {
        let now = self.clock.now();
        let floor = self.floor();
        let quick = millis(self.config.quick_succession_ms);
        let default_preset = self.default_preset;

        let mut inner = self.lock();
        let entry = inner
            .state
            .limits
            .entry(key.to_string())
            .or_insert_with(|| LearnedLimit::new(default_preset));

        let before = entry.concurrency;
        entry.total_429_count += 1;
        entry.consecutive_429_count += 1;
        entry.last_429_at = Some(now);
        entry.recent_429_at.push(now);
        if entry.recent_429_at.len() > RECENT_429_CAPACITY {
            let excess = entry.recent_429_at.len() - RECENT_429_CAPACITY;
            entry.recent_429_at.drain(..excess);
        }

        let reduced = (f64::from(entry.concurrency) * DECREASE_FACTOR).floor() as u32;
        entry.concurrency = reduced.max(floor);

        let streak = entry.consecutive_429_count;
        if entry.consecutive_429_count >= AGGRESSIVE_STREAK && entry.recent_429_at.len() >= 3 {
            let third_latest = entry.recent_429_at[entry.recent_429_at.len() - 3];
            if now - third_latest <= quick {
                entry.concurrency = floor.max(HARD_MIN_CONCURRENCY);
            }
        }
        entry.recovery_scheduled = false;
        let after = entry.concurrency;

        info!(
            key = %key,
            from = before,
            to = after,
            consecutive = streak,
            "Learned limit lowered after 429"
        );
        self.persist(&mut inner);
    }

    pub fn record_success(&self, key: &ModelKey) {
        let now = self.clock.now();
        let default_preset = self.default_preset;

        let mut inner = self.lock();
        let entry = inner
            .state
            .limits
            .entry(key.to_string())
            .or_insert_with(|| LearnedLimit::new(default_preset));

        entry.last_success_at = Some(now);
        entry.consecutive_429_count = 0;
        entry.total_success_count += 1;

        let newly_scheduled =
            entry.concurrency < entry.original_concurrency && !entry.recovery_scheduled;
        if newly_scheduled {
            entry.recovery_scheduled = true;
            debug!(key = %key, "Recovery scheduled");
        }
        // Written by the next sweep or flush, off the completion path.
        inner.dirty = true;
    }

    /// With `Some(n)`, pin the key to `n` and forget its history; with
    /// `None`, drop the entry so the next access re-seeds from the preset.
    pub fn reset_learned_limit(&self, key: &ModelKey, new_limit: Option<u32>) {
        let mut inner = self.lock();
        match new_limit {
            Some(limit) => {
                let limit = clamp_hard(limit);
                inner
                    .state
                    .limits
                    .insert(key.to_string(), LearnedLimit::new(limit));
                info!(key = %key, limit, "Learned limit reset");
            }
            None => {
                inner.state.limits.remove(&key.to_string());
                info!(key = %key, "Learned limit removed");
            }
        }
        self.persist(&mut inner);
    }

    pub fn reset_all_learned_limits(&self) {
        let mut inner = self.lock();
        inner.state.limits.clear();
        inner.state.global_multiplier = 1.0;
        info!("All learned limits reset");
        self.persist(&mut inner);
    }

    /// Clamp finite values to `[0.1, 2.0]`; NaN and infinities are ignored.
    /// Returns the multiplier in effect afterwards.
    pub fn set_global_multiplier(&self, multiplier: f64) -> f64 {
        let mut inner = self.lock();
        if !multiplier.is_finite() {
            debug!(multiplier, "Ignoring non-finite global multiplier");
            return inner.state.global_multiplier;
        }
        let clamped = multiplier.clamp(MIN_MULTIPLIER, MAX_MULTIPLIER);
        inner.state.global_multiplier = clamped;
        info!(multiplier = clamped, "Global multiplier set");
        self.persist(&mut inner);
        clamped
    }

    pub fn global_multiplier(&self) -> f64 {
        self.lock().state.global_multiplier
    }

    pub fn get_adaptive_state(&self) -> AdaptiveState {
        self.lock().state.clone()
    }

    pub fn learned_limit(&self, key: &ModelKey) -> Option<LearnedLimit> {
        self.lock().state.limits.get(&key.to_string()).cloned()
    }

    pub fn is_rate_limit_error<E>(err: Option<&E>) -> bool
    where
        E: std::fmt::Display + ?Sized,
    {
        rate_limit::is_rate_limit_error(err)
    }

    pub fn analyze_429_probability(&self, key: &ModelKey) -> f64 {
        let now = self.clock.now();
        self.lock()
            .state
            .limits
            .get(&key.to_string())
            .map_or(0.0, |limit| predictive::probability(limit, now))
    }

    pub fn get_predictive_analysis(&self, key: &ModelKey) -> PredictiveAnalysis {
        let now = self.clock.now();
        let inner = self.lock();
        let multiplier = inner.state.global_multiplier;
        match inner.state.limits.get(&key.to_string()) {
            Some(limit) => predictive::analyze(
                limit,
                now,
                scaled(limit.concurrency, multiplier),
                HARD_MIN_CONCURRENCY,
                HARD_MAX_CONCURRENCY,
            ),
            None => PredictiveAnalysis::quiet(
                scaled(self.default_preset, multiplier),
                HARD_MIN_CONCURRENCY,
                HARD_MAX_CONCURRENCY,
            ),
        }
    }

    /// Lower `current` ahead of an expected 429; never raises it.
    pub fn get_predictive_concurrency(&self, key: &ModelKey, current: u32) -> u32 {
        let analysis = self.get_predictive_analysis(key);
        let value = if analysis.should_proactively_throttle {
            current.min(analysis.recommended_concurrency)
        } else {
            current
        };
        clamp_hard(value)
    }

    /// One step of conservative recovery: `+1` for each scheduled entry whose
    /// last 429 is older than the cooldown. Returns how many entries moved.
    pub fn run_recovery_sweep(&self) -> usize {
        let now = self.clock.now();
        let cooldown = millis(self.config.recovery_cooldown_ms);

        let mut inner = self.lock();
        let mut stepped = 0;
        let mut changed = false;
        for (name, entry) in inner.state.limits.iter_mut() {
            if !entry.recovery_scheduled {
                continue;
            }
            let cooled = entry.last_429_at.is_none_or(|at| now - at >= cooldown);
            if !cooled {
                continue;
            }
            if entry.concurrency < entry.original_concurrency {
                entry.concurrency += 1;
                stepped += 1;
                debug!(key = %name, to = entry.concurrency, "Learned limit recovered one step");
            }
            if entry.concurrency >= entry.original_concurrency {
                entry.recovery_scheduled = false;
                info!(key = %name, limit = entry.concurrency, "Learned limit fully recovered");
            }
            changed = true;
        }

        if changed || inner.dirty {
            self.persist(&mut inner);
        }
        stepped
    }

    /// Write pending changes, if any.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.lock();
        if !inner.dirty {
            return Ok(());
        }
        self.persist(&mut inner);
        if inner.dirty {
            anyhow::bail!("adaptive limiter state is still dirty after flush");
        }
        Ok(())
    }

    /// Start the recovery sweep ticker. Calling it again while the ticker is
    /// alive does nothing. Must be called inside a Tokio runtime.
    pub fn init_adaptive_controller(self: &Arc<Self>) {
        let mut controller = self
            .controller
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if controller
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
        {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let weak = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.sweep_interval_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(limiter) = weak.upgrade() else { break };
                        limiter.run_recovery_sweep();
                    }
                }
            }
        });
        debug!(interval_ms = self.config.sweep_interval_ms, "Adaptive controller started");
        *controller = Some(Controller { cancel, handle });
    }

    pub fn is_controller_running(&self) -> bool {
        self.controller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Stop the sweep ticker, wait for it, then flush.
    pub async fn shutdown_adaptive_controller(&self) {
        let running = self
            .controller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(err) = running.handle.await {
                debug!(error = %err, "Adaptive controller task ended abnormally");
            }
        }
        if let Err(err) = self.flush() {
            warn!(error = %format!("{err:#}"), "Final adaptive limiter flush failed");
        }
    }
}

fn clamp_hard(value: u32) -> u32 {
    value.clamp(HARD_MIN_CONCURRENCY, HARD_MAX_CONCURRENCY)
}

fn scaled(concurrency: u32, multiplier: f64) -> u32 {
    let value = (f64::from(concurrency) * multiplier).round();
    if !value.is_finite() {
        return clamp_hard(concurrency);
    }
    (value as u32).clamp(HARD_MIN_CONCURRENCY, HARD_MAX_CONCURRENCY)
}

fn millis(ms: u64) -> ChronoDuration {
    i64::try_from(ms)
        .ok()
        .and_then(ChronoDuration::try_milliseconds)
        .unwrap_or(ChronoDuration::MAX)
}

#[cfg(test)]
#[path = "adaptive_tests.rs"]
mod tests;
