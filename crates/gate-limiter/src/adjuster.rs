//! Reactive, process-local parallelism adjuster.
//!
//! One entry per `provider:model`, created lazily on first touch and never
//! persisted. Errors cut `current` multiplicatively right away; recovery
//! climbs back toward `base` only after a cooldown without errors.

use chrono::{DateTime, Duration, Utc};
use gate_config::AdjusterConfig;
use gate_core::{ErrorKind, ModelKey, ObserverList, SharedClock, Subscription};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

const MAX_BACKOFF_MS: u64 = 60_000;
const BASE_BACKOFF_MS: u64 = 1_000;

/// Multiplier applied to `current` for one error of the given kind.
pub fn error_factor(kind: ErrorKind) -> f64 {
    match kind {
        ErrorKind::RateLimit => 0.7,
        ErrorKind::Timeout => 0.9,
        ErrorKind::Other => 0.95,
    }
}

/// Emitted to `on_parallelism_change` subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParallelismChange {
    pub key: ModelKey,
    pub previous: u32,
    pub current: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdjusterHealth {
    pub healthy: bool,
    pub active_requests: u32,
    pub recent_429_count: usize,
    pub avg_response_ms: f64,
    pub recommended_backoff_ms: u64,
    pub current: u32,
    pub base: u32,
}

/// Read-only view of one entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdjusterSnapshot {
    pub key: ModelKey,
    pub base: u32,
    pub current: u32,
    pub min: u32,
    pub max: u32,
    pub reason: String,
    pub last_adjusted_at: Option<DateTime<Utc>>,
    pub active_requests: u32,
}

#[derive(Debug)]
struct AdjusterEntry {
    base: u32,
    current: u32,
    min: u32,
    max: u32,
    reason: String,
    last_adjusted_at: Option<DateTime<Utc>>,
    last_error_at: Option<DateTime<Utc>>,
    active_requests: u32,
    response_samples: VecDeque<u64>,
    recent_429s: VecDeque<DateTime<Utc>>,
    applied_instance_count: u32,
}

impl AdjusterEntry {
    fn new(config: &AdjusterConfig) -> Self {
        let min = config.min.max(1);
        let max = config.max.max(min);
        let base = config.base.clamp(min, max);
        Self {
            base,
            current: base,
            min,
            max,
            reason: "initial".to_string(),
            last_adjusted_at: None,
            last_error_at: None,
            active_requests: 0,
            response_samples: VecDeque::with_capacity(config.sample_capacity),
            recent_429s: VecDeque::new(),
            applied_instance_count: 1,
        }
    }

    fn clamp(&self, value: u32) -> u32 {
        value.clamp(self.min, self.max)
    }

    fn prune_429s(&mut self, now: DateTime<Utc>, window: Duration) {
        while self
            .recent_429s
            .front()
            .is_some_and(|at| now - *at > window)
        {
            self.recent_429s.pop_front();
        }
    }

    fn avg_response_ms(&self) -> f64 {
        if self.response_samples.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.response_samples.iter().sum();
        sum as f64 / self.response_samples.len() as f64
    }

    fn snapshot(&self, key: &ModelKey) -> AdjusterSnapshot {
        AdjusterSnapshot {
            key: key.clone(),
            base: self.base,
            current: self.current,
            min: self.min,
            max: self.max,
            reason: self.reason.clone(),
            last_adjusted_at: self.last_adjusted_at,
            active_requests: self.active_requests,
        }
    }
}

pub struct ReactiveAdjuster {
    config: AdjusterConfig,
    clock: SharedClock,
    entries: Mutex<HashMap<ModelKey, AdjusterEntry>>,
    observers: ObserverList<ParallelismChange>,
}

impl std::fmt::Debug for ReactiveAdjuster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveAdjuster")
            .field("config", &self.config)
            .field("entries", &self.lock().len())
            .finish()
    }
}

impl ReactiveAdjuster {
    pub fn new(config: AdjusterConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            entries: Mutex::new(HashMap::new()),
            observers: ObserverList::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ModelKey, AdjusterEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn window(ms: u64) -> Duration {
        Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
    }

    /// Run `f` on the (lazily created) entry, then notify subscribers of any
    /// change it reports. The entry lock is released before callbacks run.
    fn with_entry<R>(
        &self,
        key: &ModelKey,
        f: impl FnOnce(&mut AdjusterEntry, DateTime<Utc>) -> (R, Option<ParallelismChange>),
    ) -> R {
        let now = self.clock.now();
        let (result, change) = {
            let mut entries = self.lock();
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| AdjusterEntry::new(&self.config));
            f(entry, now)
        };
        if let Some(change) = change {
            self.observers.notify(&change);
        }
        result
    }

    /// Current allowed parallelism, always within `[min, max]`.
    pub fn get_parallelism(&self, key: &ModelKey) -> u32 {
        self.with_entry(key, |entry, _| (entry.clamp(entry.current), None))
    }

    /// Cut `current` for one observed error. Compounds across repeated errors.
    pub fn adjust_for_error(&self, key: &ModelKey, kind: ErrorKind) -> u32 {
        let rate_window = Self::window(self.config.rate_limit_window_ms);
        self.with_entry(key, |entry, now| {
            let previous = entry.current;
            let scaled = (f64::from(previous) * error_factor(kind)).floor() as u32;
            entry.current = entry.clamp(scaled);
            entry.last_adjusted_at = Some(now);
            entry.last_error_at = Some(now);
            entry.reason = format!("{kind} error: {previous} -> {}", entry.current);
            if kind == ErrorKind::RateLimit {
                entry.recent_429s.push_back(now);
            }
            entry.prune_429s(now, rate_window);

            info!(
                key = %key,
                kind = %kind,
                from = previous,
                to = entry.current,
                "Reduced parallelism after provider error"
            );
            let change = ParallelismChange {
                key: key.clone(),
                previous,
                current: entry.current,
                reason: entry.reason.clone(),
            };
            (entry.current, Some(change))
        })
    }

    /// Climb back toward `base` once the cooldown passed without errors.
    /// Returns true when `current` changed.
    pub fn attempt_recovery(&self, key: &ModelKey) -> bool {
        let cooldown = Self::window(self.config.cooldown_ms);
        let error_window = Self::window(self.config.error_window_ms);
        let factor = self.config.recovery_factor;
        self.with_entry(key, |entry, now| {
            if entry.current >= entry.base {
                return (false, None);
            }
            if entry
                .last_adjusted_at
                .is_some_and(|at| now - at < cooldown)
            {
                return (false, None);
            }
            if entry
                .last_error_at
                .is_some_and(|at| now - at < error_window)
            {
                return (false, None);
            }

            let previous = entry.current;
            let raised = (f64::from(previous) * factor).ceil() as u32;
            entry.current = entry.clamp(raised.max(previous + 1).min(entry.base));
            entry.last_adjusted_at = Some(now);
            entry.reason = format!("recovery: {previous} -> {}", entry.current);

            debug!(key = %key, from = previous, to = entry.current, "Recovered parallelism");
            let change = ParallelismChange {
                key: key.clone(),
                previous,
                current: entry.current,
                reason: entry.reason.clone(),
            };
            (true, Some(change))
        })
    }

    /// Split `base` evenly across `instance_count` live instances.
    ///
    /// A count of 0 or 1 is a no-op, and so is repeating the last applied count.
    pub fn apply_cross_instance_limits(&self, key: &ModelKey, instance_count: u32) -> u32 {
        self.with_entry(key, |entry, now| {
            if instance_count <= 1 || instance_count == entry.applied_instance_count {
                if instance_count <= 1 {
                    entry.applied_instance_count = 1;
                }
                return (entry.clamp(entry.current), None);
            }
            entry.applied_instance_count = instance_count;

            let previous = entry.current;
            let share = entry.min.max(entry.base / instance_count);
            entry.current = entry.clamp(share);
            entry.last_adjusted_at = Some(now);
            entry.reason = format!(
                "cross-instance: {instance_count} instances share base {}",
                entry.base
            );
            if previous == entry.current {
                return (entry.current, None);
            }
            let change = ParallelismChange {
                key: key.clone(),
                previous,
                current: entry.current,
                reason: entry.reason.clone(),
            };
            (entry.current, Some(change))
        })
    }

    /// Append a response time to the bounded sample ring.
    pub fn record_success(&self, key: &ModelKey, response_ms: u64) {
        let capacity = self.config.sample_capacity.max(1);
        self.with_entry(key, |entry, _| {
            if entry.response_samples.len() >= capacity {
                entry.response_samples.pop_front();
            }
            entry.response_samples.push_back(response_ms);
            ((), None)
        })
    }

    pub fn request_started(&self, key: &ModelKey) {
        self.with_entry(key, |entry, _| {
            entry.active_requests = entry.active_requests.saturating_add(1);
            ((), None)
        })
    }

    pub fn request_completed(&self, key: &ModelKey) {
        self.with_entry(key, |entry, _| {
            entry.active_requests = entry.active_requests.saturating_sub(1);
            ((), None)
        })
    }

    pub fn get_health(&self, key: &ModelKey) -> AdjusterHealth {
        let rate_window = Self::window(self.config.rate_limit_window_ms);
        self.with_entry(key, |entry, now| {
            entry.prune_429s(now, rate_window);
            let recent = entry.recent_429s.len();
            let health = AdjusterHealth {
                healthy: recent == 0,
                active_requests: entry.active_requests,
                recent_429_count: recent,
                avg_response_ms: entry.avg_response_ms(),
                recommended_backoff_ms: recommended_backoff_ms(recent),
                current: entry.current,
                base: entry.base,
            };
            (health, None)
        })
    }

    /// Restore `current = base` and clear history for one key.
    pub fn reset(&self, key: &ModelKey) {
        let change = {
            let mut entries = self.lock();
            let Some(old) = entries.remove(key) else {
                return;
            };
            let mut fresh = AdjusterEntry::new(&self.config);
            // In-flight requests survive a reset; they still have to complete.
            fresh.active_requests = old.active_requests;
            let change = (old.current != fresh.current).then(|| ParallelismChange {
                key: key.clone(),
                previous: old.current,
                current: fresh.current,
                reason: "reset".to_string(),
            });
            entries.insert(key.clone(), fresh);
            change
        };
        if let Some(change) = change {
            self.observers.notify(&change);
        }
    }

    pub fn reset_all(&self) {
        let keys: Vec<ModelKey> = self.lock().keys().cloned().collect();
        for key in keys {
            self.reset(&key);
        }
    }

    pub fn on_parallelism_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ParallelismChange) + Send + Sync + 'static,
    {
        self.observers.subscribe(callback)
    }

    pub fn snapshot(&self) -> Vec<AdjusterSnapshot> {
        let entries = self.lock();
        let mut all: Vec<AdjusterSnapshot> = entries
            .iter()
            .map(|(key, entry)| entry.snapshot(key))
            .collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }
}

/// Exponential backoff in the number of 429s seen in the trailing window.
pub fn recommended_backoff_ms(recent_429s: usize) -> u64 {
    if recent_429s == 0 {
        return 0;
    }
    let exponent = (recent_429s - 1).min(16) as u32;
    BASE_BACKOFF_MS
        .saturating_mul(2u64.saturating_pow(exponent))
        .min(MAX_BACKOFF_MS)
}

#[cfg(test)]
#[path = "adjuster_tests.rs"]
mod tests;
