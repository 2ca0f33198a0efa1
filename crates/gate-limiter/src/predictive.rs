//! Predictive 429 scoring over a learned limit's history.
//!
//! Pure functions: the caller supplies the entry, the current time and the
//! effective limit. The score mixes how recent the last 429 is, how many
//! landed in the last ten minutes, and the current consecutive streak.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::store::LearnedLimit;

const RECENCY_WEIGHT: f64 = 0.5;
const FREQUENCY_WEIGHT: f64 = 0.3;
const CONSECUTIVE_WEIGHT: f64 = 0.2;

/// Decay constant of the recency term.
const RECENCY_TAU_MS: f64 = 5.0 * 60.0 * 1000.0;
const FREQUENCY_WINDOW_MINUTES: i64 = 10;
const FREQUENCY_SATURATION: f64 = 5.0;
const CONSECUTIVE_SATURATION: f64 = 3.0;
const CONFIDENCE_SAMPLES: f64 = 20.0;

/// Probability at or above which callers should throttle ahead of a 429.
pub const THROTTLE_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictiveAnalysis {
    pub predicted_429_probability: f64,
    pub should_proactively_throttle: bool,
    pub recommended_concurrency: u32,
    pub confidence: f64,
}

impl PredictiveAnalysis {
    /// Analysis for a key with no history.
    pub fn quiet(effective: u32, min: u32, max: u32) -> Self {
        Self {
            predicted_429_probability: 0.0,
            should_proactively_throttle: false,
            recommended_concurrency: effective.clamp(min, max),
            confidence: 0.0,
        }
    }
}

/// Probability in `[0, 1]` that the next call on this key gets a 429.
pub fn probability(limit: &LearnedLimit, now: DateTime<Utc>) -> f64 {
    let Some(last) = limit.last_429_at else {
        return 0.0;
    };

    // A clock that moved backwards counts as "just now".
    let age_ms = (now - last).num_milliseconds().max(0) as f64;
    let recency = (-age_ms / RECENCY_TAU_MS).exp();

    let window_start = now - Duration::minutes(FREQUENCY_WINDOW_MINUTES);
    let in_window = limit
        .recent_429_at
        .iter()
        .filter(|at| **at >= window_start)
        .count() as f64;
    let frequency = (in_window / FREQUENCY_SATURATION).min(1.0);

    let consecutive = (f64::from(limit.consecutive_429_count) / CONSECUTIVE_SATURATION).min(1.0);

    let p = RECENCY_WEIGHT * recency + FREQUENCY_WEIGHT * frequency + CONSECUTIVE_WEIGHT * consecutive;
    if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 }
}

pub fn analyze(
    limit: &LearnedLimit,
    now: DateTime<Utc>,
    effective: u32,
    min: u32,
    max: u32,
) -> PredictiveAnalysis {
    let p = probability(limit, now);
    let recommended = (f64::from(effective) * (1.0 - p)).round() as u32;
    let samples = limit.total_429_count.saturating_add(limit.total_success_count) as f64;
    PredictiveAnalysis {
        predicted_429_probability: p,
        should_proactively_throttle: p >= THROTTLE_THRESHOLD,
        recommended_concurrency: recommended.clamp(min, max),
        confidence: (samples / CONFIDENCE_SAMPLES).min(1.0),
    }
}
