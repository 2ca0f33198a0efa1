//! Concurrency limiters: the in-memory reactive adjuster and the persisted,
//! predictive adaptive limiter, plus 429 / timeout classification.

pub mod adaptive;
pub mod adjuster;
pub mod predictive;
pub mod rate_limit;
pub mod store;

pub use adaptive::{AdaptiveLimiter, HARD_MAX_CONCURRENCY, HARD_MIN_CONCURRENCY};
pub use adjuster::{AdjusterHealth, AdjusterSnapshot, ParallelismChange, ReactiveAdjuster};
pub use predictive::PredictiveAnalysis;
pub use rate_limit::{RateLimitDetected, classify_error, detect_rate_limit, is_rate_limit_error};
pub use store::{AdaptiveState, LearnedLimit, StateStore};
