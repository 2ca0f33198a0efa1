//! 429 / rate-limit and timeout detection from provider error text.
//!
//! Classification is heuristic: providers wrap status codes in very different
//! messages, so the stringified error is matched against known phrases rather
//! than trusting a status code alone.

use gate_core::ErrorKind;
use serde::Serialize;

/// Information about a detected rate-limit event.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDetected {
    pub matched_pattern: String,
}

/// Lowercase phrases that mark a rate-limit error.
pub const RATE_LIMIT_PATTERNS: &[&str] = &[
    "429",
    "rate limit",
    "too many requests",
    "quota exceeded",
    "throttled",
];

const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out", "deadline exceeded", "etimedout"];

/// Case-insensitive match of `message` against [`RATE_LIMIT_PATTERNS`].
/// Returns the first pattern (in list order) that matches.
pub fn detect_rate_limit(message: &str) -> Option<RateLimitDetected> {
    let lowered = message.to_lowercase();
    RATE_LIMIT_PATTERNS
        .iter()
        .find(|pattern| lowered.contains(*pattern))
        .map(|pattern| RateLimitDetected {
            matched_pattern: pattern.to_string(),
        })
}

/// Whether an (optional) error looks like a rate limit. `None` is never one.
pub fn is_rate_limit_error<E>(err: Option<&E>) -> bool
where
    E: std::fmt::Display + ?Sized,
{
    err.is_some_and(|e| detect_rate_limit(&e.to_string()).is_some())
}

/// Map an error message to the learning signal fed into the limiters.
/// Rate-limit phrases win over timeout phrases.
pub fn classify_error(message: &str) -> ErrorKind {
    if detect_rate_limit(message).is_some() {
        return ErrorKind::RateLimit;
    }
    let lowered = message.to_lowercase();
    if TIMEOUT_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return ErrorKind::Timeout;
    }
    ErrorKind::Other
}
