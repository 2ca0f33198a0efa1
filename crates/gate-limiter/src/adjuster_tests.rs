use super::*;
use gate_core::ManualClock;
use proptest::prelude::*;
use std::sync::Arc;

fn key() -> ModelKey {
    ModelKey::new("openai", "gpt-4")
}

fn adjuster_with(config: AdjusterConfig) -> (ReactiveAdjuster, ManualClock) {
    let clock = ManualClock::at_millis(1_700_000_000_000);
    (ReactiveAdjuster::new(config, clock.shared()), clock)
}

fn adjuster() -> (ReactiveAdjuster, ManualClock) {
    adjuster_with(AdjusterConfig::default())
}

#[test]
fn test_fresh_key_starts_at_base() {
    let (adj, _) = adjuster();
    assert_eq!(adj.get_parallelism(&key()), 4);
}

#[test]
fn test_429_cuts_compound_and_stop_at_min() {
    let (adj, _) = adjuster();
    assert_eq!(adj.adjust_for_error(&key(), ErrorKind::RateLimit), 2);
    assert_eq!(adj.adjust_for_error(&key(), ErrorKind::RateLimit), 1);
    assert_eq!(adj.adjust_for_error(&key(), ErrorKind::RateLimit), 1);
    assert_eq!(adj.get_parallelism(&key()), 1);
}

#[test]
fn test_factor_per_error_kind() {
    let config = AdjusterConfig {
        base: 16,
        ..AdjusterConfig::default()
    };

    let (adj, _) = adjuster_with(config.clone());
    assert_eq!(adj.adjust_for_error(&key(), ErrorKind::RateLimit), 11);
    assert_eq!(adj.adjust_for_error(&key(), ErrorKind::RateLimit), 7);

    let (adj, _) = adjuster_with(config.clone());
    assert_eq!(adj.adjust_for_error(&key(), ErrorKind::Timeout), 14);

    let (adj, _) = adjuster_with(config);
    assert_eq!(adj.adjust_for_error(&key(), ErrorKind::Other), 15);
}

#[test]
fn test_reason_mentions_error_kind() {
    let (adj, _) = adjuster();
    adj.adjust_for_error(&key(), ErrorKind::Timeout);
    let snap = adj.snapshot();
    assert_eq!(snap.len(), 1);
    assert!(snap[0].reason.contains("timeout"), "reason: {}", snap[0].reason);

    adj.adjust_for_error(&key(), ErrorKind::RateLimit);
    assert!(adj.snapshot()[0].reason.contains("429"));
}

#[test]
fn test_subscribers_notified_and_unsubscribe() {
    let (adj, _) = adjuster();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let sub = adj.on_parallelism_change(move |change| {
        sink.lock().unwrap().push((change.previous, change.current));
    });

    adj.adjust_for_error(&key(), ErrorKind::RateLimit);
    sub.unsubscribe();
    adj.adjust_for_error(&key(), ErrorKind::RateLimit);

    assert_eq!(*seen.lock().unwrap(), vec![(4, 2)]);
}

#[test]
fn test_cross_instance_split() {
    let (adj, _) = adjuster();
    assert_eq!(adj.apply_cross_instance_limits(&key(), 2), 2);
    assert_eq!(adj.get_parallelism(&key()), 2);

    let other = ModelKey::new("anthropic", "claude");
    assert_eq!(adj.apply_cross_instance_limits(&other, 3), 1);

    let third = ModelKey::new("google", "gemini");
    assert_eq!(adj.apply_cross_instance_limits(&third, 8), 1);
}

#[test]
fn test_cross_instance_single_instance_is_noop() {
    let (adj, _) = adjuster();
    adj.adjust_for_error(&key(), ErrorKind::RateLimit);
    assert_eq!(adj.apply_cross_instance_limits(&key(), 1), 2);
    assert_eq!(adj.apply_cross_instance_limits(&key(), 0), 2);
}

#[test]
fn test_cross_instance_same_count_applied_once() {
    let (adj, _) = adjuster();
    adj.apply_cross_instance_limits(&key(), 2);
    adj.adjust_for_error(&key(), ErrorKind::RateLimit);
    // Repeating the same count must not undo the error-driven cut.
    assert_eq!(adj.apply_cross_instance_limits(&key(), 2), 1);
}

#[test]
fn test_recovery_requires_cooldown_and_quiet_window() {
    let (adj, clock) = adjuster();
    adj.adjust_for_error(&key(), ErrorKind::RateLimit);
    adj.adjust_for_error(&key(), ErrorKind::RateLimit);
    assert_eq!(adj.get_parallelism(&key()), 1);

    // Cooldown (30s) elapsed but the error window (60s) has not.
    clock.advance_ms(31_000);
    assert!(!adj.attempt_recovery(&key()));

    clock.advance_ms(30_000);
    assert!(adj.attempt_recovery(&key()));
    assert_eq!(adj.get_parallelism(&key()), 2);

    // Recovery itself counts as an adjustment: cooldown applies again.
    assert!(!adj.attempt_recovery(&key()));

    clock.advance_ms(30_000);
    assert!(adj.attempt_recovery(&key()));
    assert_eq!(adj.get_parallelism(&key()), 3);

    clock.advance_ms(30_000);
    assert!(adj.attempt_recovery(&key()));
    assert_eq!(adj.get_parallelism(&key()), 4);

    clock.advance_ms(30_000);
    assert!(!adj.attempt_recovery(&key()), "never exceeds base");
    assert_eq!(adj.get_parallelism(&key()), 4);
}

#[test]
fn test_recovery_noop_at_base() {
    let (adj, _) = adjuster();
    assert!(!adj.attempt_recovery(&key()));
}

#[test]
fn test_in_flight_counter_never_negative() {
    let (adj, _) = adjuster();
    adj.request_completed(&key());
    assert_eq!(adj.get_health(&key()).active_requests, 0);

    adj.request_started(&key());
    adj.request_started(&key());
    adj.request_completed(&key());
    assert_eq!(adj.get_health(&key()).active_requests, 1);
}

#[test]
fn test_response_ring_evicts_oldest() {
    let config = AdjusterConfig {
        sample_capacity: 3,
        ..AdjusterConfig::default()
    };
    let (adj, _) = adjuster_with(config);
    for ms in [10, 20, 30, 40] {
        adj.record_success(&key(), ms);
    }
    assert_eq!(adj.get_health(&key()).avg_response_ms, 30.0);
}

#[test]
fn test_health_backoff_grows_and_expires() {
    let (adj, clock) = adjuster();
    let health = adj.get_health(&key());
    assert!(health.healthy);
    assert_eq!(health.recommended_backoff_ms, 0);

    adj.adjust_for_error(&key(), ErrorKind::RateLimit);
    assert_eq!(adj.get_health(&key()).recommended_backoff_ms, 1_000);

    adj.adjust_for_error(&key(), ErrorKind::RateLimit);
    adj.adjust_for_error(&key(), ErrorKind::RateLimit);
    let health = adj.get_health(&key());
    assert!(!health.healthy);
    assert_eq!(health.recent_429_count, 3);
    assert_eq!(health.recommended_backoff_ms, 4_000);

    clock.advance_ms(61_000);
    let health = adj.get_health(&key());
    assert!(health.healthy);
    assert_eq!(health.recent_429_count, 0);
}

#[test]
fn test_timeouts_do_not_count_as_429s() {
    let (adj, _) = adjuster();
    adj.adjust_for_error(&key(), ErrorKind::Timeout);
    assert_eq!(adj.get_health(&key()).recent_429_count, 0);
}

#[test]
fn test_backoff_is_capped() {
    assert_eq!(recommended_backoff_ms(0), 0);
    assert_eq!(recommended_backoff_ms(2), 2_000);
    assert_eq!(recommended_backoff_ms(100), 60_000);
}

#[test]
fn test_reset_restores_base_and_keeps_in_flight() {
    let (adj, _) = adjuster();
    adj.request_started(&key());
    adj.adjust_for_error(&key(), ErrorKind::RateLimit);
    adj.reset(&key());

    let health = adj.get_health(&key());
    assert_eq!(health.current, 4);
    assert_eq!(health.recent_429_count, 0);
    assert_eq!(health.active_requests, 1);
}

#[test]
fn test_reset_all_touches_every_key() {
    let (adj, _) = adjuster();
    let other = ModelKey::new("anthropic", "claude");
    adj.adjust_for_error(&key(), ErrorKind::RateLimit);
    adj.adjust_for_error(&other, ErrorKind::Timeout);

    adj.reset_all();
    assert_eq!(adj.get_parallelism(&key()), 4);
    assert_eq!(adj.get_parallelism(&other), 4);
}

#[derive(Debug, Clone)]
enum Op {
    Error(u8),
    Recover,
    Cross(u32),
    Advance(u32),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..3).prop_map(Op::Error),
        Just(Op::Recover),
        (0u32..10).prop_map(Op::Cross),
        (0u32..120_000).prop_map(Op::Advance),
    ]
}

proptest! {
    #[test]
    fn prop_parallelism_stays_within_bounds(
        base in 1u32..=16,
        min in 1u32..=4,
        ops in proptest::collection::vec(op_strategy(), 0..60),
    ) {
        let config = AdjusterConfig {
            base: base.max(min),
            min,
            max: 16,
            ..AdjusterConfig::default()
        };
        let (adj, clock) = adjuster_with(config);
        for op in ops {
            match op {
                Op::Error(kind) => {
                    let kind = match kind {
                        0 => ErrorKind::RateLimit,
                        1 => ErrorKind::Timeout,
                        _ => ErrorKind::Other,
                    };
                    adj.adjust_for_error(&key(), kind);
                }
                Op::Recover => {
                    adj.attempt_recovery(&key());
                }
                Op::Cross(n) => {
                    adj.apply_cross_instance_limits(&key(), n);
                }
                Op::Advance(ms) => clock.advance_ms(i64::from(ms)),
            }
            let value = adj.get_parallelism(&key());
            prop_assert!((min..=16).contains(&value), "value {} outside [{}, 16]", value, min);
        }
    }
}
