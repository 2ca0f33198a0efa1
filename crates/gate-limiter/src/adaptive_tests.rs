use super::*;
use gate_core::ManualClock;
use proptest::prelude::*;
use tempfile::tempdir;

fn key() -> ModelKey {
    ModelKey::new("openai", "gpt-4")
}

fn limiter_with(config: LimiterConfig) -> (AdaptiveLimiter, ManualClock) {
    let clock = ManualClock::at_millis(1_700_000_000_000);
    (AdaptiveLimiter::in_memory(config, clock.shared()), clock)
}

fn limiter() -> (AdaptiveLimiter, ManualClock) {
    limiter_with(LimiterConfig::default())
}

#[test]
fn test_first_access_seeds_from_clamped_preset() {
    let (limiter, _) = limiter();
    assert_eq!(limiter.get_effective_limit(&key(), 6), 6);
    let learned = limiter.learned_limit(&key()).unwrap();
    assert_eq!(learned.concurrency, 6);
    assert_eq!(learned.original_concurrency, 6);

    // Later presets do not overwrite what was learned.
    assert_eq!(limiter.get_effective_limit(&key(), 2), 6);

    let zero = ModelKey::new("p", "zero");
    assert_eq!(limiter.get_effective_limit(&zero, 0), 1);
    let huge = ModelKey::new("p", "huge");
    assert_eq!(limiter.get_effective_limit(&huge, 400), 16);
}

#[test]
fn test_multiplier_scales_and_clamps_effective_limit() {
    let (limiter, _) = limiter();
    limiter.get_effective_limit(&key(), 4);

    limiter.set_global_multiplier(0.5);
    assert_eq!(limiter.get_effective_limit(&key(), 4), 2);

    limiter.set_global_multiplier(2.0);
    assert_eq!(limiter.get_effective_limit(&key(), 4), 8);

    let big = ModelKey::new("p", "big");
    assert_eq!(limiter.get_effective_limit(&big, 16), 16);

    limiter.set_global_multiplier(0.1);
    assert_eq!(limiter.get_effective_limit(&key(), 4), 1);
}

#[test]
fn test_three_quick_429s_then_success() {
    let (limiter, _) = limiter();
    for _ in 0..3 {
        limiter.record_429(&key());
    }
    let learned = limiter.learned_limit(&key()).unwrap();
    assert_eq!(learned.consecutive_429_count, 3);
    assert_eq!(learned.total_429_count, 3);
    assert!(learned.concurrency < 2);
    assert!(!learned.recovery_scheduled);

    limiter.record_success(&key());
    let learned = limiter.learned_limit(&key()).unwrap();
    assert_eq!(learned.consecutive_429_count, 0);
    assert!(learned.recovery_scheduled);
    assert!(learned.last_success_at.is_some());
}

#[test]
fn test_spaced_429s_only_take_the_multiplicative_cut() {
    let (limiter, clock) = limiter();
    limiter.get_effective_limit(&key(), 16);
    limiter.record_429(&key());
    clock.advance_ms(61_000);
    limiter.record_429(&key());
    clock.advance_ms(61_000);
    limiter.record_429(&key());

    // 16 -> 11 -> 7 -> 4 with no drop to the floor.
    assert_eq!(limiter.learned_limit(&key()).unwrap().concurrency, 4);
}

#[test]
fn test_floor_is_respected() {
    let (limiter, _) = limiter_with(LimiterConfig {
        min_concurrency: 3,
        ..LimiterConfig::default()
    });
    limiter.get_effective_limit(&key(), 8);
    for _ in 0..10 {
        limiter.record_429(&key());
    }
    assert_eq!(limiter.learned_limit(&key()).unwrap().concurrency, 3);
}

#[test]
fn test_recent_429_history_is_bounded() {
    let (limiter, clock) = limiter();
    for _ in 0..50 {
        limiter.record_429(&key());
        clock.advance_ms(1_000);
    }
    let learned = limiter.learned_limit(&key()).unwrap();
    assert_eq!(learned.total_429_count, 50);
    assert_eq!(learned.recent_429_at.len(), 20);
}

#[test]
fn test_recovery_sweep_waits_for_cooldown_and_steps_by_one() {
    let (limiter, clock) = limiter();
    for _ in 0..3 {
        limiter.record_429(&key());
    }
    limiter.record_success(&key());
    assert_eq!(limiter.learned_limit(&key()).unwrap().concurrency, 1);

    assert_eq!(limiter.run_recovery_sweep(), 0, "cooldown not elapsed");

    clock.advance_ms(120_000);
    assert_eq!(limiter.run_recovery_sweep(), 1);
    assert_eq!(limiter.learned_limit(&key()).unwrap().concurrency, 2);

    limiter.run_recovery_sweep();
    limiter.run_recovery_sweep();
    let learned = limiter.learned_limit(&key()).unwrap();
    assert_eq!(learned.concurrency, 4);
    assert!(!learned.recovery_scheduled);

    assert_eq!(limiter.run_recovery_sweep(), 0);
    assert_eq!(limiter.learned_limit(&key()).unwrap().concurrency, 4);
}

#[test]
fn test_success_alone_never_raises_the_limit() {
    let (limiter, clock) = limiter();
    limiter.record_429(&key());
    clock.advance_ms(600_000);
    for _ in 0..10 {
        limiter.record_success(&key());
    }
    assert_eq!(limiter.learned_limit(&key()).unwrap().concurrency, 2);
}

#[test]
fn test_new_429_cancels_scheduled_recovery() {
    let (limiter, _) = limiter();
    limiter.record_429(&key());
    limiter.record_success(&key());
    assert!(limiter.learned_limit(&key()).unwrap().recovery_scheduled);

    limiter.record_429(&key());
    assert!(!limiter.learned_limit(&key()).unwrap().recovery_scheduled);
}

#[test]
fn test_reset_learned_limit_with_and_without_value() {
    let (limiter, _) = limiter();
    limiter.get_effective_limit(&key(), 8);
    limiter.record_429(&key());

    limiter.reset_learned_limit(&key(), Some(5));
    let learned = limiter.learned_limit(&key()).unwrap();
    assert_eq!(learned.concurrency, 5);
    assert_eq!(learned.original_concurrency, 5);
    assert_eq!(learned.total_429_count, 0);

    limiter.reset_learned_limit(&key(), None);
    assert!(limiter.learned_limit(&key()).is_none());
    assert_eq!(limiter.get_effective_limit(&key(), 8), 8);
}

#[test]
fn test_reset_all_clears_limits_and_multiplier() {
    let (limiter, _) = limiter();
    limiter.get_effective_limit(&key(), 8);
    limiter.set_global_multiplier(0.5);
    limiter.reset_all_learned_limits();

    let state = limiter.get_adaptive_state();
    assert!(state.limits.is_empty());
    assert_eq!(state.global_multiplier, 1.0);
}

#[test]
fn test_non_finite_multiplier_is_ignored() {
    let (limiter, _) = limiter();
    limiter.set_global_multiplier(1.5);
    assert_eq!(limiter.set_global_multiplier(f64::NAN), 1.5);
    assert_eq!(limiter.set_global_multiplier(f64::INFINITY), 1.5);
    assert_eq!(limiter.set_global_multiplier(f64::NEG_INFINITY), 1.5);
    assert_eq!(limiter.global_multiplier(), 1.5);
}

#[test]
fn test_rate_limit_error_helper() {
    assert!(AdaptiveLimiter::is_rate_limit_error(Some("HTTP 429")));
    assert!(!AdaptiveLimiter::is_rate_limit_error(Some("bad request")));
    assert!(!AdaptiveLimiter::is_rate_limit_error::<str>(None));
}

#[test]
fn test_predictive_throttle_after_burst() {
    let (limiter, clock) = limiter();
    limiter.get_effective_limit(&key(), 8);
    for _ in 0..3 {
        limiter.record_429(&key());
    }
    let analysis = limiter.get_predictive_analysis(&key());
    assert!(analysis.should_proactively_throttle);
    assert!((0.0..=1.0).contains(&analysis.predicted_429_probability));
    assert_eq!(limiter.get_predictive_concurrency(&key(), 8), 1);

    // Half an hour later the score has decayed and nothing is trimmed.
    clock.advance_ms(30 * 60 * 1000);
    limiter.record_success(&key());
    assert!(limiter.analyze_429_probability(&key()) < 0.5);
    assert_eq!(limiter.get_predictive_concurrency(&key(), 3), 3);
}

#[test]
fn test_predictive_unknown_key_is_quiet() {
    let (limiter, _) = limiter();
    let unknown = ModelKey::new("nobody", "nothing");
    assert_eq!(limiter.analyze_429_probability(&unknown), 0.0);
    assert_eq!(limiter.get_predictive_concurrency(&unknown, 5), 5);
    assert_eq!(limiter.get_predictive_concurrency(&unknown, 0), 1);
    assert_eq!(limiter.get_predictive_concurrency(&unknown, 99), 16);
}

#[test]
fn test_state_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state").join("adaptive-limits.json");
    let clock = ManualClock::at_millis(1_700_000_000_000);

    let first = AdaptiveLimiter::open(LimiterConfig::default(), &path, clock.shared());
    first.get_effective_limit(&key(), 8);
    first.record_429(&key());
    first.set_global_multiplier(0.5);
    let version = first.get_adaptive_state().version;

    let second = AdaptiveLimiter::open(LimiterConfig::default(), &path, clock.shared());
    let learned = second.learned_limit(&key()).unwrap();
    assert_eq!(learned.concurrency, 5);
    assert_eq!(learned.original_concurrency, 8);
    assert_eq!(second.global_multiplier(), 0.5);
    assert!(second.get_adaptive_state().version > version);
}

#[test]
fn test_quiet_changes_wait_for_flush() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("adaptive-limits.json");
    let clock = ManualClock::at_millis(1_700_000_000_000);
    let limiter = AdaptiveLimiter::open(LimiterConfig::default(), &path, clock.shared());

    limiter.get_effective_limit(&key(), 4);
    limiter.record_success(&key());
    assert!(!path.exists());

    limiter.flush().unwrap();
    assert!(path.exists());
    let reopened = AdaptiveLimiter::open(LimiterConfig::default(), &path, clock.shared());
    assert_eq!(
        reopened.learned_limit(&key()).unwrap().total_success_count,
        1
    );
}

#[test]
fn test_success_after_429_is_written_by_the_sweep() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("adaptive-limits.json");
    let clock = ManualClock::at_millis(1_700_000_000_000);
    let limiter = AdaptiveLimiter::open(LimiterConfig::default(), &path, clock.shared());

    limiter.get_effective_limit(&key(), 4);
    limiter.record_429(&key());
    limiter.record_success(&key());
    let on_disk = AdaptiveLimiter::open(LimiterConfig::default(), &path, clock.shared());
    let learned = on_disk.learned_limit(&key()).unwrap();
    assert_eq!(learned.consecutive_429_count, 1, "429 is written at once");
    assert!(!learned.recovery_scheduled);

    assert_eq!(limiter.run_recovery_sweep(), 0);
    let on_disk = AdaptiveLimiter::open(LimiterConfig::default(), &path, clock.shared());
    let learned = on_disk.learned_limit(&key()).unwrap();
    assert_eq!(learned.consecutive_429_count, 0);
    assert!(learned.recovery_scheduled);
}

#[test]
fn test_corrupt_state_falls_back_to_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("adaptive-limits.json");
    std::fs::write(&path, b"\x00garbage").unwrap();

    let clock = ManualClock::at_millis(1_700_000_000_000);
    let limiter = AdaptiveLimiter::open(LimiterConfig::default(), &path, clock.shared());
    assert!(limiter.get_adaptive_state().limits.is_empty());
    assert_eq!(limiter.get_effective_limit(&key(), 4), 4);
}

#[tokio::test]
async fn test_controller_runs_sweeps_until_shutdown() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("adaptive-limits.json");
    let clock = ManualClock::at_millis(1_700_000_000_000);
    let limiter = Arc::new(AdaptiveLimiter::open(
        LimiterConfig {
            sweep_interval_ms: 10,
            ..LimiterConfig::default()
        },
        &path,
        clock.shared(),
    ));

    for _ in 0..3 {
        limiter.record_429(&key());
    }
    limiter.record_success(&key());
    clock.advance_ms(121_000);

    limiter.init_adaptive_controller();
    limiter.init_adaptive_controller();
    assert!(limiter.is_controller_running());

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert_eq!(limiter.learned_limit(&key()).unwrap().concurrency, 4);

    limiter.shutdown_adaptive_controller().await;
    assert!(!limiter.is_controller_running());

    let reopened = AdaptiveLimiter::open(LimiterConfig::default(), &path, clock.shared());
    assert_eq!(reopened.learned_limit(&key()).unwrap().concurrency, 4);
}

#[derive(Debug, Clone)]
enum Op {
    Hit,
    Success,
    Advance(u32),
    Sweep,
    Multiplier(f64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Hit),
        Just(Op::Success),
        (0u32..200_000).prop_map(Op::Advance),
        Just(Op::Sweep),
        (-10.0f64..10.0).prop_map(Op::Multiplier),
    ]
}

proptest! {
    #[test]
    fn prop_effective_limit_within_hard_bounds(
        preset in 0u32..64,
        floor in 1u32..=4,
        ops in proptest::collection::vec(op_strategy(), 0..60),
    ) {
        let (limiter, clock) = limiter_with(LimiterConfig {
            min_concurrency: floor,
            ..LimiterConfig::default()
        });
        limiter.get_effective_limit(&key(), preset);
        let mut hits = 0u64;
        for op in ops {
            match op {
                Op::Hit => {
                    limiter.record_429(&key());
                    hits += 1;
                }
                Op::Success => limiter.record_success(&key()),
                Op::Advance(ms) => clock.advance_ms(i64::from(ms)),
                Op::Sweep => {
                    limiter.run_recovery_sweep();
                }
                Op::Multiplier(x) => {
                    limiter.set_global_multiplier(x);
                }
            }
            let effective = limiter.get_effective_limit(&key(), preset);
            prop_assert!((HARD_MIN_CONCURRENCY..=HARD_MAX_CONCURRENCY).contains(&effective));

            let learned = limiter.learned_limit(&key()).unwrap();
            prop_assert_eq!(learned.total_429_count, hits);
            if hits > 0 {
                prop_assert!(learned.concurrency >= floor.min(learned.original_concurrency));
            }
            let p = limiter.analyze_429_probability(&key());
            prop_assert!((0.0..=1.0).contains(&p));
        }
    }

    #[test]
    fn prop_multiplier_clamped(x in proptest::num::f64::ANY) {
        let (limiter, _) = limiter();
        let applied = limiter.set_global_multiplier(x);
        prop_assert!((0.1..=2.0).contains(&applied));
    }
}
