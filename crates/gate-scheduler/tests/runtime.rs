//! Whole-runtime tests over a real temporary directory.

use anyhow::anyhow;
use gate_config::GateConfig;
use gate_coordinator::{Coordinator, RealFs};
use gate_core::{ModelKey, Priority, SourceKind, system_clock};
use gate_limiter::AdaptiveLimiter;
use gate_scheduler::{AbortReason, GateRuntime, Task};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn config_in(dir: &TempDir) -> GateConfig {
    let mut config = GateConfig::default();
    config.limiter.state_path = Some(dir.path().join("state").join("adaptive-limits.json"));
    config.coordinator.runtime_dir = Some(dir.path().join("coordinator"));
    config
}

fn instance_file(runtime: &GateRuntime) -> std::path::PathBuf {
    runtime
        .coordinator()
        .dir()
        .join("instances")
        .join(format!("{}.json", runtime.coordinator().instance_id()))
}

#[tokio::test]
async fn normal_task_with_free_capacity_runs_immediately() {
    let dir = TempDir::new().unwrap();
    let runtime = GateRuntime::from_config(config_in(&dir));
    runtime.start("session-1", dir.path());

    let result = runtime
        .scheduler()
        .submit(Task::new(
            SourceKind::Direct,
            ModelKey::new("openai", "gpt-4"),
            |_| async { Ok("done") },
        ))
        .await;

    assert!(result.success());
    assert_eq!(result.into_value(), Some("done"));
    runtime.shutdown().await;
}

#[tokio::test]
async fn running_high_task_is_preempted_by_critical() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir);
    config.scheduler.max_total_concurrent = 1;
    let runtime = GateRuntime::from_config(config);
    runtime.start("session-1", dir.path());
    let scheduler = runtime.scheduler().clone();

    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink = fired.clone();
    let subscription = scheduler.on_preemption(move |event| {
        sink.lock()
            .unwrap()
            .push((event.victim.task_id.clone(), event.incoming_task_id.clone()));
    });

    let (started_tx, started_rx) = tokio::sync::oneshot::channel();
    let high = Task::new(
        SourceKind::AgentTeam,
        ModelKey::new("openai", "gpt-4"),
        move |token| async move {
            let _ = started_tx.send(());
            token.cancelled().await;
            Err::<(), _>(anyhow!("cancelled by scheduler"))
        },
    )
    .with_id("high-1")
    .with_priority(Priority::High);
    let high = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.submit(high).await }
    });
    started_rx.await.unwrap();

    let critical = scheduler
        .submit(
            Task::new(
                SourceKind::Direct,
                ModelKey::new("anthropic", "claude"),
                |_| async { Ok(7) },
            )
            .with_id("critical-1")
            .with_priority(Priority::Critical),
        )
        .await;

    assert_eq!(critical.value(), Some(&7));
    assert_eq!(
        high.await.unwrap().abort_reason(),
        Some(AbortReason::Preempted)
    );
    assert_eq!(
        *fired.lock().unwrap(),
        vec![("high-1".to_string(), "critical-1".to_string())]
    );
    subscription.unsubscribe();
    runtime.shutdown().await;
}

#[tokio::test]
async fn start_and_shutdown_manage_files_and_tickers() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let state_path = config.state_path();
    let runtime = GateRuntime::from_config(config.clone());

    runtime.start("session-1", dir.path());
    assert!(instance_file(&runtime).exists());
    assert!(runtime.coordinator().is_heartbeat_running());
    assert!(runtime.limiter().is_controller_running());
    assert_eq!(runtime.coordinator().get_active_instance_count(), 1);

    let key = ModelKey::new("openai", "gpt-4");
    let result = runtime
        .scheduler()
        .submit(Task::new(SourceKind::Direct, key.clone(), |_| async {
            Err::<(), _>(anyhow!("429 Too Many Requests"))
        }))
        .await;
    assert!(!result.success());

    runtime.shutdown().await;
    assert!(!instance_file(&runtime).exists());
    assert!(!runtime.coordinator().is_heartbeat_running());
    assert!(!runtime.limiter().is_controller_running());
    assert!(state_path.exists());

    // A fresh process sees the learned limit.
    let reopened = AdaptiveLimiter::from_config(&config, system_clock());
    assert_eq!(reopened.learned_limit(&key).unwrap().concurrency, 2);
}

#[tokio::test]
async fn two_runtimes_share_the_cluster_budget() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir);
    config.coordinator.total_max_llm = 12;

    let first = GateRuntime::from_config(config.clone());
    let second = GateRuntime::from_parts(
        config.clone(),
        system_clock(),
        AdaptiveLimiter::in_memory(config.limiter.clone(), system_clock()),
        Coordinator::new(
            &config.coordinator,
            config.coordination_dir(),
            Arc::new(RealFs),
            system_clock(),
        ),
    );
    first.start("a", Path::new("/work/a"));
    second.start("b", Path::new("/work/b"));

    assert_eq!(first.coordinator().get_my_parallel_limit(), 6);
    assert_eq!(second.coordinator().get_my_parallel_limit(), 6);

    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let result = second
        .scheduler()
        .submit(Task::new(
            SourceKind::Loop,
            ModelKey::new("openai", "gpt-4"),
            move |_| async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            },
        ))
        .await;
    assert!(result.success());
    assert!(ran.load(Ordering::SeqCst));

    second.shutdown().await;
    assert_eq!(first.coordinator().get_my_parallel_limit(), 12);
    first.shutdown().await;
}
