//! Process-wide wiring of the four control loops.

use gate_config::GateConfig;
use gate_coordinator::{Coordinator, CoordinatorOverrides};
use gate_core::{SharedClock, system_clock};
use gate_limiter::{AdaptiveLimiter, ReactiveAdjuster};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::scheduler::Scheduler;

/// Owns the adjuster, persisted limiter, coordinator and scheduler of one
/// process. Build it once and share it.
#[derive(Debug, Clone)]
pub struct GateRuntime {
    config: GateConfig,
    adjuster: Arc<ReactiveAdjuster>,
    limiter: Arc<AdaptiveLimiter>,
    coordinator: Arc<Coordinator>,
    scheduler: Arc<Scheduler>,
}

impl GateRuntime {
    /// Real clock, on-disk limiter state and the shared runtime directory.
    pub fn from_config(config: GateConfig) -> Self {
        let clock = system_clock();
        let limiter = AdaptiveLimiter::from_config(&config, clock.clone());
        let coordinator = Coordinator::from_config(&config, clock.clone());
        Self::from_parts(config, clock, limiter, coordinator)
    }

    /// Assemble from pre-built parts (tests inject clocks and filesystems).
    pub fn from_parts(
        config: GateConfig,
        clock: SharedClock,
        limiter: AdaptiveLimiter,
        coordinator: Coordinator,
    ) -> Self {
        let adjuster = Arc::new(ReactiveAdjuster::new(config.adjuster.clone(), clock.clone()));
        let limiter = Arc::new(limiter);
        let coordinator = Arc::new(coordinator);
        let scheduler = Arc::new(Scheduler::new(
            config.clone(),
            clock,
            adjuster.clone(),
            limiter.clone(),
            coordinator.clone(),
        ));
        Self {
            config,
            adjuster,
            limiter,
            coordinator,
            scheduler,
        }
    }

    /// Register this process and start the heartbeat and recovery tickers.
    /// Must be called inside a Tokio runtime.
    pub fn start(&self, session_id: &str, cwd: &Path) {
        self.start_with(session_id, cwd, None);
    }

    pub fn start_with(&self, session_id: &str, cwd: &Path, overrides: Option<CoordinatorOverrides>) {
        self.coordinator.register_instance(session_id, cwd, overrides);
        self.coordinator.start_heartbeat();
        self.limiter.init_adaptive_controller();
        info!(
            instance_id = %self.coordinator.instance_id(),
            session_id,
            "llm-gate runtime started"
        );
    }

    /// Stop both tickers, flush learned limits and leave the cluster.
    pub async fn shutdown(&self) {
        self.coordinator.stop_heartbeat().await;
        self.limiter.shutdown_adaptive_controller().await;
        self.coordinator.clear_all_active_models();
        self.coordinator.unregister_instance();
        info!(instance_id = %self.coordinator.instance_id(), "llm-gate runtime stopped");
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn adjuster(&self) -> &Arc<ReactiveAdjuster> {
        &self.adjuster
    }

    pub fn limiter(&self) -> &Arc<AdaptiveLimiter> {
        &self.limiter
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }
}
