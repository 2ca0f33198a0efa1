//! Cross-instance coordination through a shared directory.
//!
//! Every process owns `instances/<id>.json` and `queues/<id>.json` and only
//! reads everyone else's. Liveness is a heartbeat timestamp, so a crashed
//! process simply ages out. Nothing here returns an error: unreadable or
//! corrupt files are skipped and IO failures are logged at debug level.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use gate_config::{CoordinatorConfig, GateConfig};
use gate_core::{CancellationToken, GateError, ModelKey, SharedClock, new_instance_id};
use serde::de::DeserializeOwned;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::fs::{CoordinationFs, RealFs};
use crate::records::{
    ActiveModel, ClusterRuntimeUsage, ClusterShare, CoordinatorStatus, InstanceRecord, QueueState,
    QueueStateRecord, StealingStats, StolenWork, WorkStealingSummary,
};

const INSTANCES_DIR: &str = "instances";
const QUEUES_DIR: &str = "queues";

/// Explicit per-registration settings; they win over environment and file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorOverrides {
    pub total_max_llm: Option<u32>,
    pub heartbeat_interval_ms: Option<u64>,
    pub heartbeat_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Settings {
    total_max_llm: u32,
    heartbeat_interval_ms: u64,
    heartbeat_timeout_ms: u64,
    min_write_interval_ms: u64,
}

impl Settings {
    fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            total_max_llm: config.total_max_llm.max(1),
            heartbeat_interval_ms: config.heartbeat_interval_ms.max(1),
            heartbeat_timeout_ms: config.heartbeat_timeout_ms.max(1),
            min_write_interval_ms: config.min_write_interval_ms,
        }
    }

    fn apply(&mut self, overrides: &CoordinatorOverrides) {
        if let Some(total) = overrides.total_max_llm {
            self.total_max_llm = total.max(1);
        }
        if let Some(interval) = overrides.heartbeat_interval_ms {
            self.heartbeat_interval_ms = interval.max(1);
        }
        if let Some(timeout) = overrides.heartbeat_timeout_ms {
            self.heartbeat_timeout_ms = timeout.max(1);
        }
    }
}

#[derive(Debug)]
struct CoordinatorInner {
    settings: Settings,
    /// `Some` between register and unregister.
    record: Option<InstanceRecord>,
    last_write_at: Option<DateTime<Utc>>,
    /// Last snapshot handed to `broadcast_queue_state`, re-stamped on every
    /// heartbeat tick.
    queue: Option<QueueState>,
    stats: StealingStats,
}

#[derive(Debug)]
struct HeartbeatTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
pub struct Coordinator {
    instance_id: String,
    dir: PathBuf,
    fs: Arc<dyn CoordinationFs>,
    clock: SharedClock,
    inner: Mutex<CoordinatorInner>,
    heartbeat: Mutex<Option<HeartbeatTask>>,
}

fn millis(ms: u64) -> ChronoDuration {
    i64::try_from(ms)
        .ok()
        .and_then(ChronoDuration::try_milliseconds)
        .unwrap_or(ChronoDuration::MAX)
}

fn is_fresh(now: DateTime<Utc>, at: DateTime<Utc>, window_ms: u64) -> bool {
    now - at <= millis(window_ms)
}

fn log_io(path: &Path, source: io::Error, action: &str) {
    let err = GateError::CoordinationIo {
        path: path.to_path_buf(),
        source,
    };
    debug!(error = %err, action, "Coordination IO skipped");
}

impl Coordinator {
    pub fn new(
        config: &CoordinatorConfig,
        dir: impl Into<PathBuf>,
        fs: Arc<dyn CoordinationFs>,
        clock: SharedClock,
    ) -> Self {
        Self {
            instance_id: new_instance_id(),
            dir: dir.into(),
            fs,
            clock,
            inner: Mutex::new(CoordinatorInner {
                settings: Settings::from_config(config),
                record: None,
                last_write_at: None,
                queue: None,
                stats: StealingStats::default(),
            }),
            heartbeat: Mutex::new(None),
        }
    }

    /// Coordinator over the real runtime directory from `config`.
    pub fn from_config(config: &GateConfig, clock: SharedClock) -> Self {
        Self::new(
            &config.coordinator,
            config.coordination_dir(),
            Arc::new(RealFs),
            clock,
        )
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn instances_dir(&self) -> PathBuf {
        self.dir.join(INSTANCES_DIR)
    }

    fn queues_dir(&self) -> PathBuf {
        self.dir.join(QUEUES_DIR)
    }

    fn own_instance_path(&self) -> PathBuf {
        self.instances_dir().join(format!("{}.json", self.instance_id))
    }

    fn own_queue_path(&self) -> PathBuf {
        self.queues_dir().join(format!("{}.json", self.instance_id))
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settings(&self) -> Settings {
        self.lock().settings
    }

    /// Join the cluster. The first call creates the directory layout and
    /// writes the instance record; later calls only refresh the heartbeat.
    pub fn register_instance(
        &self,
        session_id: &str,
        cwd: &Path,
        overrides: Option<CoordinatorOverrides>,
    ) {
        let now = self.clock.now();
        let mut inner = self.lock();
        if inner.record.is_some() {
            drop(inner);
            self.update_heartbeat();
            return;
        }

        if let Some(overrides) = overrides {
            inner.settings.apply(&overrides);
        }
        for dir in [self.instances_dir(), self.queues_dir()] {
            if let Err(err) = self.fs.create_dir_all(&dir) {
                log_io(&dir, err, "create coordination directory");
            }
        }
        inner.record = Some(InstanceRecord {
            instance_id: self.instance_id.clone(),
            pid: std::process::id(),
            session_id: session_id.to_string(),
            started_at: now,
            last_heartbeat: now,
            cwd: cwd.display().to_string(),
            active_models: Vec::new(),
            active_request_count: 0,
            active_llm_count: 0,
            pending_task_count: 0,
        });
        self.write_record(&mut inner, now);
        info!(
            instance_id = %self.instance_id,
            session_id,
            total_max_llm = inner.settings.total_max_llm,
            "Registered coordinator instance"
        );
    }

    /// Leave the cluster: delete this instance's own files, nobody else's.
    pub fn unregister_instance(&self) {
        let mut inner = self.lock();
        if inner.record.take().is_none() {
            return;
        }
        inner.last_write_at = None;
        inner.queue = None;
        for path in [self.own_instance_path(), self.own_queue_path()] {
            match self.fs.remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => log_io(&path, err, "remove own record"),
            }
        }
        drop(inner);

        if let Some(task) = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            task.cancel.cancel();
        }
        info!(instance_id = %self.instance_id, "Unregistered coordinator instance");
    }

    fn write_record(&self, inner: &mut CoordinatorInner, now: DateTime<Utc>) -> bool {
        let Some(record) = &inner.record else {
            return false;
        };
        let path = self.own_instance_path();
        let data = match serde_json::to_vec_pretty(record) {
            Ok(data) => data,
            Err(err) => {
                debug!(error = %err, "Failed to serialize instance record");
                return false;
            }
        };
        match self.fs.write_atomic(&path, &data) {
            Ok(()) => {
                inner.last_write_at = Some(now);
                true
            }
            Err(err) => {
                log_io(&path, err, "write instance record");
                false
            }
        }
    }

    /// Write the record unless the previous write is younger than the
    /// debounce interval. Returns whether a write happened.
    fn touch(&self, inner: &mut CoordinatorInner, now: DateTime<Utc>) -> bool {
        let Some(record) = inner.record.as_mut() else {
            return false;
        };
        record.last_heartbeat = now;
        let interval = millis(inner.settings.min_write_interval_ms);
        let due = inner.last_write_at.is_none_or(|at| now - at >= interval);
        if !due {
            return false;
        }
        self.write_record(inner, now)
    }

    /// Refresh `lastHeartbeat`, debounced to one write per
    /// `min_write_interval_ms`. No-op before registration.
    pub fn update_heartbeat(&self) -> bool {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.touch(&mut inner, now)
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Option<T> {
        let content = match self.fs.read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                log_io(path, err, "read record");
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "Skipping corrupt coordination record");
                None
            }
        }
    }

    fn list(&self, dir: &Path) -> Vec<PathBuf> {
        match self.fs.list_json(dir) {
            Ok(paths) => paths,
            Err(err) => {
                log_io(dir, err, "list records");
                Vec::new()
            }
        }
    }

    /// Fresh instance records. The own record comes from memory rather than
    /// disk so a failed write never hides this instance from itself.
    fn fresh_instances(&self) -> Vec<InstanceRecord> {
        let now = self.clock.now();
        let (timeout_ms, own) = {
            let inner = self.lock();
            (inner.settings.heartbeat_timeout_ms, inner.record.clone())
        };

        let mut fresh: Vec<InstanceRecord> = self
            .list(&self.instances_dir())
            .iter()
            .filter_map(|path| self.read_json::<InstanceRecord>(path))
            .filter(|record| record.instance_id != self.instance_id)
            .filter(|record| is_fresh(now, record.last_heartbeat, timeout_ms))
            .collect();
        fresh.extend(own);
        fresh
    }

    /// Live instances, never less than 1.
    pub fn get_active_instance_count(&self) -> u32 {
        self.cluster_share().instances
    }

    /// Instance count and fair share from a single directory scan.
    pub fn cluster_share(&self) -> ClusterShare {
        let count = u32::try_from(self.fresh_instances().len()).unwrap_or(u32::MAX);
        ClusterShare::new(self.settings().total_max_llm, count)
    }

    /// This instance's fair share of `total_max_llm`.
    pub fn get_my_parallel_limit(&self) -> u32 {
        self.cluster_share().my_parallel_limit
    }

    /// `requested` capped by the fair share; `0` asks for the share itself.
    pub fn get_dynamic_parallel_limit(&self, requested: u32) -> u32 {
        self.cluster_share().dynamic_limit(requested)
    }

    pub fn set_active_model(&self, key: &ModelKey) {
        let now = self.clock.now();
        let mut inner = self.lock();
        let Some(record) = inner.record.as_mut() else {
            return;
        };
        if record.active_models.iter().any(|m| m.matches(key)) {
            return;
        }
        record.active_models.push(ActiveModel {
            provider: key.provider.clone(),
            model: key.model.clone(),
            since: now,
        });
        self.touch(&mut inner, now);
    }

    pub fn clear_active_model(&self, key: &ModelKey) {
        let now = self.clock.now();
        let mut inner = self.lock();
        let Some(record) = inner.record.as_mut() else {
            return;
        };
        let before = record.active_models.len();
        record.active_models.retain(|m| !m.matches(key));
        if record.active_models.len() != before {
            self.touch(&mut inner, now);
        }
    }

    pub fn clear_all_active_models(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        let Some(record) = inner.record.as_mut() else {
            return;
        };
        if record.active_models.is_empty() {
            return;
        }
        record.active_models.clear();
        self.touch(&mut inner, now);
    }

    pub fn active_models(&self) -> Vec<ModelKey> {
        self.lock()
            .record
            .as_ref()
            .map(|record| {
                record
                    .active_models
                    .iter()
                    .map(|m| ModelKey::new(m.provider.clone(), m.model.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn update_runtime_usage(&self, active_requests: u32, active_llm: u32) {
        let now = self.clock.now();
        let mut inner = self.lock();
        let Some(record) = inner.record.as_mut() else {
            return;
        };
        record.active_request_count = active_requests;
        record.active_llm_count = active_llm;
        self.touch(&mut inner, now);
    }

    pub fn update_pending_tasks(&self, pending: u32) {
        let now = self.clock.now();
        let mut inner = self.lock();
        let Some(record) = inner.record.as_mut() else {
            return;
        };
        record.pending_task_count = pending;
        self.touch(&mut inner, now);
    }

    /// Publish this instance's queue snapshot. Ignored before registration.
    pub fn broadcast_queue_state(&self, state: QueueState) {
        let now = self.clock.now();
        let mut inner = self.lock();
        if inner.record.is_none() {
            return;
        }
        self.write_queue(&state, now);
        inner.queue = Some(state);
    }

    fn write_queue(&self, state: &QueueState, now: DateTime<Utc>) {
        let record = QueueStateRecord {
            instance_id: self.instance_id.clone(),
            timestamp: now,
            pending_task_count: state.pending_task_count,
            active_orchestrations: state.active_orchestrations,
            stealable_entries: state.stealable_entries.clone(),
        };
        let path = self.own_queue_path();
        match serde_json::to_vec_pretty(&record) {
            Ok(data) => {
                if let Err(err) = self.fs.write_atomic(&path, &data) {
                    log_io(&path, err, "write queue state");
                }
            }
            Err(err) => debug!(error = %err, "Failed to serialize queue state"),
        }
    }

    /// Other instances' queue snapshots younger than `heartbeat_interval_ms`.
    pub fn get_remote_queue_states(&self) -> Vec<QueueStateRecord> {
        let now = self.clock.now();
        let interval_ms = self.settings().heartbeat_interval_ms;
        self.list(&self.queues_dir())
            .iter()
            .filter_map(|path| {
                let mut record = self.read_json::<QueueStateRecord>(path)?;
                if record.instance_id.is_empty() {
                    record.instance_id = path.file_stem()?.to_string_lossy().into_owned();
                }
                Some(record)
            })
            .filter(|record| record.instance_id != self.instance_id)
            .filter(|record| is_fresh(now, record.timestamp, interval_ms))
            .collect()
    }

    pub fn get_work_stealing_summary(&self) -> WorkStealingSummary {
        let remote = self.get_remote_queue_states();
        let busiest_instance = remote
            .iter()
            .filter(|record| record.pending_task_count > 0)
            .max_by(|a, b| {
                a.pending_task_count
                    .cmp(&b.pending_task_count)
                    .then_with(|| b.instance_id.cmp(&a.instance_id))
            })
            .map(|record| record.instance_id.clone());
        WorkStealingSummary {
            remote_instances: remote.len(),
            total_remote_pending: remote
                .iter()
                .map(|record| u64::from(record.pending_task_count))
                .sum(),
            busiest_instance,
            stealable_entries: remote
                .iter()
                .map(|record| record.stealable_entries.len())
                .sum(),
        }
    }

    /// Pick the best entry advertised by a fresh remote: highest priority
    /// first, then the oldest. Nothing is claimed on the remote side; the
    /// stats count attempts and how many of them found a candidate.
    pub fn attempt_work_steal(&self) -> Option<StolenWork> {
        let candidate = self
            .get_remote_queue_states()
            .into_iter()
            .flat_map(|record| {
                let from = record.instance_id;
                record
                    .stealable_entries
                    .into_iter()
                    .map(move |entry| StolenWork {
                        from_instance: from.clone(),
                        entry,
                    })
            })
            .min_by(|a, b| {
                a.entry
                    .priority
                    .bucket()
                    .cmp(&b.entry.priority.bucket())
                    .then_with(|| a.entry.enqueued_at.cmp(&b.entry.enqueued_at))
                    .then_with(|| a.entry.task_id.cmp(&b.entry.task_id))
            });

        let mut inner = self.lock();
        inner.stats.attempts += 1;
        if let Some(stolen) = &candidate {
            inner.stats.candidates_found += 1;
            debug!(
                task_id = %stolen.entry.task_id,
                from = %stolen.from_instance,
                "Work steal candidate selected"
            );
        }
        candidate
    }

    pub fn get_stealing_stats(&self) -> StealingStats {
        self.lock().stats
    }

    pub fn reset_stealing_stats(&self) {
        self.lock().stats = StealingStats::default();
    }

    pub fn get_cluster_runtime_usage(&self) -> ClusterRuntimeUsage {
        let fresh = self.fresh_instances();
        ClusterRuntimeUsage {
            instances: fresh.len(),
            active_requests: fresh
                .iter()
                .map(|r| u64::from(r.active_request_count))
                .sum(),
            active_llm: fresh.iter().map(|r| u64::from(r.active_llm_count)).sum(),
            pending_tasks: fresh.iter().map(|r| u64::from(r.pending_task_count)).sum(),
        }
    }

    pub fn is_coordinator_initialized(&self) -> bool {
        self.lock().record.is_some()
    }

    pub fn get_coordinator_status(&self) -> CoordinatorStatus {
        let (settings, session_id, stealing) = {
            let inner = self.lock();
            (
                inner.settings,
                inner.record.as_ref().map(|r| r.session_id.clone()),
                inner.stats,
            )
        };
        let share = self.cluster_share();
        CoordinatorStatus {
            initialized: session_id.is_some(),
            instance_id: self.instance_id.clone(),
            session_id,
            active_instances: share.instances,
            total_max_llm: settings.total_max_llm,
            my_parallel_limit: share.my_parallel_limit,
            heartbeat_interval_ms: settings.heartbeat_interval_ms,
            heartbeat_timeout_ms: settings.heartbeat_timeout_ms,
            heartbeat_running: self.is_heartbeat_running(),
            usage: self.get_cluster_runtime_usage(),
            stealing,
        }
    }

    /// Start the heartbeat ticker (one forced write per interval). Calling
    /// it again while it runs does nothing. Needs a Tokio runtime.
    pub fn start_heartbeat(self: &Arc<Self>) {
        let mut slot = self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
        if slot
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished() && !task.cancel.is_cancelled())
        {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let weak = Arc::downgrade(self);
        let interval_ms = self.settings().heartbeat_interval_ms;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(coordinator) = weak.upgrade() else { break };
                        coordinator.heartbeat_now();
                    }
                }
            }
        });
        debug!(interval_ms, "Coordinator heartbeat started");
        *slot = Some(HeartbeatTask { cancel, handle });
    }

    /// Forced write of the instance record, plus the last queue snapshot so
    /// a backlog that stopped changing stays visible to peers.
    fn heartbeat_now(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        let Some(record) = inner.record.as_mut() else {
            return;
        };
        record.last_heartbeat = now;
        self.write_record(&mut inner, now);
        if let Some(queue) = &inner.queue {
            self.write_queue(queue, now);
        }
    }

    pub fn is_heartbeat_running(&self) -> bool {
        self.heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished() && !task.cancel.is_cancelled())
    }

    pub async fn stop_heartbeat(&self) {
        let task = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return;
        };
        task.cancel.cancel();
        if let Err(err) = task.handle.await {
            debug!(error = %err, "Coordinator heartbeat task ended abnormally");
        }
    }
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;
