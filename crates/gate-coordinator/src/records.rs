//! JSON documents exchanged through the coordination directory, plus the
//! read-only views the coordinator derives from them.

use chrono::{DateTime, Utc};
use gate_core::{ModelKey, Priority};
use serde::{Deserialize, Serialize};

/// `instances/<instanceId>.json`, written only by its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub instance_id: String,
    pub pid: u32,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub cwd: String,
    #[serde(default)]
    pub active_models: Vec<ActiveModel>,
    #[serde(default)]
    pub active_request_count: u32,
    #[serde(default)]
    pub active_llm_count: u32,
    #[serde(default)]
    pub pending_task_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveModel {
    pub provider: String,
    pub model: String,
    pub since: DateTime<Utc>,
}

impl ActiveModel {
    pub fn matches(&self, key: &ModelKey) -> bool {
        self.provider == key.provider && self.model == key.model
    }
}

/// Queued work another instance could take over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StealableEntry {
    pub task_id: String,
    pub provider: String,
    pub model: String,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
}

/// Snapshot of one instance's local queue; `instanceId` and `timestamp` are
/// filled in by the broadcasting coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStateRecord {
    #[serde(default)]
    pub instance_id: String,
    pub timestamp: DateTime<Utc>,
    pub pending_task_count: u32,
    #[serde(default)]
    pub active_orchestrations: u32,
    #[serde(default)]
    pub stealable_entries: Vec<StealableEntry>,
}

/// Caller-provided part of a queue broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueState {
    pub pending_task_count: u32,
    pub active_orchestrations: u32,
    pub stealable_entries: Vec<StealableEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkStealingSummary {
    pub remote_instances: usize,
    pub total_remote_pending: u64,
    pub busiest_instance: Option<String>,
    pub stealable_entries: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StealingStats {
    pub attempts: u64,
    /// Attempts that returned an entry. The entry still belongs to its owner.
    pub candidates_found: u64,
}

/// Entry picked by a steal attempt, with the instance that advertised it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StolenWork {
    pub from_instance: String,
    pub entry: StealableEntry,
}

/// One reading of the instances directory: how many peers are live and
/// what that leaves for this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterShare {
    pub instances: u32,
    pub total_max_llm: u32,
    pub my_parallel_limit: u32,
}

impl ClusterShare {
    pub fn new(total_max_llm: u32, instances: u32) -> Self {
        let total_max_llm = total_max_llm.max(1);
        let instances = instances.max(1);
        Self {
            instances,
            total_max_llm,
            my_parallel_limit: (total_max_llm / instances).clamp(1, total_max_llm),
        }
    }

    /// `requested` capped by the share; `0` asks for the share itself.
    pub fn dynamic_limit(&self, requested: u32) -> u32 {
        let wanted = if requested == 0 {
            self.my_parallel_limit
        } else {
            requested.min(self.my_parallel_limit)
        };
        wanted.clamp(1, self.total_max_llm)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClusterRuntimeUsage {
    pub instances: usize,
    pub active_requests: u64,
    pub active_llm: u64,
    pub pending_tasks: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorStatus {
    pub initialized: bool,
    pub instance_id: String,
    pub session_id: Option<String>,
    pub active_instances: u32,
    pub total_max_llm: u32,
    pub my_parallel_limit: u32,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub heartbeat_running: bool,
    pub usage: ClusterRuntimeUsage,
    pub stealing: StealingStats,
}
