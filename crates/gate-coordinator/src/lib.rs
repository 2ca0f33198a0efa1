//! Lock-free, file-based coordination between llm-gate instances: heartbeats,
//! fair-share parallel limits, queue broadcasts and work stealing.

pub mod coordinator;
pub mod fs;
pub mod records;

pub use coordinator::{Coordinator, CoordinatorOverrides};
pub use fs::{CoordinationFs, MemoryFs, RealFs};
pub use records::{
    ActiveModel, ClusterRuntimeUsage, ClusterShare, CoordinatorStatus, InstanceRecord, QueueState,
    QueueStateRecord, StealableEntry, StealingStats, StolenWork, WorkStealingSummary,
};
