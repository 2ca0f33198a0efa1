//! Priority-preemptive task scheduler and the `GateRuntime` factory.

mod queue;
pub mod runtime;
pub mod scheduler;
pub mod task;

pub use gate_core::should_preempt;
pub use runtime::GateRuntime;
pub use scheduler::{ActiveEntry, AdmissionLimits, PreemptionEvent, Scheduler, SchedulerStats};
pub use task::{AbortReason, Task, TaskFuture, TaskOutcome, TaskResult, TaskWork};
