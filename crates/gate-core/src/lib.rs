//! Shared vocabulary for llm-gate: priorities, model keys, errors, clocks and observers.

pub mod clock;
pub mod error;
pub mod ids;
pub mod observer;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use error::{ErrorKind, GateError};
pub use ids::{TaskIdGenerator, new_instance_id, new_task_id};
pub use observer::{ObserverList, Subscription};
pub use tokio_util::sync::CancellationToken;
pub use types::{CostEstimate, ModelKey, OutputFormat, Priority, SourceKind, should_preempt};
