//! Units of work handed to the scheduler and the terminal results it returns.

use gate_core::{
    CancellationToken, CostEstimate, ErrorKind, GateError, ModelKey, Priority, SourceKind,
    new_task_id,
};
use gate_limiter::classify_error;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

pub type TaskFuture<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send>>;

/// The work closure. It receives the execution token, which is cancelled on
/// preemption or when the caller's own token is cancelled.
pub type TaskWork<T> = Box<dyn FnOnce(CancellationToken) -> TaskFuture<T> + Send>;

pub struct Task<T> {
    pub id: String,
    pub source: SourceKind,
    pub key: ModelKey,
    pub priority: Priority,
    pub cost: CostEstimate,
    pub cancel: CancellationToken,
    pub(crate) work: TaskWork<T>,
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("key", &self.key)
            .field("priority", &self.priority)
            .field("cost", &self.cost)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Task<T> {
    /// New `normal` priority task with an id prefixed by the source kind.
    pub fn new<F, Fut>(source: SourceKind, key: ModelKey, work: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            id: new_task_id(source.id_prefix()),
            source,
            key,
            priority: Priority::Normal,
            cost: CostEstimate::default(),
            cancel: CancellationToken::new(),
            work: Box::new(move |token| Box::pin(work(token))),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cost(mut self, cost: CostEstimate) -> Self {
        self.cost = cost;
        self
    }

    /// Tie the task to a caller-owned token.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    CancelledBeforeStart,
    Cancelled,
    Preempted,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CancelledBeforeStart => "cancelled_before_start",
            Self::Cancelled => "cancelled",
            Self::Preempted => "preempted",
        }
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome<T> {
    Completed(T),
    Failed(String),
    Aborted(AbortReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult<T> {
    pub task_id: String,
    pub key: ModelKey,
    pub priority: Priority,
    pub outcome: TaskOutcome<T>,
    /// Time spent queued before admission.
    pub wait_ms: u64,
    /// Time spent inside the work closure.
    pub run_ms: u64,
}

impl<T> TaskResult<T> {
    pub fn success(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Completed(_))
    }

    pub fn aborted(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Aborted(_))
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self.outcome {
            TaskOutcome::Aborted(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            TaskOutcome::Failed(message) => Some(message),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match &self.outcome {
            TaskOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self.outcome {
            TaskOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    /// For callers that want `?`: failures come back typed by their
    /// classification.
    pub fn into_result(self) -> Result<T, GateError> {
        match self.outcome {
            TaskOutcome::Completed(value) => Ok(value),
            TaskOutcome::Failed(message) => {
                let key = self.key.to_string();
                Err(match classify_error(&message) {
                    ErrorKind::RateLimit => GateError::RateLimited { key, message },
                    ErrorKind::Timeout => GateError::Timeout { key, message },
                    ErrorKind::Other => GateError::Execution(message),
                })
            }
            TaskOutcome::Aborted(_) => Err(GateError::Aborted(self.task_id)),
        }
    }
}
