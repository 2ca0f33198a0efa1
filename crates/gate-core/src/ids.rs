//! Task and instance identifiers (ULID based).

use std::fmt;
use std::sync::{LazyLock, Mutex, PoisonError};
use ulid::{Generator, Ulid};

/// Monotonic id source: ids from one generator are strictly increasing, so
/// two ids generated within the same millisecond never collide.
pub struct TaskIdGenerator {
    generator: Mutex<Generator>,
}

impl fmt::Debug for TaskIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskIdGenerator").finish_non_exhaustive()
    }
}

impl Default for TaskIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskIdGenerator {
    pub fn new() -> Self {
        Self {
            generator: Mutex::new(Generator::new()),
        }
    }

    /// `{prefix}-{ulid}`, lowercase.
    pub fn next_id(&self, prefix: &str) -> String {
        let ulid = {
            let mut generator = self.generator.lock().unwrap_or_else(PoisonError::into_inner);
            // Overflow only happens after 2^80 ids in one millisecond.
            generator.generate().unwrap_or_else(|_| Ulid::new())
        };
        format!("{}-{}", prefix, ulid.to_string().to_lowercase())
    }
}

static TASK_IDS: LazyLock<TaskIdGenerator> = LazyLock::new(TaskIdGenerator::new);

/// Task id from the process-wide generator.
pub fn new_task_id(prefix: &str) -> String {
    TASK_IDS.next_id(prefix)
}

/// Instance id written into coordination file names: `{pid}-{ulid}`.
pub fn new_instance_id() -> String {
    format!(
        "{}-{}",
        std::process::id(),
        Ulid::new().to_string().to_lowercase()
    )
}
