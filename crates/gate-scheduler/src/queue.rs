//! Strict-priority wait queue: one FIFO bucket per priority, no aging.

use chrono::{DateTime, Utc};
use gate_core::{CancellationToken, ModelKey, Priority, SourceKind};
use gate_coordinator::StealableEntry;
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// Sent to a waiting submitter once it owns a slot.
#[derive(Debug)]
pub(crate) struct Admission {
    pub token: CancellationToken,
}

#[derive(Debug)]
pub(crate) struct Waiting {
    pub task_id: String,
    pub source: SourceKind,
    pub key: ModelKey,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    /// The submitter's token; the execution token is derived from it.
    pub cancel: CancellationToken,
    pub admit: oneshot::Sender<Admission>,
}

impl Waiting {
    pub fn stealable(&self) -> StealableEntry {
        StealableEntry {
            task_id: self.task_id.clone(),
            provider: self.key.provider.clone(),
            model: self.key.model.clone(),
            priority: self.priority,
            enqueued_at: self.enqueued_at,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    buckets: [VecDeque<Waiting>; 5],
}

impl WaitQueue {
    pub fn push(&mut self, waiting: Waiting) {
        self.buckets[waiting.priority.bucket()].push_back(waiting);
    }

    pub fn remove(&mut self, task_id: &str) -> Option<Waiting> {
        self.buckets.iter_mut().find_map(|bucket| {
            let index = bucket.iter().position(|w| w.task_id == task_id)?;
            bucket.remove(index)
        })
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    pub fn len_of(&self, priority: Priority) -> usize {
        self.buckets[priority.bucket()].len()
    }

    /// Highest priority first, FIFO within a bucket.
    pub fn iter(&self) -> impl Iterator<Item = &Waiting> {
        self.buckets.iter().flat_map(|bucket| bucket.iter())
    }

    pub fn keys(&self) -> Vec<ModelKey> {
        let mut keys: Vec<ModelKey> = self.iter().map(|w| w.key.clone()).collect();
        keys.sort();
        keys.dedup();
        keys
    }
}
