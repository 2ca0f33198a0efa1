//! Priority-preemptive admission in front of the provider limiters.
//!
//! `submit` decides per task whether it runs now, waits in the priority
//! queue, or displaces a lower-priority execution. The work itself runs in
//! the caller's future; the scheduler only hands out slots and feeds the
//! outcome back into both limiters and the coordinator.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use gate_config::GateConfig;
use gate_coordinator::{ClusterShare, Coordinator, QueueState};
use gate_core::{
    CancellationToken, ErrorKind, ModelKey, ObserverList, Priority, SharedClock, SourceKind,
    Subscription, should_preempt,
};
use gate_limiter::{AdaptiveLimiter, ReactiveAdjuster, classify_error};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::queue::{Admission, WaitQueue, Waiting};
use crate::task::{AbortReason, Task, TaskOutcome, TaskResult};

/// A running execution as seen from outside the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveEntry {
    pub task_id: String,
    pub source: SourceKind,
    pub key: ModelKey,
    pub priority: Priority,
    pub started_at: DateTime<Utc>,
    /// Cancelled by a higher-priority task but still holding its slot.
    pub preempted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreemptionEvent {
    pub victim: ActiveEntry,
    pub incoming_task_id: String,
    pub incoming_priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub total_queued: usize,
    pub active_executions: usize,
    pub preempted_executions: u64,
    pub avg_wait_ms: f64,
    pub max_wait_ms: u64,
    pub completed: u64,
    pub failed: u64,
    pub aborted: u64,
    pub queued_by_priority: BTreeMap<String, usize>,
}

/// Limits that apply to one admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub key_limit: u32,
    pub global_limit: u32,
}

#[derive(Debug)]
struct ActiveExecution {
    entry: ActiveEntry,
    token: CancellationToken,
    /// Started order, breaks ties between equal-priority victims.
    seq: u64,
    /// Task that takes over this slot once the execution returns.
    handoff: Option<Waiting>,
}

#[derive(Debug, Default)]
struct Counters {
    completed: u64,
    failed: u64,
    aborted: u64,
    preempted: u64,
    admitted: u64,
    total_wait_ms: u64,
    max_wait_ms: u64,
}

#[derive(Debug, Default)]
struct SchedulerState {
    queue: WaitQueue,
    active: HashMap<String, ActiveExecution>,
    next_seq: u64,
    counters: Counters,
}

impl SchedulerState {
    fn active_for(&self, key: &ModelKey) -> usize {
        self.active.values().filter(|a| &a.entry.key == key).count()
    }

    fn has_capacity(&self, key: &ModelKey, limits: AdmissionLimits) -> bool {
        self.active.len() < limits.global_limit as usize
            && self.active_for(key) < limits.key_limit as usize
    }

    /// Victim for an incoming task that cannot be admitted: lowest priority
    /// first, latest started on ties. A task blocked by its own key limit
    /// can only displace an execution of that key.
    fn find_victim(
        &self,
        incoming: Priority,
        key: &ModelKey,
        limits: AdmissionLimits,
    ) -> Option<&ActiveExecution> {
        let key_full = self.active_for(key) >= limits.key_limit as usize;
        self.active
            .values()
            .filter(|a| !a.entry.preempted && a.handoff.is_none())
            .filter(|a| should_preempt(a.entry.priority, incoming))
            .filter(|a| !key_full || &a.entry.key == key)
            .max_by_key(|a| (a.entry.priority.bucket(), a.seq))
    }

    fn start(&mut self, waiting: &Waiting, now: DateTime<Utc>) -> CancellationToken {
        let token = waiting.cancel.child_token();
        let seq = self.next_seq;
        self.next_seq += 1;

        let wait_ms = u64::try_from((now - waiting.enqueued_at).num_milliseconds()).unwrap_or(0);
        self.counters.admitted += 1;
        self.counters.total_wait_ms += wait_ms;
        self.counters.max_wait_ms = self.counters.max_wait_ms.max(wait_ms);

        self.active.insert(
            waiting.task_id.clone(),
            ActiveExecution {
                entry: ActiveEntry {
                    task_id: waiting.task_id.clone(),
                    source: waiting.source,
                    key: waiting.key.clone(),
                    priority: waiting.priority,
                    started_at: now,
                    preempted: false,
                },
                token: token.clone(),
                seq,
                handoff: None,
            },
        );
        token
    }

    /// Hand a slot to a waiting submitter. A submitter that went away
    /// gives the slot straight back.
    fn admit(&mut self, waiting: Waiting, now: DateTime<Utc>) -> bool {
        let token = self.start(&waiting, now);
        if waiting.admit.send(Admission { token }).is_err() {
            self.active.remove(&waiting.task_id);
            self.counters.admitted -= 1;
            return false;
        }
        true
    }

    /// Keys of queued tasks and of tasks parked on a preempted slot.
    fn waiting_keys(&self) -> Vec<ModelKey> {
        let mut keys = self.queue.keys();
        keys.extend(
            self.active
                .values()
                .filter_map(|a| a.handoff.as_ref().map(|w| w.key.clone())),
        );
        keys.sort();
        keys.dedup();
        keys
    }

    fn remove_waiting(&mut self, task_id: &str) -> Option<Waiting> {
        if let Some(waiting) = self.queue.remove(task_id) {
            return Some(waiting);
        }
        self.active.values_mut().find_map(|a| {
            if a.handoff.as_ref().is_some_and(|w| w.task_id == task_id) {
                a.handoff.take()
            } else {
                None
            }
        })
    }
}

enum Decision {
    Run(CancellationToken),
    Wait(oneshot::Receiver<Admission>),
}

/// Outcome of one finished execution, in learning-signal terms.
enum Finish {
    Success { elapsed_ms: u64 },
    Error(ErrorKind),
    Aborted,
}

/// Keeps the scheduler consistent when the submitting future is dropped
/// mid-flight.
struct SubmitGuard<'a> {
    scheduler: &'a Scheduler,
    task_id: String,
    key: ModelKey,
    phase: Phase,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    Running,
    Done,
}

impl Drop for SubmitGuard<'_> {
    fn drop(&mut self) {
        match self.phase {
            Phase::Queued => {
                let (removed, admitted) = {
                    let mut state = self.scheduler.lock();
                    let removed = state.remove_waiting(&self.task_id).is_some();
                    (removed, !removed && state.active.contains_key(&self.task_id))
                };
                if removed {
                    self.scheduler.publish_queue();
                } else if admitted {
                    // The slot arrived but nobody will run it.
                    self.scheduler.finish(&self.task_id, &self.key, Finish::Aborted);
                }
            }
            Phase::Running => {
                debug!(task_id = %self.task_id, "Submitter dropped while running");
                self.scheduler.finish(&self.task_id, &self.key, Finish::Aborted);
            }
            Phase::Done => {}
        }
    }
}

#[derive(Debug)]
pub struct Scheduler {
    config: GateConfig,
    clock: SharedClock,
    adjuster: Arc<ReactiveAdjuster>,
    limiter: Arc<AdaptiveLimiter>,
    coordinator: Arc<Coordinator>,
    state: Mutex<SchedulerState>,
    preemption_observers: ObserverList<PreemptionEvent>,
}

impl Scheduler {
    pub fn new(
        config: GateConfig,
        clock: SharedClock,
        adjuster: Arc<ReactiveAdjuster>,
        limiter: Arc<AdaptiveLimiter>,
        coordinator: Arc<Coordinator>,
    ) -> Self {
        Self {
            config,
            clock,
            adjuster,
            limiter,
            coordinator,
            state: Mutex::new(SchedulerState::default()),
            preemption_observers: ObserverList::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current limits for `key`. Reads coordination files once, so it is
    /// always called with the state lock released.
    pub fn admission_limits(&self, key: &ModelKey) -> AdmissionLimits {
        self.limits_within(key, self.coordinator.cluster_share())
    }

    fn limits_within(&self, key: &ModelKey, share: ClusterShare) -> AdmissionLimits {
        let preset = self.config.preset_for(key);
        let adjusted = self.adjuster.apply_cross_instance_limits(key, share.instances);
        let learned = self.limiter.get_effective_limit(key, preset);
        let allowed = adjusted.min(learned).min(share.dynamic_limit(preset));
        let key_limit = self.limiter.get_predictive_concurrency(key, allowed);

        let global_limit = self
            .config
            .scheduler
            .max_total_concurrent
            .min(share.my_parallel_limit)
            .max(1);
        AdmissionLimits {
            key_limit,
            global_limit,
        }
    }

    /// Run `task` to completion, failure or abort. Never returns an error:
    /// every outcome is a [`TaskResult`].
    pub async fn submit<T: Send + 'static>(&self, task: Task<T>) -> TaskResult<T> {
        let Task {
            id,
            source,
            key,
            priority,
            cancel,
            work,
            ..
        } = task;

        if cancel.is_cancelled() {
            return TaskResult {
                task_id: id,
                key,
                priority,
                outcome: TaskOutcome::Aborted(AbortReason::CancelledBeforeStart),
                wait_ms: 0,
                run_ms: 0,
            };
        }

        let enqueued_at = self.clock.now();
        let limits = self.admission_limits(&key);
        let (tx, rx) = oneshot::channel();
        let waiting = Waiting {
            task_id: id.clone(),
            source,
            key: key.clone(),
            priority,
            enqueued_at,
            cancel: cancel.clone(),
            admit: tx,
        };

        let mut guard = SubmitGuard {
            scheduler: self,
            task_id: id.clone(),
            key: key.clone(),
            phase: Phase::Queued,
        };

        let decision = self.decide(waiting, rx, limits);
        let token = match decision {
            Decision::Run(token) => token,
            Decision::Wait(rx) => {
                self.publish_queue();
                debug!(task_id = %id, key = %key, priority = %priority, "Task queued");
                match self.wait_for_admission(&id, rx, &cancel).await {
                    Some(token) => token,
                    None => {
                        guard.phase = Phase::Done;
                        self.lock().counters.aborted += 1;
                        self.publish_queue();
                        return TaskResult {
                            task_id: id,
                            key,
                            priority,
                            outcome: TaskOutcome::Aborted(AbortReason::Cancelled),
                            wait_ms: elapsed_ms(enqueued_at, self.clock.now()),
                            run_ms: 0,
                        };
                    }
                }
            }
        };
        guard.phase = Phase::Running;

        let wait_ms = elapsed_ms(enqueued_at, self.clock.now());
        self.adjuster.request_started(&key);
        self.coordinator.set_active_model(&key);
        self.publish_usage();

        let started = Instant::now();
        let result = AssertUnwindSafe(work(token.clone())).catch_unwind().await;
        let run_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (outcome, finish) = match result {
            Ok(Ok(value)) => (
                TaskOutcome::Completed(value),
                Finish::Success { elapsed_ms: run_ms },
            ),
            Ok(Err(_)) if token.is_cancelled() => {
                let reason = if self.is_preempted(&id) {
                    AbortReason::Preempted
                } else {
                    AbortReason::Cancelled
                };
                (TaskOutcome::Aborted(reason), Finish::Aborted)
            }
            Ok(Err(err)) => {
                let message = format!("{err:#}");
                let kind = classify_error(&message);
                (TaskOutcome::Failed(message), Finish::Error(kind))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(task_id = %id, key = %key, panic = %message, "Task panicked");
                (
                    TaskOutcome::Failed(format!("task panicked: {message}")),
                    Finish::Error(ErrorKind::Other),
                )
            }
        };

        guard.phase = Phase::Done;
        self.finish(&id, &key, finish);

        TaskResult {
            task_id: id,
            key,
            priority,
            outcome,
            wait_ms,
            run_ms,
        }
    }

    /// Admit now, take over a victim's slot, or queue.
    fn decide(
        &self,
        waiting: Waiting,
        rx: oneshot::Receiver<Admission>,
        limits: AdmissionLimits,
    ) -> Decision {
        let now = self.clock.now();
        let mut state = self.lock();
        if state.has_capacity(&waiting.key, limits) {
            let token = state.start(&waiting, now);
            return Decision::Run(token);
        }

        let victim_id = state
            .find_victim(waiting.priority, &waiting.key, limits)
            .map(|victim| victim.entry.task_id.clone());
        let Some(victim_id) = victim_id else {
            state.queue.push(waiting);
            return Decision::Wait(rx);
        };

        let incoming_task_id = waiting.task_id.clone();
        let incoming_priority = waiting.priority;
        state.counters.preempted += 1;
        let Some(victim) = state.active.get_mut(&victim_id) else {
            state.queue.push(waiting);
            return Decision::Wait(rx);
        };
        victim.entry.preempted = true;
        victim.handoff = Some(waiting);
        let event = PreemptionEvent {
            victim: victim.entry.clone(),
            incoming_task_id,
            incoming_priority,
        };
        let token = victim.token.clone();
        drop(state);

        info!(
            victim = %event.victim.task_id,
            victim_priority = %event.victim.priority,
            incoming = %event.incoming_task_id,
            incoming_priority = %event.incoming_priority,
            "Preempting execution"
        );
        self.preemption_observers.notify(&event);
        token.cancel();
        Decision::Wait(rx)
    }

    /// `None` when the caller cancelled before a slot arrived.
    async fn wait_for_admission(
        &self,
        task_id: &str,
        mut rx: oneshot::Receiver<Admission>,
        cancel: &CancellationToken,
    ) -> Option<CancellationToken> {
        tokio::select! {
            admitted = &mut rx => return admitted.ok().map(|a| a.token),
            _ = cancel.cancelled() => {}
        }

        if self.lock().remove_waiting(task_id).is_some() {
            return None;
        }
        // Admitted concurrently with the cancellation; the slot is ours and
        // the execution token is already cancelled through its parent.
        rx.await.ok().map(|a| a.token)
    }

    fn is_preempted(&self, task_id: &str) -> bool {
        self.lock()
            .active
            .get(task_id)
            .is_some_and(|a| a.entry.preempted)
    }

    /// Release the slot, feed the learning signal, then refill from the queue.
    fn finish(&self, task_id: &str, key: &ModelKey, finish: Finish) {
        match &finish {
            Finish::Success { elapsed_ms } => {
                self.adjuster.record_success(key, *elapsed_ms);
                self.adjuster.attempt_recovery(key);
                self.limiter.record_success(key);
            }
            Finish::Error(kind) => {
                self.adjuster.adjust_for_error(key, *kind);
                if *kind == ErrorKind::RateLimit {
                    self.limiter.record_429(key);
                }
            }
            Finish::Aborted => {}
        }
        self.adjuster.request_completed(key);

        let now = self.clock.now();
        let key_idle = {
            let mut state = self.lock();
            match finish {
                Finish::Success { .. } => state.counters.completed += 1,
                Finish::Error(_) => state.counters.failed += 1,
                Finish::Aborted => state.counters.aborted += 1,
            }
            if let Some(execution) = state.active.remove(task_id)
                && let Some(next) = execution.handoff
            {
                debug!(task_id = %next.task_id, from = task_id, "Handing over preempted slot");
                state.admit(next, now);
            }
            state.active_for(key) == 0
        };
        if key_idle {
            self.coordinator.clear_active_model(key);
        }

        self.drain();
        self.publish_usage();
        self.publish_queue();
    }

    /// Admit waiting tasks, highest priority first and FIFO per bucket, for
    /// every key that has capacity again. Tasks parked on a preempted slot
    /// compete too: a slot that frees elsewhere first goes to them, and the
    /// victim keeps its own slot without a successor.
    fn drain(&self) {
        let keys = self.lock().waiting_keys();
        if keys.is_empty() {
            return;
        }
        let share = self.coordinator.cluster_share();
        let limits: HashMap<ModelKey, AdmissionLimits> = keys
            .into_iter()
            .map(|key| {
                let limits = self.limits_within(&key, share);
                (key, limits)
            })
            .collect();

        let now = self.clock.now();
        let mut state = self.lock();
        loop {
            let view: &SchedulerState = &state;
            let fits = |w: &Waiting| {
                limits
                    .get(&w.key)
                    .is_some_and(|l| view.has_capacity(&w.key, *l))
            };
            let parked = view
                .active
                .values()
                .filter_map(|a| a.handoff.as_ref().map(|w| (a, w)))
                .filter(|(_, w)| fits(*w))
                .min_by_key(|(a, w)| (w.priority.bucket(), w.enqueued_at, a.seq))
                .map(|(a, w)| (a.entry.task_id.clone(), w.priority.bucket()));
            let queued = view
                .queue
                .iter()
                .find(|w| fits(*w))
                .map(|w| (w.task_id.clone(), w.priority.bucket()));

            let waiting = match (parked, queued) {
                (Some((victim_id, parked_bucket)), queued)
                    if queued.as_ref().is_none_or(|(_, b)| parked_bucket <= *b) =>
                {
                    state
                        .active
                        .get_mut(&victim_id)
                        .and_then(|victim| victim.handoff.take())
                }
                (_, Some((task_id, _))) => state.queue.remove(&task_id),
                _ => None,
            };
            let Some(waiting) = waiting else { break };
            state.admit(waiting, now);
        }
    }

    fn publish_usage(&self) {
        let (active, running) = {
            let state = self.lock();
            let running = state.active.values().filter(|a| !a.entry.preempted).count();
            (state.active.len(), running)
        };
        self.coordinator
            .update_runtime_usage(saturating_u32(active), saturating_u32(running));
    }

    fn publish_queue(&self) {
        let snapshot = self.queue_snapshot();
        self.coordinator
            .update_pending_tasks(snapshot.pending_task_count);
        self.coordinator.broadcast_queue_state(snapshot);
    }

    /// Queue view advertised to other instances.
    pub fn queue_snapshot(&self) -> QueueState {
        let state = self.lock();
        QueueState {
            pending_task_count: saturating_u32(state.queue.len()),
            active_orchestrations: saturating_u32(
                state
                    .active
                    .values()
                    .filter(|a| a.entry.source == SourceKind::Orchestration)
                    .count(),
            ),
            stealable_entries: state.queue.iter().map(Waiting::stealable).collect(),
        }
    }

    /// The execution an incoming task of `priority` on `key` would displace
    /// right now, if it cannot be admitted directly.
    pub fn check_preemption_needed(&self, priority: Priority, key: &ModelKey) -> Option<ActiveEntry> {
        let limits = self.admission_limits(key);
        let state = self.lock();
        if state.has_capacity(key, limits) {
            return None;
        }
        state
            .find_victim(priority, key, limits)
            .map(|victim| victim.entry.clone())
    }

    /// Subscribe to preemptions. Callbacks run synchronously, before the
    /// victim's token is cancelled.
    pub fn on_preemption<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PreemptionEvent) + Send + Sync + 'static,
    {
        self.preemption_observers.subscribe(callback)
    }

    pub fn active_entries(&self) -> Vec<ActiveEntry> {
        let mut entries: Vec<(u64, ActiveEntry)> = self
            .lock()
            .active
            .values()
            .map(|a| (a.seq, a.entry.clone()))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, entry)| entry).collect()
    }

    pub fn get_stats(&self) -> SchedulerStats {
        let state = self.lock();
        let counters = &state.counters;
        let avg_wait_ms = if counters.admitted == 0 {
            0.0
        } else {
            counters.total_wait_ms as f64 / counters.admitted as f64
        };
        let handoffs = state.active.values().filter(|a| a.handoff.is_some()).count();
        let mut queued_by_priority: BTreeMap<String, usize> = Priority::ALL
            .iter()
            .map(|p| (p.as_str().to_string(), state.queue.len_of(*p)))
            .collect();
        for waiting in state.active.values().filter_map(|a| a.handoff.as_ref()) {
            *queued_by_priority
                .entry(waiting.priority.as_str().to_string())
                .or_default() += 1;
        }
        SchedulerStats {
            total_queued: state.queue.len() + handoffs,
            active_executions: state.active.len(),
            preempted_executions: counters.preempted,
            avg_wait_ms,
            max_wait_ms: counters.max_wait_ms,
            completed: counters.completed,
            failed: counters.failed,
            aborted: counters.aborted,
            queued_by_priority,
        }
    }
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    u64::try_from((to - from).num_milliseconds()).unwrap_or(0)
}

fn saturating_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
