//! Async task bridge between the simulation thread and the record store.
//!
//! The bridge owns a dedicated multi-thread tokio runtime. Work is split
//! into `lanes`: each lane is one spawned task reading its own queue, and
//! every task for a given player hashes to the same lane, so per-player
//! operations execute strictly in enqueue order while different players
//! proceed in parallel.
//!
//! ```text
//! simulation thread                 worker runtime
//!   enqueue_*() ──► lane[hash(id) % N] ──► RecordBackend ──► retry/backoff
//!        ▲                                                        │
//!        └──── poll_completions() ◄──── completion queue ◄───────┘
//! ```
//!
//! Nothing here blocks the caller except [`TaskBridge::block_on`],
//! [`TaskBridge::drain`], [`TaskBridge::shutdown`] and
//! [`TaskHandle::wait`], which are meant for lifecycle code.
//!
//! # Task states
//!
//! `Queued → Running → {Completed, Failed}` or `Queued → Cancelled`.
//! A task can only be cancelled before its lane picks it up. Completed,
//! failed and cancelled tasks are all reported on the completion queue.

use core::future::Future;
use core::hash::{Hash, Hasher};
use std::collections::hash_map::DefaultHasher;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use playervault_db::{Ack, DbError, RecordBackend};
use playervault_types::{PlayerId, PlayerRecord};
use serde::Serialize;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::BridgeError;

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum TaskState {
    /// Waiting in its lane.
    Queued = 0,
    /// Executing against the store.
    Running = 1,
    /// Finished successfully.
    Completed = 2,
    /// Finished with an error after any retries.
    Failed = 3,
    /// Cancelled before it started.
    Cancelled = 4,
}

impl TaskState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Queued,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Failed,
            _ => Self::Cancelled,
        }
    }

    /// Whether the task will not change state again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// The kind of work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskKind {
    /// Read a record.
    Load,
    /// Write a record.
    Save,
    /// Delete a record.
    Purge,
}

/// A unit of work for the store.
#[derive(Debug, Clone)]
pub enum TaskRequest {
    /// Load the player's record.
    Load(PlayerId),
    /// Save this snapshot of a record.
    Save(Arc<PlayerRecord>),
    /// Delete the player's record.
    Purge(PlayerId),
}

impl TaskRequest {
    /// The player the task targets.
    pub fn player(&self) -> PlayerId {
        match self {
            Self::Load(id) | Self::Purge(id) => *id,
            Self::Save(record) => record.id(),
        }
    }

    /// The kind of work.
    pub const fn kind(&self) -> TaskKind {
        match self {
            Self::Load(_) => TaskKind::Load,
            Self::Save(_) => TaskKind::Save,
            Self::Purge(_) => TaskKind::Purge,
        }
    }
}

/// Successful result of a task.
#[derive(Debug)]
pub enum TaskOutput {
    /// The stored record, or `None` if the player has none.
    Loaded(Option<PlayerRecord>),
    /// The save was accepted at this version.
    Saved(Ack),
    /// Whether a row was deleted.
    Purged(bool),
}

/// Final result of a task.
#[derive(Debug)]
pub enum TaskOutcome {
    /// The operation succeeded.
    Completed(TaskOutput),
    /// The operation failed; transient errors were retried first.
    Failed(DbError),
    /// The task was cancelled before it ran.
    Cancelled,
}

impl TaskOutcome {
    /// The terminal state this outcome corresponds to.
    pub const fn state(&self) -> TaskState {
        match self {
            Self::Completed(_) => TaskState::Completed,
            Self::Failed(_) => TaskState::Failed,
            Self::Cancelled => TaskState::Cancelled,
        }
    }

    /// The error, if the task failed.
    pub const fn error(&self) -> Option<&DbError> {
        match self {
            Self::Failed(e) => Some(e),
            Self::Completed(_) | Self::Cancelled => None,
        }
    }
}

#[derive(Debug)]
struct TaskShared {
    id: u64,
    player: PlayerId,
    kind: TaskKind,
    state: AtomicU8,
    outcome: Mutex<Option<Arc<TaskOutcome>>>,
    finished: Condvar,
}

/// Shared view of a task, observable from the simulation thread.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
}

impl TaskHandle {
    fn new(id: u64, player: PlayerId, kind: TaskKind) -> Self {
        Self {
            shared: Arc::new(TaskShared {
                id,
                player,
                kind,
                state: AtomicU8::new(TaskState::Queued as u8),
                outcome: Mutex::new(None),
                finished: Condvar::new(),
            }),
        }
    }

    /// Bridge-unique task id, increasing in enqueue order.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The targeted player.
    pub fn player(&self) -> PlayerId {
        self.shared.player
    }

    /// The kind of work.
    pub fn kind(&self) -> TaskKind {
        self.shared.kind
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Cancel the task if it has not started. Returns whether it was
    /// cancelled; a running task always runs to completion.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .shared
            .state
            .compare_exchange(
                TaskState::Queued as u8,
                TaskState::Cancelled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if cancelled {
            self.publish(Arc::new(TaskOutcome::Cancelled));
            debug!(task = self.id(), player = %self.player(), "Task cancelled");
        }
        cancelled
    }

    /// The outcome, if the task has finished.
    pub fn try_outcome(&self) -> Option<Arc<TaskOutcome>> {
        self.lock_outcome().clone()
    }

    /// Block up to `timeout` for the outcome. `None` means the caller
    /// gave up; the result is still delivered on the completion queue.
    pub fn wait(&self, timeout: Duration) -> Option<Arc<TaskOutcome>> {
        let guard = self.lock_outcome();
        let (guard, _timed_out) = self
            .shared
            .finished
            .wait_timeout_while(guard, timeout, |outcome| outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        guard.clone()
    }

    /// Move `Queued → Running`. Fails if the task was cancelled.
    fn begin(&self) -> bool {
        self.shared
            .state
            .compare_exchange(
                TaskState::Queued as u8,
                TaskState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Record the outcome and wake any waiters.
    fn publish(&self, outcome: Arc<TaskOutcome>) {
        let state = outcome.state();
        let mut slot = self.lock_outcome();
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.shared.state.store(state as u8, Ordering::Release);
        drop(slot);
        self.shared.finished.notify_all();
    }

    fn lock_outcome(&self) -> MutexGuard<'_, Option<Arc<TaskOutcome>>> {
        self.shared
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A task owned by the bridge from enqueue until its outcome is delivered.
#[derive(Debug)]
pub struct PendingTask {
    handle: TaskHandle,
    request: TaskRequest,
}

/// A finished task, as delivered at the poll point.
#[derive(Debug, Clone)]
pub struct Completion {
    /// The task's handle.
    pub handle: TaskHandle,
    /// What was requested.
    pub request: TaskRequest,
    /// What happened.
    pub outcome: Arc<TaskOutcome>,
    /// Store calls made, including retries. Zero for cancelled tasks.
    pub attempts: u32,
}

impl BridgeConfig {
    /// Delay before retry number `attempt` (zero-based): the base backoff
    /// doubled per attempt, capped at `max_backoff`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.retry_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// The lane a player's tasks run on.
pub fn lane_for(player: PlayerId, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    player.hash(&mut hasher);
    let lanes = u64::try_from(lanes.max(1)).unwrap_or(u64::MAX);
    usize::try_from(hasher.finish().checked_rem(lanes).unwrap_or(0)).unwrap_or(0)
}

/// Build the worker runtime.
///
/// # Errors
///
/// Returns [`BridgeError::Runtime`] if the OS refuses to spawn threads.
pub fn build_runtime(workers: usize) -> Result<Runtime, BridgeError> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers.max(1))
        .thread_name("playervault-worker")
        .enable_all()
        .build()?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Draining,
}

/// Schedules store operations off the simulation thread.
#[derive(Debug)]
pub struct TaskBridge {
    runtime: Runtime,
    backend: RecordBackend,
    lanes: Vec<mpsc::UnboundedSender<PendingTask>>,
    workers: Vec<JoinHandle<()>>,
    completions: mpsc::UnboundedReceiver<Completion>,
    in_flight: Arc<AtomicUsize>,
    next_id: AtomicU64,
    phase: Phase,
}

impl TaskBridge {
    /// Spawn one worker per lane on `runtime` and start accepting tasks.
    pub fn start(runtime: Runtime, backend: RecordBackend, config: &BridgeConfig) -> Self {
        let lane_count = config.lanes.max(1);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut lanes = Vec::with_capacity(lane_count);
        let mut workers = Vec::with_capacity(lane_count);
        for lane in 0..lane_count {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = LaneWorker {
                lane,
                backend: backend.clone(),
                config: config.clone(),
                completions: completion_tx.clone(),
                in_flight: Arc::clone(&in_flight),
            };
            workers.push(runtime.spawn(worker.run(rx)));
            lanes.push(tx);
        }

        info!(
            backend = backend.name(),
            lanes = lane_count,
            workers = config.workers,
            max_retries = config.max_retries,
            "Task bridge started"
        );

        Self {
            runtime,
            backend,
            lanes,
            workers,
            completions: completion_rx,
            in_flight,
            next_id: AtomicU64::new(1),
            phase: Phase::Open,
        }
    }

    /// Queue a load.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Draining`] once draining has begun.
    pub fn enqueue_load(&self, id: PlayerId) -> Result<TaskHandle, BridgeError> {
        self.enqueue(TaskRequest::Load(id))
    }

    /// Queue a save of a record snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Draining`] once draining has begun.
    pub fn enqueue_save(&self, record: Arc<PlayerRecord>) -> Result<TaskHandle, BridgeError> {
        self.enqueue(TaskRequest::Save(record))
    }

    /// Queue a purge.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Draining`] once draining has begun.
    pub fn enqueue_purge(&self, id: PlayerId) -> Result<TaskHandle, BridgeError> {
        self.enqueue(TaskRequest::Purge(id))
    }

    /// Queue any request on its player's lane.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Draining`] once draining has begun, or
    /// [`BridgeError::Stopped`] if the lane worker is gone.
    pub fn enqueue(&self, request: TaskRequest) -> Result<TaskHandle, BridgeError> {
        if self.phase == Phase::Draining {
            return Err(BridgeError::Draining);
        }

        let player = request.player();
        let lane = lane_for(player, self.lanes.len());
        let sender = self.lanes.get(lane).ok_or(BridgeError::Stopped)?;

        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let handle = TaskHandle::new(id, player, request.kind());
        let kind = request.kind();

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if sender
            .send(PendingTask {
                handle: handle.clone(),
                request,
            })
            .is_err()
        {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(BridgeError::Stopped);
        }

        debug!(task = id, player = %player, ?kind, lane, "Task queued");
        Ok(handle)
    }

    /// Take every completion delivered since the last poll. Never blocks.
    pub fn poll_completions(&mut self) -> Vec<Completion> {
        let mut done = Vec::new();
        while let Ok(completion) = self.completions.try_recv() {
            done.push(completion);
        }
        done
    }

    /// Tasks enqueued whose completion has not been delivered yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Whether new work is still accepted.
    pub fn is_accepting(&self) -> bool {
        self.phase == Phase::Open
    }

    /// The backend tasks run against.
    pub const fn backend(&self) -> &RecordBackend {
        &self.backend
    }

    /// Run a future to completion on the worker runtime, blocking the
    /// calling thread. Must not be called from inside an async context.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Stop accepting work and wait up to `timeout` for every queued and
    /// running task to finish. Lanes exit once their queues are empty.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DrainTimeout`] if work is still in flight
    /// when the deadline passes.
    pub fn drain(&mut self, timeout: Duration) -> Result<(), BridgeError> {
        self.phase = Phase::Draining;
        self.lanes.clear();

        let pending = self.in_flight();
        info!(pending, timeout_ms = millis(timeout), "Draining task bridge");

        let workers = core::mem::take(&mut self.workers);
        let joined = self.runtime.block_on(async move {
            tokio::time::timeout(timeout, futures::future::join_all(workers)).await
        });

        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!(error = %e, "Lane worker ended abnormally");
                    }
                }
                info!("Task bridge drained");
                Ok(())
            }
            Err(_elapsed) => {
                let pending = self.in_flight();
                warn!(pending, timeout_ms = millis(timeout), "Drain deadline passed");
                Err(BridgeError::DrainTimeout { pending, timeout })
            }
        }
    }

    /// Close the backend's pool, waiting at most `timeout` for leases held
    /// by tasks that outlived a drain.
    pub fn close_backend(&self, timeout: Duration) {
        let backend = self.backend.clone();
        let closed = self
            .runtime
            .block_on(async move { tokio::time::timeout(timeout, backend.close()).await });
        if closed.is_err() {
            warn!(
                timeout_ms = millis(timeout),
                "Pool did not close cleanly; leases still outstanding"
            );
        }
    }

    /// Close the backend if still open and shut down the worker runtime.
    /// Tasks still running after `timeout` are abandoned.
    pub fn shutdown(self, timeout: Duration) {
        if !self.backend.is_closed() {
            self.close_backend(timeout);
        }
        let Self {
            runtime, lanes, ..
        } = self;
        drop(lanes);
        runtime.shutdown_timeout(timeout);
        info!("Task bridge stopped");
    }
}

/// State moved into each lane's worker task.
struct LaneWorker {
    lane: usize,
    backend: RecordBackend,
    config: BridgeConfig,
    completions: mpsc::UnboundedSender<Completion>,
    in_flight: Arc<AtomicUsize>,
}

impl LaneWorker {
    async fn run(self, mut queue: mpsc::UnboundedReceiver<PendingTask>) {
        while let Some(PendingTask { handle, request }) = queue.recv().await {
            let (outcome, attempts) = if handle.begin() {
                let (outcome, attempts) = self.execute(&request).await;
                (Arc::new(outcome), attempts)
            } else {
                let outcome = handle
                    .try_outcome()
                    .unwrap_or_else(|| Arc::new(TaskOutcome::Cancelled));
                (outcome, 0)
            };

            debug!(
                lane = self.lane,
                task = handle.id(),
                player = %request.player(),
                state = ?outcome.state(),
                attempts,
                "Task finished"
            );

            // Queue first, so a caller woken by `wait` finds it at the next poll.
            let completion = Completion {
                handle: handle.clone(),
                request,
                outcome: Arc::clone(&outcome),
                attempts,
            };
            if self.completions.send(completion).is_err() {
                debug!(lane = self.lane, "Completion queue closed");
            }
            handle.publish(outcome);
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
        debug!(lane = self.lane, "Lane worker exiting");
    }

    /// Run one request, retrying transient failures with backoff.
    async fn execute(&self, request: &TaskRequest) -> (TaskOutcome, u32) {
        let mut attempt: u32 = 0;
        loop {
            let result = match request {
                TaskRequest::Load(id) => self.backend.load(*id).await.map(TaskOutput::Loaded),
                TaskRequest::Save(record) => {
                    self.backend.save(record).await.map(TaskOutput::Saved)
                }
                TaskRequest::Purge(id) => self.backend.purge(*id).await.map(TaskOutput::Purged),
            };
            let attempts = attempt.saturating_add(1);

            match result {
                Ok(output) => return (TaskOutcome::Completed(output), attempts),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        lane = self.lane,
                        player = %request.player(),
                        kind = ?request.kind(),
                        attempt = attempts,
                        delay_ms = millis(delay),
                        error = %e,
                        "Transient storage failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempts;
                }
                Err(e) => return (TaskOutcome::Failed(e), attempts),
            }
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
