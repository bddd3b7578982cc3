//! Background task workers for payload transforms (parse/compress/optimize)
//!
//! Pool model:
//! - Fixed set of worker threads, each fed one job at a time over its own channel
//! - FIFO queue on the manager side; a dispatch step hands the oldest queued
//!   task to the first idle worker (on submit and on every completion)
//! - Each task owns a reply channel kept in `pending` until it resolves
//!
//! Task lifecycle: `queued -> assigned -> {completed | errored | timed-out}`
//!
//! Timeouts run from submission and fire whether or not anyone is waiting:
//! a timer thread sweeps overdue tasks, and every dispatch and completion
//! sweeps first. A timed-out task is dropped from `pending` and resolved with
//! `TaskError::Timeout`, so a late reply from the worker is ignored.
//!
//! A panicking worker rejects every pending task (assigned and queued) and is
//! discarded without replacement. Once no workers remain, or when workers are
//! disabled, tasks run inline on the caller's thread.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::WorkerSettings;

// ============================================================================
// Task types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// JSON text -> value
    Parse,
    /// Optimize, then minified JSON text
    Compress,
    /// JSON text -> value
    Decompress,
    /// Round floats and drop hidden layers
    Optimize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOptions {
    /// Decimal places kept when rounding floats
    pub precision: u32,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self { precision: 3 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskError {
    Timeout { id: u64, timeout_ms: u64 },
    WorkerCrashed(String),
    Failed(String),
    /// Reply channel closed without a result
    Disconnected,
    ShutDown,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Timeout { id, timeout_ms } => write!(f, "Task {} timed out after {} ms", id, timeout_ms),
            TaskError::WorkerCrashed(msg) => write!(f, "Worker crashed: {}", msg),
            TaskError::Failed(msg) => write!(f, "Task failed: {}", msg),
            TaskError::Disconnected => write!(f, "Task reply channel disconnected"),
            TaskError::ShutDown => write!(f, "Worker manager shut down"),
        }
    }
}

impl std::error::Error for TaskError {}

pub type TaskResult = Result<Value, TaskError>;

/// Executes one transform. Runs on worker threads or inline.
pub trait TaskProcessor: Send + Sync {
    fn process(&self, kind: TaskKind, data: &Value, options: &TaskOptions) -> Result<Value, String>;
}

// ============================================================================
// Default transforms
// ============================================================================

/// JSON payload transforms used by default
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadTransforms;

impl PayloadTransforms {
    fn parse(data: &Value) -> Result<Value, String> {
        match data {
            Value::String(text) => serde_json::from_str(text).map_err(|e| e.to_string()),
            _ => Err("expected JSON text".to_string()),
        }
    }

    fn optimize(data: &Value, precision: u32) -> Result<Value, String> {
        let mut value = match data {
            Value::String(_) => Self::parse(data)?,
            other => other.clone(),
        };
        let factor = 10f64.powi(precision.min(15) as i32);
        optimize_value(&mut value, factor);
        Ok(value)
    }
}

impl TaskProcessor for PayloadTransforms {
    fn process(&self, kind: TaskKind, data: &Value, options: &TaskOptions) -> Result<Value, String> {
        match kind {
            TaskKind::Parse | TaskKind::Decompress => Self::parse(data),
            TaskKind::Optimize => Self::optimize(data, options.precision),
            TaskKind::Compress => {
                let optimized = Self::optimize(data, options.precision)?;
                serde_json::to_string(&optimized)
                    .map(Value::String)
                    .map_err(|e| e.to_string())
            }
        }
    }
}

fn optimize_value(value: &mut Value, factor: f64) {
    match value {
        Value::Number(n) if n.is_f64() => {
            if let Some(rounded) = n
                .as_f64()
                .map(|f| (f * factor).round() / factor)
                .and_then(serde_json::Number::from_f64)
            {
                *n = rounded;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| optimize_value(v, factor)),
        Value::Object(map) => {
            if let Some(Value::Array(layers)) = map.get_mut("layers") {
                layers.retain(|layer| layer.get("hd") != Some(&Value::Bool(true)));
            }
            map.values_mut().for_each(|v| optimize_value(v, factor));
        }
        _ => {}
    }
}

// ============================================================================
// Task handle
// ============================================================================

/// Pending result of a submitted task
pub struct TaskHandle {
    id: u64,
    rx: Receiver<TaskResult>,
    deadline: Option<Instant>,
    timeout_ms: u64,
    inner: Weak<Inner>,
}

impl TaskHandle {
    fn resolved(id: u64, result: TaskResult) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let _ = tx.send(result);
        Self {
            id,
            rx,
            deadline: None,
            timeout_ms: 0,
            inner: Weak::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the result arrives or the task times out
    pub fn wait(self) -> TaskResult {
        let Some(deadline) = self.deadline else {
            return self.rx.recv().unwrap_or(Err(TaskError::Disconnected));
        };
        match self.rx.recv_deadline(deadline) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => self.expire(),
            Err(RecvTimeoutError::Disconnected) => Err(TaskError::Disconnected),
        }
    }

    /// Non-blocking check. Once this returns Some the handle is spent.
    pub fn try_result(&self) -> Option<TaskResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => match self.deadline {
                Some(deadline) if Instant::now() >= deadline => Some(self.expire()),
                _ => None,
            },
            Err(TryRecvError::Disconnected) => Some(Err(TaskError::Disconnected)),
        }
    }

    fn expire(&self) -> TaskResult {
        let removed = match self.inner.upgrade() {
            Some(inner) => {
                let mut state = inner.lock();
                let removed = state.pending.remove(&self.id).is_some();
                if removed {
                    state.timed_out += 1;
                }
                removed
            }
            None => true,
        };
        if !removed {
            // Resolved between the deadline and the lock
            if let Ok(result) = self.rx.try_recv() {
                return result;
            }
        }
        warn!("Worker task {} timed out after {} ms", self.id, self.timeout_ms);
        Err(TaskError::Timeout {
            id: self.id,
            timeout_ms: self.timeout_ms,
        })
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("deadline", &self.deadline)
            .finish()
    }
}

// ============================================================================
// Manager
// ============================================================================

struct Job {
    id: u64,
    kind: TaskKind,
    data: Value,
    options: TaskOptions,
}

/// Reply side of a task that has not resolved yet
struct PendingTask {
    tx: Sender<TaskResult>,
    deadline: Instant,
}

/// Queued task record
struct WorkerTask {
    job: Job,
    created_at: Instant,
}

struct WorkerSlot {
    id: usize,
    tx: Sender<Job>,
    handle: Option<thread::JoinHandle<()>>,
    busy: Option<u64>,
}

#[derive(Default)]
struct State {
    initialized: bool,
    shutdown: bool,
    workers: Vec<WorkerSlot>,
    queue: VecDeque<WorkerTask>,
    pending: HashMap<u64, PendingTask>,
    timeout_ms: u64,
    /// Wakes the timer thread; dropped on shutdown
    timer: Option<Sender<()>>,
    completed: u64,
    failed: u64,
    timed_out: u64,
    late_replies: u64,
    crashed_workers: u64,
    inline_runs: u64,
}

impl State {
    /// Resolve every task whose deadline has passed with `Timeout`.
    /// Returns the earliest deadline still outstanding.
    fn expire_overdue(&mut self, now: Instant) -> Option<Instant> {
        let overdue: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, task)| task.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in overdue {
            if let Some(task) = self.pending.remove(&id) {
                self.timed_out += 1;
                warn!("Worker task {} timed out after {} ms", id, self.timeout_ms);
                let _ = task.tx.send(Err(TaskError::Timeout {
                    id,
                    timeout_ms: self.timeout_ms,
                }));
            }
        }
        let pending = &self.pending;
        self.queue.retain(|task| pending.contains_key(&task.job.id));
        self.pending.values().map(|task| task.deadline).min()
    }

    /// Hand queued tasks to idle workers, oldest first
    fn dispatch(&mut self) {
        self.expire_overdue(Instant::now());
        loop {
            let Some(slot_idx) = self.workers.iter().position(|w| w.busy.is_none()) else {
                break;
            };
            let Some(task) = self.queue.pop_front() else {
                break;
            };
            let id = task.job.id;
            if !self.pending.contains_key(&id) {
                // Timed out while queued
                continue;
            }
            let slot = &mut self.workers[slot_idx];
            trace!(
                "Dispatch task {} to worker {} (queued {:?})",
                id,
                slot.id,
                task.created_at.elapsed()
            );
            match slot.tx.send(task.job) {
                Ok(()) => slot.busy = Some(id),
                Err(_) => {
                    // Worker thread is gone; drop it and fail the task
                    warn!("Worker {} channel closed, discarding", slot.id);
                    self.workers.remove(slot_idx);
                    if let Some(task) = self.pending.remove(&id) {
                        self.failed += 1;
                        let _ = task.tx.send(Err(TaskError::WorkerCrashed("worker channel closed".into())));
                    }
                }
            }
        }
    }

    fn reject_all(&mut self, error: TaskError) -> usize {
        self.queue.clear();
        let count = self.pending.len();
        for (_, task) in self.pending.drain() {
            let _ = task.tx.send(Err(error.clone()));
        }
        count
    }
}

struct Inner {
    state: Mutex<State>,
    processor: Arc<dyn TaskProcessor>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn complete(&self, worker_id: usize, task_id: u64, result: Result<Value, String>) {
        let mut state = self.lock();
        state.expire_overdue(Instant::now());
        match state.pending.remove(&task_id) {
            Some(task) => {
                match &result {
                    Ok(_) => state.completed += 1,
                    Err(_) => state.failed += 1,
                }
                let _ = task.tx.send(result.map_err(TaskError::Failed));
            }
            None => {
                state.late_replies += 1;
                trace!("Ignoring late reply for task {}", task_id);
            }
        }
        if let Some(slot) = state.workers.iter_mut().find(|w| w.id == worker_id) {
            slot.busy = None;
        }
        state.dispatch();
    }

    fn worker_crashed(&self, worker_id: usize, message: String) {
        let mut state = self.lock();
        error!("Worker {} crashed: {}", worker_id, message);
        state.workers.retain(|w| w.id != worker_id);
        state.crashed_workers += 1;
        let rejected = state.reject_all(TaskError::WorkerCrashed(message));
        state.failed += rejected as u64;
        warn!(
            "Rejected {} pending tasks, {} workers remain",
            rejected,
            state.workers.len()
        );
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub enabled: bool,
    pub initialized: bool,
    pub total_workers: usize,
    pub available_workers: usize,
    pub busy_workers: usize,
    pub queued: usize,
    pub pending: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub late_replies: u64,
    pub crashed_workers: u64,
    pub inline_runs: u64,
}

pub struct WorkerManager {
    inner: Arc<Inner>,
    enabled: bool,
    max_workers: usize,
    timeout: Duration,
    next_id: AtomicU64,
}

impl WorkerManager {
    /// `max_workers == 0` sizes the pool to half the CPU count (at least one).
    /// Threads are spawned lazily on the first submission.
    pub fn new(enabled: bool, max_workers: usize, timeout_ms: u64, processor: Arc<dyn TaskProcessor>) -> Self {
        let max_workers = if max_workers == 0 {
            (num_cpus::get() / 2).max(1)
        } else {
            max_workers
        };
        let timeout = Duration::from_millis(timeout_ms.max(1));
        let state = State {
            timeout_ms: timeout.as_millis() as u64,
            ..State::default()
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                processor,
            }),
            enabled,
            max_workers,
            timeout,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self::new(
            settings.enabled,
            settings.max_workers,
            settings.timeout_ms,
            Arc::new(PayloadTransforms),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Queue a transform. Resolves inline when workers are disabled or gone.
    pub fn submit_task(&self, kind: TaskKind, data: Value, options: TaskOptions) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.inner.lock();

        if state.shutdown {
            return TaskHandle::resolved(id, Err(TaskError::ShutDown));
        }
        if self.enabled && !state.initialized {
            self.spawn_workers(&mut state);
        }
        if !self.enabled || state.workers.is_empty() {
            state.inline_runs += 1;
            drop(state);
            trace!("Task {} ({:?}) running inline", id, kind);
            let result = self
                .inner
                .processor
                .process(kind, &data, &options)
                .map_err(TaskError::Failed);
            return TaskHandle::resolved(id, result);
        }

        let (tx, rx) = crossbeam_channel::bounded(1);
        let created_at = Instant::now();
        let deadline = created_at + self.timeout;
        state.pending.insert(id, PendingTask { tx, deadline });
        state.queue.push_back(WorkerTask {
            job: Job { id, kind, data, options },
            created_at,
        });
        if let Some(timer) = &state.timer {
            let _ = timer.try_send(());
        }
        state.dispatch();

        TaskHandle {
            id,
            rx,
            deadline: Some(deadline),
            timeout_ms: self.timeout.as_millis() as u64,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Submit and block for the result
    pub fn run(&self, kind: TaskKind, data: Value, options: TaskOptions) -> TaskResult {
        self.submit_task(kind, data, options).wait()
    }

    fn spawn_workers(&self, state: &mut State) {
        state.initialized = true;
        for worker_id in 0..self.max_workers {
            match spawn_worker(&self.inner, worker_id) {
                Ok(slot) => state.workers.push(slot),
                Err(e) => error!("Failed to spawn worker {}: {}", worker_id, e),
            }
        }
        info!("WorkerManager: {} workers started", state.workers.len());

        if !state.workers.is_empty() {
            match spawn_timer(&self.inner) {
                Ok(wake) => state.timer = Some(wake),
                Err(e) => error!("Failed to spawn task timer: {}", e),
            }
        }
    }

    pub fn get_stats(&self) -> WorkerStats {
        let state = self.inner.lock();
        let busy = state.workers.iter().filter(|w| w.busy.is_some()).count();
        WorkerStats {
            enabled: self.enabled,
            initialized: state.initialized,
            total_workers: state.workers.len(),
            available_workers: state.workers.len() - busy,
            busy_workers: busy,
            queued: state.queue.len(),
            pending: state.pending.len(),
            completed: state.completed,
            failed: state.failed,
            timed_out: state.timed_out,
            late_replies: state.late_replies,
            crashed_workers: state.crashed_workers,
            inline_runs: state.inline_runs,
        }
    }

    /// Reject pending tasks and stop all workers (bounded wait).
    /// Later submissions resolve with `TaskError::ShutDown`.
    pub fn shutdown(&self) {
        let workers = {
            let mut state = self.inner.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            let rejected = state.reject_all(TaskError::ShutDown);
            if rejected > 0 {
                debug!("WorkerManager shutdown rejected {} tasks", rejected);
            }
            // Closing the wake channel stops the timer thread
            state.timer = None;
            std::mem::take(&mut state.workers)
        };

        let num_threads = workers.len();
        trace!("WorkerManager shutting down ({} threads)...", num_threads);

        // Dropping the senders ends each worker's receive loop
        let handles: Vec<thread::JoinHandle<()>> = workers.into_iter().filter_map(|w| w.handle).collect();

        let deadline = Instant::now() + Duration::from_millis(500);
        for handle in handles {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Shutdown timeout reached, exiting anyway");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }
        trace!("All {} workers stopped gracefully", num_threads);
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(inner: &Arc<Inner>, worker_id: usize) -> std::io::Result<WorkerSlot> {
    let (tx, rx) = crossbeam_channel::unbounded::<Job>();
    let inner = Arc::downgrade(inner);

    let handle = thread::Builder::new()
        .name(format!("orchestra-worker-{}", worker_id))
        .spawn(move || {
            trace!("Worker {} started", worker_id);
            for job in rx.iter() {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let processor = Arc::clone(&inner.processor);
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    processor.process(job.kind, &job.data, &job.options)
                }));
                match outcome {
                    Ok(result) => inner.complete(worker_id, job.id, result),
                    Err(payload) => {
                        inner.worker_crashed(worker_id, panic_message(payload.as_ref()));
                        break;
                    }
                }
            }
            trace!("Worker {} stopped", worker_id);
        })?;

    Ok(WorkerSlot {
        id: worker_id,
        tx,
        handle: Some(handle),
        busy: None,
    })
}

/// Timer thread: sleeps until the earliest pending deadline, or until a
/// submission wakes it, and expires overdue tasks.
fn spawn_timer(inner: &Arc<Inner>) -> std::io::Result<Sender<()>> {
    let (wake_tx, wake_rx) = crossbeam_channel::bounded::<()>(1);
    let inner = Arc::downgrade(inner);

    thread::Builder::new()
        .name("orchestra-worker-timer".to_string())
        .spawn(move || {
            loop {
                let Some(strong) = inner.upgrade() else {
                    break;
                };
                let next = {
                    let mut state = strong.lock();
                    state.expire_overdue(Instant::now())
                };
                drop(strong);
                let woken = match next {
                    Some(deadline) => wake_rx.recv_deadline(deadline),
                    None => wake_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                };
                if let Err(RecvTimeoutError::Disconnected) = woken {
                    break;
                }
            }
            trace!("Task timer stopped");
        })?;

    Ok(wake_tx)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
