//! Background task scheduler.
//!
//! All expensive work (ingestion, embedding, retrieval, generation) runs
//! here, on a bounded pool of tokio worker tasks, so the interactive
//! thread only ever enqueues and observes.
//!
//! # Dispatch rules
//!
//! - One FIFO queue per [`TaskKind`]; only queue heads are candidates.
//! - At most one running task per heavy lane: `Generate` (the model lane)
//!   and `Ingest`/`Embed` together (the ingestion lane). `Retrieve` is
//!   cheap and has no lane limit.
//! - A runnable `Retrieve` head may jump ahead of runnable expensive work,
//!   but only `fairness_limit` times in a row; then the oldest runnable
//!   expensive task goes next.
//! - Ingestion work is not dispatched while the resource governor reports
//!   memory pressure; it stays queued (deferred) until pressure clears.
//!
//! # Lifecycle
//!
//! ```text
//! submit ──▶ Queued ──▶ Running ──▶ Done | Failed | Cancelled
//!              │
//!              └──── cancel ────▶ Cancelled (never runs)
//! ```
//!
//! Every transition is published as a [`TaskEvent`] on a broadcast
//! channel. Terminal records are kept for [`wait`](Scheduler::wait) and
//! [`status`](Scheduler::status) until `history_limit` newer tasks have
//! finished.
//!
//! At most `max_queue` top-level tasks wait at once; further submissions
//! fail with `CapacityExceeded`. Follow-up tasks spawned by a running task
//! are not counted against the bound.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;

use hearth_core::models::{ConversationTurn, DocumentMeta, ScoredChunk, TaskKind, TaskState};
use hearth_core::{Error, Result};

use crate::config::SchedulerConfig;
use crate::governor::{Admission, Pressure, ResourceGovernor};

/// How often idle workers recheck deferred work without being woken.
const IDLE_RECHECK: Duration = Duration::from_millis(250);
const EVENT_CHANNEL_CAPACITY: usize = 512;

pub type TaskId = u64;

/// Opaque reference to a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TaskHandle {
    pub id: TaskId,
    pub kind: TaskKind,
}

impl std::fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// Cooperative cancellation flag shared between a task and its owner.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// `Err(Cancelled)` once the flag is set. Call at stage boundaries.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the flag is set.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress and lifecycle notification for one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    pub task: TaskId,
    pub kind: TaskKind,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<TaskId>,
}

/// What a successfully completed task produced.
#[derive(Debug, Clone)]
pub enum TaskOutput {
    /// Text extracted and chunked; indexing continues in `embed_task`.
    Ingested {
        document: DocumentMeta,
        embed_task: TaskHandle,
    },
    /// Chunks stored in the index.
    Indexed {
        document: DocumentMeta,
        added: usize,
        evicted: Vec<String>,
    },
    Hits(Vec<ScoredChunk>),
    Reply(ConversationTurn),
}

pub type TaskResult = Result<TaskOutput>;

type TaskFuture = Pin<Box<dyn Future<Output = TaskResult> + Send>>;
type Job = Box<dyn FnOnce(TaskContext) -> TaskFuture + Send>;

/// Snapshot of one task, for status listings.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub handle: TaskHandle,
    pub state: TaskState,
    pub parent: Option<TaskId>,
    pub deferred: bool,
}

/// Counters since the scheduler started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub running: usize,
    pub done: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Mean run time of tasks that started and finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_run_ms: Option<f64>,
}

#[derive(Default)]
struct Totals {
    done: u64,
    failed: u64,
    cancelled: u64,
    ran: u64,
    run_time: Duration,
}

/// Handed to every running job.
pub struct TaskContext {
    handle: TaskHandle,
    cancel: CancelToken,
    scheduler: Scheduler,
}

impl TaskContext {
    pub fn handle(&self) -> TaskHandle {
        self.handle
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn check_cancelled(&self) -> Result<()> {
        self.cancel.check()
    }

    /// Publish a progress event (`fraction` in `[0, 1]`).
    pub fn progress(&self, fraction: f32, detail: impl Into<String>) {
        self.scheduler.inner.emit(TaskEvent {
            task: self.handle.id,
            kind: self.handle.kind,
            state: TaskState::Running,
            progress: Some(fraction.clamp(0.0, 1.0)),
            detail: Some(detail.into()),
            parent: None,
        });
    }

    /// Submit a follow-up task whose parent is this one.
    pub fn spawn_child<F, Fut>(&self, kind: TaskKind, job: F) -> Result<TaskHandle>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.scheduler
            .submit_inner(kind, Some(self.handle.id), Box::new(move |ctx| Box::pin(job(ctx))))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Lane {
    Model,
    Ingestion,
}

fn heavy_lane(kind: TaskKind) -> Option<Lane> {
    match kind {
        TaskKind::Generate => Some(Lane::Model),
        TaskKind::Ingest | TaskKind::Embed => Some(Lane::Ingestion),
        TaskKind::Retrieve => None,
    }
}

const EXPENSIVE_KINDS: [TaskKind; 3] = [TaskKind::Ingest, TaskKind::Embed, TaskKind::Generate];

struct TaskRecord {
    kind: TaskKind,
    parent: Option<TaskId>,
    state: TaskState,
    deferred: bool,
    cancel: CancelToken,
    job: Option<Job>,
    done: watch::Sender<Option<TaskResult>>,
}

struct Dispatch {
    handle: TaskHandle,
    parent: Option<TaskId>,
    cancel: CancelToken,
    job: Job,
}

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, TaskRecord>,
    queues: HashMap<TaskKind, VecDeque<TaskId>>,
    busy: HashSet<Lane>,
    cheap_streak: usize,
    finished: VecDeque<TaskId>,
    totals: Totals,
    next_id: TaskId,
    shutdown: bool,
}

impl State {
    fn runnable_head(&self, kind: TaskKind, pressure: Pressure) -> Option<TaskId> {
        let id = *self.queues.get(&kind)?.front()?;
        if let Some(lane) = heavy_lane(kind) {
            if self.busy.contains(&lane) {
                return None;
            }
        }
        if kind.is_ingestion() && pressure != Pressure::Normal {
            return None;
        }
        Some(id)
    }

    fn pick(&mut self, fairness_limit: usize, pressure: Pressure) -> Option<Dispatch> {
        if self.shutdown {
            return None;
        }
        let cheap = self.runnable_head(TaskKind::Retrieve, pressure);
        // ids are assigned in submission order, so the smallest is the oldest
        let expensive = EXPENSIVE_KINDS
            .iter()
            .filter_map(|k| self.runnable_head(*k, pressure))
            .min();

        let chosen = match (cheap, expensive) {
            (Some(c), Some(e)) => {
                if self.cheap_streak < fairness_limit {
                    self.cheap_streak += 1;
                    c
                } else {
                    self.cheap_streak = 0;
                    e
                }
            }
            (Some(c), None) => {
                self.cheap_streak = 0;
                c
            }
            (None, Some(e)) => {
                self.cheap_streak = 0;
                e
            }
            (None, None) => return None,
        };

        let record = self.tasks.get_mut(&chosen)?;
        let kind = record.kind;
        if let Some(queue) = self.queues.get_mut(&kind) {
            queue.pop_front();
        }
        record.state = TaskState::Running;
        let job = record.job.take()?;
        let dispatch = Dispatch {
            handle: TaskHandle { id: chosen, kind },
            parent: record.parent,
            cancel: record.cancel.clone(),
            job,
        };
        if let Some(lane) = heavy_lane(kind) {
            self.busy.insert(lane);
        }
        Some(dispatch)
    }

    fn queued_len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    fn retire(&mut self, id: TaskId, history_limit: usize) {
        self.finished.push_back(id);
        while self.finished.len() > history_limit {
            if let Some(old) = self.finished.pop_front() {
                self.tasks.remove(&old);
            }
        }
    }
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    events: broadcast::Sender<TaskEvent>,
    governor: Option<Arc<ResourceGovernor>>,
    fairness_limit: usize,
    history_limit: usize,
    max_queue: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: TaskEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn pressure(&self) -> Pressure {
        self.governor
            .as_ref()
            .map(|g| g.pressure())
            .unwrap_or(Pressure::Normal)
    }

    fn finish(
        &self,
        handle: TaskHandle,
        parent: Option<TaskId>,
        result: TaskResult,
        elapsed: Duration,
    ) {
        let state = match &result {
            Ok(_) => TaskState::Done,
            Err(Error::Cancelled) => TaskState::Cancelled,
            Err(_) => TaskState::Failed,
        };
        let detail = match &result {
            Err(e) if !e.is_cancelled() => Some(format!("{}: {}", e.code(), e)),
            _ => None,
        };
        match &result {
            Ok(_) => tracing::debug!(task_id = handle.id, kind = %handle.kind, "task done"),
            Err(Error::Cancelled) => {
                tracing::info!(task_id = handle.id, kind = %handle.kind, "task cancelled")
            }
            Err(e) => {
                tracing::warn!(task_id = handle.id, kind = %handle.kind, error = %e, "task failed")
            }
        }

        {
            let mut st = self.lock();
            if let Some(lane) = heavy_lane(handle.kind) {
                st.busy.remove(&lane);
            }
            match state {
                TaskState::Done => st.totals.done += 1,
                TaskState::Cancelled => st.totals.cancelled += 1,
                _ => st.totals.failed += 1,
            }
            st.totals.ran += 1;
            st.totals.run_time += elapsed;
            if let Some(record) = st.tasks.get_mut(&handle.id) {
                if record.state.can_transition_to(state) {
                    record.state = state;
                }
                record.done.send_replace(Some(result));
            }
            st.retire(handle.id, self.history_limit);
        }

        self.emit(TaskEvent {
            task: handle.id,
            kind: handle.kind,
            state,
            progress: None,
            detail,
            parent,
        });
        self.notify.notify_waiters();
    }
}

/// Cloneable handle to the worker pool.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Start the worker pool. Must be called inside a tokio runtime.
    pub fn start(config: &SchedulerConfig, governor: Option<Arc<ResourceGovernor>>) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let worker_count = config.max_workers.min(cores).max(1);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                next_id: 1,
                ..State::default()
            }),
            notify: Notify::new(),
            events,
            governor,
            fairness_limit: config.fairness_limit.max(1),
            history_limit: config.history_limit.max(1),
            max_queue: config.max_queue.max(1),
            workers: Mutex::new(Vec::new()),
            worker_count,
        });

        let handles: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|_| tokio::spawn(worker_loop(Arc::clone(&inner))))
            .collect();
        *inner.workers.lock().unwrap_or_else(|e| e.into_inner()) = handles;
        tracing::debug!(workers = worker_count, "scheduler started");

        Self { inner }
    }

    pub fn worker_count(&self) -> usize {
        self.inner.worker_count
    }

    /// Enqueue a job of `kind`.
    ///
    /// Ingestion kinds pass through governor admission first: a `Reject`
    /// returns `CapacityExceeded` and no task is created; a `Defer` queues
    /// the task and holds it until pressure clears.
    pub fn submit<F, Fut>(&self, kind: TaskKind, job: F) -> Result<TaskHandle>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.submit_inner(kind, None, Box::new(move |ctx| Box::pin(job(ctx))))
    }

    fn submit_inner(&self, kind: TaskKind, parent: Option<TaskId>, job: Job) -> Result<TaskHandle> {
        let admission = self
            .inner
            .governor
            .as_ref()
            .map(|g| g.admit(kind))
            .unwrap_or(Admission::Allow);
        if admission == Admission::Reject {
            tracing::warn!(%kind, "task rejected: memory above hard ceiling");
            return Err(Error::CapacityExceeded(format!(
                "memory is above the hard ceiling; {kind} work is not accepted"
            )));
        }
        let deferred = admission == Admission::Defer;

        let handle = {
            let mut st = self.inner.lock();
            if st.shutdown {
                return Err(Error::CapacityExceeded(
                    "scheduler is shutting down".to_string(),
                ));
            }
            if parent.is_none() && st.queued_len() >= self.inner.max_queue {
                tracing::warn!(%kind, max_queue = self.inner.max_queue, "task rejected: queue is full");
                return Err(Error::CapacityExceeded(format!(
                    "queue is full ({} tasks waiting)",
                    self.inner.max_queue
                )));
            }
            let id = st.next_id;
            st.next_id += 1;
            let (done, _) = watch::channel(None);
            st.tasks.insert(
                id,
                TaskRecord {
                    kind,
                    parent,
                    state: TaskState::Queued,
                    deferred,
                    cancel: CancelToken::new(),
                    job: Some(job),
                    done,
                },
            );
            st.queues.entry(kind).or_default().push_back(id);
            // published under the lock so Queued always precedes Running
            self.inner.emit(TaskEvent {
                task: id,
                kind,
                state: TaskState::Queued,
                progress: None,
                detail: deferred.then(|| "deferred: memory pressure".to_string()),
                parent,
            });
            TaskHandle { id, kind }
        };

        tracing::debug!(task_id = handle.id, %kind, deferred, "task queued");
        self.inner.notify.notify_waiters();
        Ok(handle)
    }

    /// Request cancellation.
    ///
    /// A queued task is cancelled immediately and never runs. A running
    /// task has its flag set and stops at its next stage boundary.
    /// Returns the state right after the request.
    pub fn cancel(&self, handle: TaskHandle) -> Result<TaskState> {
        let (state, parent) = {
            let mut guard = self.inner.lock();
            let st = &mut *guard;
            let record = st
                .tasks
                .get_mut(&handle.id)
                .ok_or_else(|| Error::NotFound(format!("task {}", handle.id)))?;
            match record.state {
                TaskState::Queued => {
                    record.state = TaskState::Cancelled;
                    record.job = None;
                    record.cancel.cancel();
                    record.done.send_replace(Some(Err(Error::Cancelled)));
                    let kind = record.kind;
                    let parent = record.parent;
                    if let Some(queue) = st.queues.get_mut(&kind) {
                        queue.retain(|id| *id != handle.id);
                    }
                    st.totals.cancelled += 1;
                    st.retire(handle.id, self.inner.history_limit);
                    (TaskState::Cancelled, parent)
                }
                TaskState::Running => {
                    record.cancel.cancel();
                    return Ok(TaskState::Running);
                }
                terminal => return Ok(terminal),
            }
        };

        tracing::info!(task_id = handle.id, kind = %handle.kind, "queued task cancelled");
        self.inner.emit(TaskEvent {
            task: handle.id,
            kind: handle.kind,
            state,
            progress: None,
            detail: None,
            parent,
        });
        self.inner.notify.notify_waiters();
        Ok(state)
    }

    pub fn status(&self, handle: TaskHandle) -> Result<TaskState> {
        self.inner
            .lock()
            .tasks
            .get(&handle.id)
            .map(|r| r.state)
            .ok_or_else(|| Error::NotFound(format!("task {}", handle.id)))
    }

    /// Look up a task handle by id (e.g. from CLI input).
    pub fn handle(&self, id: TaskId) -> Option<TaskHandle> {
        self.inner
            .lock()
            .tasks
            .get(&id)
            .map(|r| TaskHandle { id, kind: r.kind })
    }

    /// Resolve once the task reaches a terminal state.
    pub async fn wait(&self, handle: TaskHandle) -> TaskResult {
        let mut rx = {
            let st = self.inner.lock();
            st.tasks
                .get(&handle.id)
                .map(|r| r.done.subscribe())
                .ok_or_else(|| Error::NotFound(format!("task {}", handle.id)))?
        };
        let outcome = rx.wait_for(|r| r.is_some()).await;
        match outcome {
            Ok(result) => result
                .clone()
                .unwrap_or_else(|| Err(Error::NotFound(format!("task {}", handle.id)))),
            Err(_) => Err(Error::NotFound(format!(
                "task record {} was pruned",
                handle.id
            ))),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    /// Known tasks, oldest first.
    pub fn tasks(&self) -> Vec<TaskInfo> {
        let st = self.inner.lock();
        let mut out: Vec<TaskInfo> = st
            .tasks
            .iter()
            .map(|(id, r)| TaskInfo {
                handle: TaskHandle { id: *id, kind: r.kind },
                state: r.state,
                parent: r.parent,
                deferred: r.deferred,
            })
            .collect();
        out.sort_by_key(|t| t.handle.id);
        out
    }

    pub fn stats(&self) -> SchedulerStats {
        let st = self.inner.lock();
        let running = st
            .tasks
            .values()
            .filter(|r| r.state == TaskState::Running)
            .count();
        let average_run_ms = (st.totals.ran > 0)
            .then(|| st.totals.run_time.as_secs_f64() * 1000.0 / st.totals.ran as f64);
        SchedulerStats {
            queued: st.queued_len(),
            running,
            done: st.totals.done,
            failed: st.totals.failed,
            cancelled: st.totals.cancelled,
            average_run_ms,
        }
    }

    /// Cancel queued tasks, signal running ones, and stop the workers.
    pub async fn shutdown(&self) {
        let queued: Vec<TaskHandle> = {
            let mut st = self.inner.lock();
            st.shutdown = true;
            for record in st.tasks.values() {
                if record.state == TaskState::Running {
                    record.cancel.cancel();
                }
            }
            let mut ids: Vec<TaskId> = st.queues.values().flatten().copied().collect();
            ids.sort_unstable();
            ids.into_iter()
                .filter_map(|id| st.tasks.get(&id).map(|r| TaskHandle { id, kind: r.kind }))
                .collect()
        };
        for handle in queued {
            let _ = self.cancel(handle);
        }
        self.inner.notify.notify_waiters();

        let workers = std::mem::take(&mut *self.inner.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for worker in workers {
            let _ = worker.await;
        }
        tracing::debug!("scheduler stopped");
    }
}

async fn worker_loop(inner: Arc<Inner>) {
    loop {
        let notified = inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let next = {
            let pressure = inner.pressure();
            let mut st = inner.lock();
            if st.shutdown {
                return;
            }
            st.pick(inner.fairness_limit, pressure)
        };

        match next {
            Some(dispatch) => run(&inner, dispatch).await,
            None => {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep(IDLE_RECHECK) => {}
                }
            }
        }
    }
}

async fn run(inner: &Arc<Inner>, dispatch: Dispatch) {
    let Dispatch {
        handle,
        parent,
        cancel,
        job,
    } = dispatch;

    tracing::debug!(task_id = handle.id, kind = %handle.kind, "task started");
    inner.emit(TaskEvent {
        task: handle.id,
        kind: handle.kind,
        state: TaskState::Running,
        progress: None,
        detail: None,
        parent,
    });

    let ctx = TaskContext {
        handle,
        cancel,
        scheduler: Scheduler {
            inner: Arc::clone(inner),
        },
    };
    let started = Instant::now();
    let result = match tokio::spawn(job(ctx)).await {
        Ok(result) => result,
        Err(e) => Err(Error::CorruptState(format!("task panicked: {e}"))),
    };
    inner.finish(handle, parent, result, started.elapsed());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    use crate::governor::testing::FixedSampler;
    use crate::config::ResourcesConfig;
    use hearth_core::embedding::HashingEmbedder;
    use hearth_core::index::flat::FlatIndex;

    fn config(workers: usize, fairness: usize) -> SchedulerConfig {
        SchedulerConfig {
            max_workers: workers,
            fairness_limit: fairness,
            history_limit: 1000,
            max_queue: 100,
        }
    }

    fn hits() -> TaskResult {
        Ok(TaskOutput::Hits(Vec::new()))
    }

    /// Occupy the single worker until the returned sender fires.
    fn block_worker(s: &Scheduler) -> (TaskHandle, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel::<()>();
        let handle = s
            .submit(TaskKind::Generate, move |ctx| async move {
                tokio::select! {
                    _ = rx => {}
                    _ = ctx.cancel_token().cancelled() => {}
                }
                hits()
            })
            .unwrap();
        (handle, tx)
    }

    async fn wait_until_running(s: &Scheduler, handle: TaskHandle) {
        for _ in 0..200 {
            if s.status(handle).unwrap() == TaskState::Running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task never started");
    }

    #[tokio::test]
    async fn runs_a_task_to_completion() {
        let s = Scheduler::start(&config(2, 4), None);
        let mut events = s.subscribe();
        let h = s.submit(TaskKind::Retrieve, |_ctx| async { hits() }).unwrap();
        assert!(matches!(s.wait(h).await, Ok(TaskOutput::Hits(_))));
        assert_eq!(s.status(h).unwrap(), TaskState::Done);

        let mut seen = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if ev.task == h.id {
                seen.push(ev.state);
            }
        }
        assert_eq!(seen, vec![TaskState::Queued, TaskState::Running, TaskState::Done]);
        s.shutdown().await;
    }

    #[tokio::test]
    async fn failures_are_observable() {
        let s = Scheduler::start(&config(1, 4), None);
        let h = s
            .submit(TaskKind::Ingest, |_ctx| async {
                Err(Error::CorruptInput("bad bytes".into()))
            })
            .unwrap();
        assert!(matches!(s.wait(h).await, Err(Error::CorruptInput(_))));
        assert_eq!(s.status(h).unwrap(), TaskState::Failed);
        s.shutdown().await;
    }

    #[tokio::test]
    async fn queued_task_cancelled_never_runs() {
        let s = Scheduler::start(&config(1, 4), None);
        let (blocker, release) = block_worker(&s);
        wait_until_running(&s, blocker).await;

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let h = s
            .submit(TaskKind::Generate, move |_ctx| async move {
                flag.store(true, Ordering::SeqCst);
                hits()
            })
            .unwrap();
        assert_eq!(s.cancel(h).unwrap(), TaskState::Cancelled);
        assert_eq!(s.status(h).unwrap(), TaskState::Cancelled);

        let _ = release.send(());
        s.wait(blocker).await.unwrap();
        assert_eq!(s.wait(h).await.unwrap_err(), Error::Cancelled);
        assert!(!ran.load(Ordering::SeqCst));
        s.shutdown().await;
    }

    #[tokio::test]
    async fn running_task_observes_cancellation() {
        let s = Scheduler::start(&config(1, 4), None);
        let h = s
            .submit(TaskKind::Generate, |ctx| async move {
                ctx.cancel_token().cancelled().await;
                ctx.check_cancelled()?;
                hits()
            })
            .unwrap();
        wait_until_running(&s, h).await;
        assert_eq!(s.cancel(h).unwrap(), TaskState::Running);
        assert_eq!(s.wait(h).await.unwrap_err(), Error::Cancelled);
        assert_eq!(s.status(h).unwrap(), TaskState::Cancelled);
        // cancelling a finished task changes nothing
        assert_eq!(s.cancel(h).unwrap(), TaskState::Cancelled);
        s.shutdown().await;
    }

    #[tokio::test]
    async fn cheap_work_jumps_ahead_within_fairness_limit() {
        let s = Scheduler::start(&config(1, 2), None);
        let (blocker, release) = block_worker(&s);
        wait_until_running(&s, blocker).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let record = |label: &'static str| {
            let order = order.clone();
            move |_ctx: TaskContext| async move {
                order.lock().unwrap().push(label);
                hits()
            }
        };
        s.submit(TaskKind::Ingest, record("ingest")).unwrap();
        let mut last = None;
        for label in ["r1", "r2", "r3", "r4"] {
            last = Some(s.submit(TaskKind::Retrieve, record(label)).unwrap());
        }

        let _ = release.send(());
        s.wait(last.unwrap()).await.unwrap();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["r1", "r2", "ingest", "r3", "r4"]
        );
        s.shutdown().await;
    }

    #[tokio::test]
    async fn one_task_per_heavy_lane() {
        let s = Scheduler::start(&config(4, 4), None);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for kind in [TaskKind::Ingest, TaskKind::Embed, TaskKind::Ingest] {
            let running = running.clone();
            let peak = peak.clone();
            handles.push(
                s.submit(kind, move |_ctx| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    hits()
                })
                .unwrap(),
            );
        }
        for h in handles {
            s.wait(h).await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        s.shutdown().await;
    }

    #[tokio::test]
    async fn children_record_their_parent() {
        let s = Scheduler::start(&config(2, 4), None);
        let (tx, rx) = oneshot::channel();
        let parent = s
            .submit(TaskKind::Ingest, move |ctx| async move {
                let child = ctx.spawn_child(TaskKind::Embed, |_ctx| async { hits() })?;
                let _ = tx.send(child);
                hits()
            })
            .unwrap();
        s.wait(parent).await.unwrap();
        let child = rx.await.unwrap();
        s.wait(child).await.unwrap();
        let info = s.tasks().into_iter().find(|t| t.handle == child).unwrap();
        assert_eq!(info.parent, Some(parent.id));
        s.shutdown().await;
    }

    #[tokio::test]
    async fn history_is_pruned() {
        let s = Scheduler::start(
            &SchedulerConfig {
                history_limit: 2,
                ..config(1, 4)
            },
            None,
        );
        let mut handles = Vec::new();
        for _ in 0..4 {
            let h = s.submit(TaskKind::Retrieve, |_ctx| async { hits() }).unwrap();
            s.wait(h).await.unwrap();
            handles.push(h);
        }
        assert!(matches!(s.status(handles[0]), Err(Error::NotFound(_))));
        assert_eq!(s.status(handles[3]).unwrap(), TaskState::Done);
        assert!(matches!(s.wait(handles[0]).await, Err(Error::NotFound(_))));
        assert!(s.wait(handles[3]).await.is_ok());
        s.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_rejects_new_work() {
        let s = Scheduler::start(
            &SchedulerConfig {
                max_queue: 2,
                ..config(1, 4)
            },
            None,
        );
        let (blocker, release) = block_worker(&s);
        wait_until_running(&s, blocker).await;

        let a = s.submit(TaskKind::Generate, |_ctx| async { hits() }).unwrap();
        let b = s.submit(TaskKind::Retrieve, |_ctx| async { hits() }).unwrap();
        let err = s.submit(TaskKind::Retrieve, |_ctx| async { hits() }).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded(_)));
        assert!(err.to_string().contains("queue is full"));
        assert_eq!(s.tasks().len(), 3);

        // cancelling frees a slot
        s.cancel(a).unwrap();
        let c = s.submit(TaskKind::Retrieve, |_ctx| async { hits() }).unwrap();

        let _ = release.send(());
        for h in [blocker, b, c] {
            s.wait(h).await.unwrap();
        }
        s.shutdown().await;
    }

    #[tokio::test]
    async fn follow_up_tasks_bypass_the_queue_bound() {
        let s = Scheduler::start(
            &SchedulerConfig {
                max_queue: 1,
                ..config(1, 4)
            },
            None,
        );
        let (tx, rx) = oneshot::channel();
        let parent = s
            .submit(TaskKind::Ingest, move |ctx| async move {
                let first = ctx.spawn_child(TaskKind::Embed, |_ctx| async { hits() })?;
                let second = ctx.spawn_child(TaskKind::Embed, |_ctx| async { hits() })?;
                let _ = tx.send((first, second));
                hits()
            })
            .unwrap();
        s.wait(parent).await.unwrap();
        let (first, second) = rx.await.unwrap();
        s.wait(first).await.unwrap();
        s.wait(second).await.unwrap();
        s.shutdown().await;
    }

    #[tokio::test]
    async fn stats_count_outcomes() {
        let s = Scheduler::start(&config(1, 4), None);
        assert_eq!(s.stats(), SchedulerStats::default());

        let ok = s.submit(TaskKind::Retrieve, |_ctx| async { hits() }).unwrap();
        s.wait(ok).await.unwrap();
        let bad = s
            .submit(TaskKind::Ingest, |_ctx| async {
                Err(Error::CorruptInput("bad bytes".into()))
            })
            .unwrap();
        let _ = s.wait(bad).await;

        let (blocker, release) = block_worker(&s);
        wait_until_running(&s, blocker).await;
        let queued = s.submit(TaskKind::Generate, |_ctx| async { hits() }).unwrap();
        let mid = s.stats();
        assert_eq!(mid.queued, 1);
        assert_eq!(mid.running, 1);

        s.cancel(queued).unwrap();
        let _ = release.send(());
        s.wait(blocker).await.unwrap();

        let stats = s.stats();
        assert_eq!(stats.done, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.queued, 0);
        assert!(stats.average_run_ms.is_some());
        s.shutdown().await;
    }

    #[tokio::test]
    async fn hard_pressure_rejects_ingestion_without_a_task() {
        let index = Arc::new(FlatIndex::new(Arc::new(HashingEmbedder::new(16)), 10));
        let resources = ResourcesConfig {
            memory_ceiling_mb: 100,
            memory_soft_threshold_mb: 50,
            ..ResourcesConfig::default()
        };
        let governor = Arc::new(ResourceGovernor::new(
            &resources,
            Arc::new(FixedSampler::mb(500)),
            index,
        ));
        let s = Scheduler::start(&config(1, 4), Some(governor));

        let err = s.submit(TaskKind::Ingest, |_ctx| async { hits() }).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded(_)));
        assert!(s.tasks().is_empty());

        let h = s.submit(TaskKind::Retrieve, |_ctx| async { hits() }).unwrap();
        s.wait(h).await.unwrap();
        s.shutdown().await;
    }

    #[tokio::test]
    async fn deferred_ingestion_waits_for_pressure_to_clear() {
        let index = Arc::new(FlatIndex::new(Arc::new(HashingEmbedder::new(16)), 10));
        let resources = ResourcesConfig {
            memory_ceiling_mb: 100,
            memory_soft_threshold_mb: 50,
            ..ResourcesConfig::default()
        };
        let sampler = Arc::new(FixedSampler::mb(75));
        let governor = Arc::new(ResourceGovernor::new(&resources, sampler.clone(), index));
        let s = Scheduler::start(&config(1, 4), Some(governor.clone()));

        let h = s.submit(TaskKind::Ingest, |_ctx| async { hits() }).unwrap();
        assert!(s.tasks()[0].deferred);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(s.status(h).unwrap(), TaskState::Queued);

        sampler.set_mb(10);
        governor.relieve();
        s.wait(h).await.unwrap();
        assert_eq!(s.status(h).unwrap(), TaskState::Done);
        s.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_queued_work() {
        let s = Scheduler::start(&config(1, 4), None);
        let (blocker, _release) = block_worker(&s);
        wait_until_running(&s, blocker).await;
        let queued = s.submit(TaskKind::Generate, |_ctx| async { hits() }).unwrap();

        // the blocker returns once shutdown signals it
        s.shutdown().await;
        assert_eq!(s.status(blocker).unwrap(), TaskState::Done);
        assert_eq!(s.status(queued).unwrap(), TaskState::Cancelled);
        assert!(s.submit(TaskKind::Retrieve, |_ctx| async { hits() }).is_err());
    }
}
