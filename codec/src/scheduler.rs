//! Task registry and poller.
//!
//! The scheduler is the only writer of task state. Sessions submit work
//! through it, handles read through it, and [`Scheduler::poll`] moves tasks
//! from pending to finished while transferring result bytes out of the
//! engine.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};

use crate::sys::{self, NativeEngine, NativeHandle, NativeTaskIndex, NativeTaskStatus};
use crate::task::{TaskHandle, TaskId, TaskStatus};
use crate::{CodecError, PollStrategy, Result, SchedulerConfig, TextureRef};

/// Identity of a codec session registered with a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SessionId(u64);

/// A registered session, shared by the session and the handles of its tasks.
///
/// The closed flag lives here rather than in the registry so that handles
/// outliving their records can still tell a closed session from a disposal.
#[derive(Debug, Clone)]
pub(crate) struct SessionToken {
    id: SessionId,
    closed: Arc<AtomicBool>,
}

impl SessionToken {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Counts of what a single poll pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Tasks that finished successfully and received their data.
    pub completed: usize,
    /// Tasks that finished with an error.
    pub failed: usize,
    /// Finished native tasks released without a live record (disposed early or session closed).
    pub released: usize,
}

impl PollReport {
    /// Returns `true` if the pass resolved nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.completed == 0 && self.failed == 0 && self.released == 0
    }
}

#[derive(Debug)]
enum TaskState {
    Pending,
    Succeeded(Arc<Vec<u8>>),
    Failed(String),
}

#[derive(Debug)]
struct TaskRecord {
    session: SessionId,
    state: TaskState,
}

#[derive(Debug, Clone, Copy)]
struct QueuedTask {
    id: TaskId,
    native: NativeTaskIndex,
}

#[derive(Debug)]
struct Registry {
    next_task: u64,
    next_session: u64,
    tasks: HashMap<TaskId, TaskRecord>,
    queue: VecDeque<QueuedTask>,
}

impl Registry {
    fn new() -> Self {
        Self {
            next_task: 1,
            next_session: 1,
            tasks: HashMap::new(),
            queue: VecDeque::new(),
        }
    }
}

#[derive(Debug)]
struct Inner {
    engine: Arc<dyn NativeEngine>,
    config: SchedulerConfig,
    registry: Mutex<Registry>,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().expect("task registry mutex poisoned")
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let registry = self
            .registry
            .get_mut()
            .expect("task registry mutex poisoned");
        release_queue(self.engine.as_ref(), registry);
    }
}

/// Owns every asynchronous codec task of a process.
///
/// Construct one per engine and pass it to every session. Cloning is cheap and
/// yields another reference to the same registry. Call [`Scheduler::tick`] once
/// per host frame; no call on the scheduler blocks.
///
/// The scheduler does not serialize ticks against each other: the host must
/// not tick from two threads at once.
#[derive(Debug, Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Creates a scheduler over `engine`.
    ///
    /// `config` is fitted to the engine first: `max_in_flight` is lowered to
    /// the engine's [task capacity](NativeEngine::task_capacity), and engines
    /// that [clear in order](NativeEngine::clears_in_order) always get
    /// [`PollStrategy::InOrder`].
    pub fn new(engine: Arc<dyn NativeEngine>, config: SchedulerConfig) -> Self {
        let config = fit_to_engine(engine.as_ref(), config);
        Self {
            inner: Arc::new(Inner {
                engine,
                config,
                registry: Mutex::new(Registry::new()),
            }),
        }
    }

    /// Returns the scheduler settings.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Returns the native engine shared by all sessions of this scheduler.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn NativeEngine> {
        &self.inner.engine
    }

    /// Number of submitted tasks the engine has not resolved yet.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.registry().queue.len()
    }

    /// Number of task records that have not been disposed.
    #[must_use]
    pub fn live_tasks(&self) -> usize {
        self.inner.registry().tasks.len()
    }

    /// Runs one frame of work: [`kick`](Self::kick) followed by [`poll`](Self::poll).
    pub fn tick(&self) -> PollReport {
        self.kick();
        self.poll()
    }

    /// Signals the engine to make progress on queued work.
    ///
    /// Engines bound to a graphics context must receive this call on the thread
    /// that owns the context. Hosts in that situation call `kick` from their
    /// render thread and [`poll`](Self::poll) from their main loop.
    pub fn kick(&self) {
        self.inner.engine.kick();
    }

    /// Resolves finished tasks and moves their results into owned buffers.
    pub fn poll(&self) -> PollReport {
        let mut registry = self.inner.registry();
        let report = self.resolve_finished(&mut registry);
        if !report.is_empty() {
            debug!(
                "poll: {} completed, {} failed, {} released, {} in flight",
                report.completed,
                report.failed,
                report.released,
                registry.queue.len()
            );
        }
        report
    }

    /// Drops every task record and releases the native tasks that already finished.
    ///
    /// Outstanding handles report their task as disposed afterwards. Native
    /// tasks still running stay queued without a record; later polls release
    /// them once they finish, and they keep counting towards
    /// [`in_flight`](Self::in_flight) until then. Task identities keep
    /// increasing; none is handed out twice.
    pub fn reset(&self) {
        let mut registry = self.inner.registry();
        registry.tasks.clear();
        let report = self.resolve_finished(&mut registry);
        debug!(
            "task registry reset: {} native task(s) released, {} still running",
            report.released,
            registry.queue.len()
        );
    }

    fn resolve_finished(&self, registry: &mut Registry) -> PollReport {
        let engine = self.inner.engine.as_ref();
        let mut report = PollReport::default();

        match self.inner.config.strategy {
            PollStrategy::InOrder => {
                while let Some(entry) = registry.queue.front().copied() {
                    let Some(outcome) = Outcome::of(engine.query_async(entry.native)) else {
                        break;
                    };
                    registry.queue.pop_front();
                    resolve(engine, registry, entry, outcome, &mut report);
                }
            }
            PollStrategy::FullScan => {
                let mut position = 0;
                while let Some(entry) = registry.queue.get(position).copied() {
                    let Some(outcome) = Outcome::of(engine.query_async(entry.native)) else {
                        position += 1;
                        continue;
                    };
                    registry.queue.remove(position);
                    resolve(engine, registry, entry, outcome, &mut report);
                }
            }
        }
        report
    }

    pub(crate) fn register_session(&self) -> SessionToken {
        let mut registry = self.inner.registry();
        let id = SessionId(registry.next_session);
        registry.next_session += 1;
        SessionToken {
            id,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Force-resolves every pending task of a session that is being torn down.
    ///
    /// Queue entries stay so the poller can still release their native slots in
    /// order; their results are discarded. Finished records keep their data.
    pub(crate) fn close_session(&self, session: &SessionToken) {
        session.closed.store(true, Ordering::Release);
        let mut registry = self.inner.registry();
        let before = registry.tasks.len();
        registry.tasks.retain(|_, record| {
            record.session != session.id || !matches!(record.state, TaskState::Pending)
        });
        let dropped = before - registry.tasks.len();
        if dropped > 0 {
            debug!("session closed with {dropped} pending task(s); they are resolved as closed");
        }
    }

    pub(crate) fn submit(
        &self,
        session: &SessionToken,
        handle: NativeHandle,
        texture: &TextureRef,
        force_keyframe: bool,
    ) -> Result<TaskHandle> {
        let engine = self.inner.engine.as_ref();
        let mut registry = self.inner.registry();

        let limit = self.inner.config.max_in_flight;
        if registry.queue.len() >= limit {
            return Err(CodecError::QueueFull(limit));
        }

        let native = engine
            .enqueue_async(
                handle,
                texture.id,
                texture.width,
                texture.height,
                force_keyframe,
            )
            .ok_or_else(|| {
                CodecError::Call(
                    sys::take_error(engine, Some(handle))
                        .unwrap_or_else(|| "engine rejected the encode task".into()),
                )
            })?;

        let id = TaskId::new(registry.next_task);
        registry.next_task += 1;
        registry.tasks.insert(
            id,
            TaskRecord {
                session: session.id,
                state: TaskState::Pending,
            },
        );
        registry.queue.push_back(QueuedTask { id, native });
        debug!("task {id} queued as native task {native}");

        Ok(TaskHandle::new(id, session.clone(), self.clone()))
    }

    pub(crate) fn status(&self, id: TaskId) -> TaskStatus {
        match self.inner.registry().tasks.get(&id).map(|record| &record.state) {
            None => TaskStatus::Disposed,
            Some(TaskState::Pending) => TaskStatus::Pending,
            Some(TaskState::Succeeded(_)) => TaskStatus::Succeeded,
            Some(TaskState::Failed(_)) => TaskStatus::Failed,
        }
    }

    pub(crate) fn error(&self, id: TaskId, session: &SessionToken) -> Option<String> {
        match self.inner.registry().tasks.get(&id).map(|record| &record.state) {
            Some(TaskState::Failed(message)) => Some(message.clone()),
            Some(TaskState::Pending | TaskState::Succeeded(_)) => None,
            None if session.is_closed() => Some("codec session was closed".into()),
            None => Some("task was disposed".into()),
        }
    }

    pub(crate) fn data(&self, id: TaskId) -> Result<Arc<Vec<u8>>> {
        match self.inner.registry().tasks.get(&id).map(|record| &record.state) {
            Some(TaskState::Succeeded(data)) => Ok(Arc::clone(data)),
            Some(TaskState::Pending) => Err(CodecError::InvalidState(format!(
                "task {id} is still pending"
            ))),
            Some(TaskState::Failed(message)) => Err(CodecError::InvalidState(format!(
                "task {id} failed: {message}"
            ))),
            None => Err(CodecError::InvalidState(format!(
                "task {id} does not exist or was disposed"
            ))),
        }
    }

    pub(crate) fn dispose(&self, id: TaskId) {
        if self.inner.registry().tasks.remove(&id).is_some() {
            debug!("task {id} disposed");
        }
    }
}

/// A native task that is no longer pending.
enum Outcome {
    Succeeded { encoded_size: usize },
    Failed(String),
}

impl Outcome {
    fn of(status: NativeTaskStatus) -> Option<Self> {
        match status {
            NativeTaskStatus::Pending => None,
            NativeTaskStatus::Succeeded { encoded_size } => Some(Self::Succeeded { encoded_size }),
            NativeTaskStatus::Failed(message) => Some(Self::Failed(message)),
        }
    }
}

fn resolve(
    engine: &dyn NativeEngine,
    registry: &mut Registry,
    entry: QueuedTask,
    outcome: Outcome,
    report: &mut PollReport,
) {
    let Some(record) = registry.tasks.get_mut(&entry.id) else {
        engine.clear_async(entry.native);
        report.released += 1;
        debug!("native task {} released without a live record", entry.native);
        return;
    };

    let result = match outcome {
        Outcome::Succeeded { encoded_size } => transfer(engine, entry.native, encoded_size),
        Outcome::Failed(message) => {
            engine.clear_async(entry.native);
            Err(message)
        }
    };

    match result {
        Ok(data) => {
            debug!("task {} done, {} bytes", entry.id, data.len());
            record.state = TaskState::Succeeded(data);
            report.completed += 1;
        }
        Err(message) => {
            debug!("task {} failed: {message}", entry.id);
            record.state = TaskState::Failed(message);
            report.failed += 1;
        }
    }
}

/// Copies a finished result out of the engine and releases the engine copy.
///
/// The engine buffer is not touched again after this returns, and the owned
/// buffer is never written again.
fn transfer(
    engine: &dyn NativeEngine,
    index: NativeTaskIndex,
    encoded_size: usize,
) -> std::result::Result<Arc<Vec<u8>>, String> {
    let mut owned = vec![0; encoded_size];
    let copied = engine.copy_async_result(index, &mut owned);
    engine.clear_async(index);

    if copied == encoded_size {
        Ok(Arc::new(owned))
    } else {
        Err(format!(
            "engine reported {encoded_size} encoded bytes but provided {copied}"
        ))
    }
}

fn fit_to_engine(engine: &dyn NativeEngine, mut config: SchedulerConfig) -> SchedulerConfig {
    if let Some(capacity) = engine.task_capacity()
        && config.max_in_flight > capacity
    {
        debug!(
            "max_in_flight lowered from {} to the engine capacity of {capacity}",
            config.max_in_flight
        );
        config.max_in_flight = capacity;
    }
    if engine.clears_in_order() && config.strategy == PollStrategy::FullScan {
        warn!("engine clears native tasks in submission order; polling in order instead of scanning");
        config.strategy = PollStrategy::InOrder;
    }
    config
}

/// Drops the whole queue at teardown, when no later poll can release anything.
fn release_queue(engine: &dyn NativeEngine, registry: &mut Registry) {
    let mut stuck = 0;
    for entry in registry.queue.drain(..) {
        if engine.query_async(entry.native) == NativeTaskStatus::Pending {
            stuck += 1;
        } else {
            engine.clear_async(entry.native);
        }
    }
    if stuck > 0 {
        warn!("{stuck} native task(s) were still running when the task queue was released");
    }
}
