//! Work pool: a queue, a set of workers, and an optional load controller

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::config::PoolConfig;
use super::processor::{Processor, Processors};
use super::queue::{Offer, WorkQueue};
use super::worker::Worker;
use crate::balance::{ElasticPool, LoadController};
use crate::error::{DispatchError, Fault, Result};
use crate::fault::{ComponentId, FaultCoordinator};

/// Invoked with every successfully processed item
pub(crate) type CompletionHook<T> =
    Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Lifecycle of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Accepting and processing items
    Running,
    /// Shutdown requested; queued items are still processed
    Draining,
    /// Forceful shutdown or fault; workers stop after their current item
    Aborting,
    /// Every worker exited and the pool was finalized
    Terminated,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Aborting => write!(f, "aborting"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Point-in-time snapshot of a pool
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStats {
    /// Pool name
    pub name: String,
    /// Current state
    pub state: PoolState,
    /// Workers currently taking items
    pub active_workers: usize,
    /// Worker slots allocated so far
    pub allocated_workers: usize,
    /// Items processed successfully
    pub processed: u64,
    /// Items buffered in the queue
    pub queued: usize,
    /// Items drained without being processed
    pub unprocessed: usize,
    /// Smoothed per-item processing time
    pub average_work_time: Duration,
}

/// `now + timeout`, saturating far in the future for huge timeouts
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

struct ControllerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub(crate) struct PoolShared<T> {
    this: Weak<PoolShared<T>>,
    id: ComponentId,
    pub(crate) config: PoolConfig,
    pub(crate) queue: WorkQueue<T>,
    pub(crate) cancel: CancellationToken,
    pub(crate) coordinator: FaultCoordinator,
    processors: Processors<T>,
    workers: RwLock<Vec<Arc<Worker<T>>>>,
    active: AtomicUsize,
    resize: Mutex<()>,
    tracker: TaskTracker,
    shutdown: AtomicBool,
    terminated: AtomicBool,
    processed: AtomicU64,
    average_work_time: AtomicU64,
    unprocessed: Mutex<Vec<T>>,
    completion: OnceLock<CompletionHook<T>>,
    controller: Mutex<Option<ControllerHandle>>,
    finalized: OnceCell<()>,
}

impl<T> PoolShared<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn push_unprocessed(&self, item: T) {
        self.unprocessed.lock().push(item);
    }

    pub(crate) fn record_completion(&self, elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::SeqCst);
        if let Some(profile) = self.config.profile {
            let sample = elapsed.as_secs_f64();
            let _ = self
                .average_work_time
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                    Some(profile.smooth(f64::from_bits(bits), sample).to_bits())
                });
        }
    }

    pub(crate) async fn hand_off(&self, item: T) -> anyhow::Result<()> {
        match self.completion.get() {
            Some(hook) => hook(item).await,
            None => Ok(()),
        }
    }

    fn worker(&self, index: usize) -> anyhow::Result<Arc<Worker<T>>> {
        if let Some(worker) = self.workers.read().get(index) {
            return Ok(Arc::clone(worker));
        }

        let mut workers = self.workers.write();
        while workers.len() <= index {
            let next = workers.len();
            let processor = self.processors.processor_for(next)?;
            debug!(pool = %self.config.name, index = next, "Worker allocated");
            workers.push(Arc::new(Worker::new(processor)));
        }
        Ok(Arc::clone(&workers[index]))
    }

    fn start_worker(&self, index: usize) -> anyhow::Result<()> {
        let Some(pool) = self.this.upgrade() else {
            anyhow::bail!("pool {} is gone", self.config.name);
        };
        let worker = self.worker(index)?;
        worker.activate();

        let span = info_span!("worker", pool = %self.config.name, index);
        self.tracker.spawn(worker.run(pool).instrument(span));
        Ok(())
    }

    fn begin_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!(pool = %self.config.name, "Shutting down");
        }
        self.queue.close();
    }

    fn shutdown_now(&self) {
        let first = !self.cancel.is_cancelled();
        // Cancel before flagging shutdown, so a rejected producer always sees the cancellation
        self.cancel.cancel();
        self.shutdown.store(true, Ordering::SeqCst);

        let drained = self.queue.drain();
        let count = drained.len();
        if count > 0 {
            self.unprocessed.lock().extend(drained);
        }
        if first {
            warn!(pool = %self.config.name, drained = count, "Shutting down now");
        }
    }

    async fn stop_controller(&self) {
        let handle = self.controller.lock().take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                warn!(pool = %self.config.name, error = %e, "Load controller task failed");
            }
        }
    }

    async fn quiesce(&self) {
        self.tracker.wait().await;
        self.stop_controller().await;
        // A grow decided just before the controller stopped may have spawned one more run
        self.tracker.wait().await;
    }

    fn distinct_processors(&self) -> Vec<Arc<dyn Processor<T>>> {
        let mut distinct: Vec<Arc<dyn Processor<T>>> = Vec::new();
        let bound = self
            .workers
            .read()
            .iter()
            .map(|worker| Arc::clone(worker.processor()))
            .collect::<Vec<_>>();
        let supplied = match &self.processors {
            Processors::PerWorker(processors) => processors.clone(),
            Processors::Shared(_) | Processors::Factory(_) => Vec::new(),
        };

        for processor in bound.into_iter().chain(supplied) {
            if !distinct.iter().any(|seen| Arc::ptr_eq(seen, &processor)) {
                distinct.push(processor);
            }
        }
        distinct
    }

    async fn finalize(&self) {
        for processor in self.distinct_processors() {
            if let Err(error) = processor.terminate().await {
                self.coordinator.handle(error);
            }
        }
        self.coordinator.remove(self.id);
        self.terminated.store(true, Ordering::SeqCst);
        info!(
            pool = %self.config.name,
            processed = self.processed.load(Ordering::SeqCst),
            unprocessed = self.unprocessed.lock().len(),
            "Pool terminated"
        );
    }
}

impl<T> ElasticPool for PoolShared<T>
where
    T: Send + Sync + 'static,
{
    fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn take_samples(&self) -> Vec<u64> {
        let active = self.active_workers();
        self.workers
            .read()
            .iter()
            .take(active)
            .filter_map(|worker| worker.take_sample())
            .collect()
    }

    fn average_work_time(&self) -> Duration {
        Duration::try_from_secs_f64(f64::from_bits(self.average_work_time.load(Ordering::SeqCst)))
            .unwrap_or(self.config.tick)
    }

    fn grow(&self) -> anyhow::Result<bool> {
        let _resize = self.resize.lock();
        let active = self.active_workers();
        if active >= self.config.max_workers || self.is_shutdown() || self.cancel.is_cancelled() {
            return Ok(false);
        }
        self.start_worker(active)?;
        self.active.store(active + 1, Ordering::SeqCst);
        debug!(pool = %self.config.name, active = active + 1, "Pool grown");
        Ok(true)
    }

    fn shrink(&self) -> anyhow::Result<bool> {
        let _resize = self.resize.lock();
        let active = self.active_workers();
        if active <= self.config.min_workers {
            return Ok(false);
        }
        let index = active - 1;
        if let Some(worker) = self.workers.read().get(index) {
            worker.deactivate();
        }
        self.active.store(index, Ordering::SeqCst);
        debug!(pool = %self.config.name, active = index, "Pool shrunk");
        Ok(true)
    }
}

/// Queue plus workers executing a [`Processor`]
///
/// Cheap to clone; all clones drive the same pool. Must be created inside a
/// Tokio runtime.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use dispatch::{processor_fn, PoolConfig, Processors, WorkPool};
///
/// # #[tokio::main]
/// # async fn main() -> dispatch::Result<()> {
/// let processor = processor_fn(|line: &String| {
///     let len = line.len();
///     async move {
///         tracing::info!(len, "Processing line");
///         Ok(())
///     }
/// });
/// let pool = WorkPool::new(PoolConfig::fixed(2), Processors::shared(processor))?;
///
/// pool.enqueue("hello".to_string()).await?;
/// assert!(pool.await_termination(Duration::from_secs(5)).await?);
/// # Ok(())
/// # }
/// ```
pub struct WorkPool<T> {
    inner: Arc<PoolShared<T>>,
}

impl<T> Clone for WorkPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> WorkPool<T>
where
    T: Send + Sync + 'static,
{
    /// Start a pool with its own fault coordinator
    pub fn new(config: PoolConfig, processors: Processors<T>) -> Result<Self> {
        Self::with_coordinator(config, processors, FaultCoordinator::new())
    }

    /// Start a pool that reports faults to `coordinator`
    pub fn with_coordinator(
        config: PoolConfig,
        processors: Processors<T>,
        coordinator: FaultCoordinator,
    ) -> Result<Self> {
        config.validate()?;
        processors.check_capacity(config.max_workers)?;
        tokio::runtime::Handle::try_current().map_err(|_| {
            DispatchError::invalid("work pools must be created inside a Tokio runtime")
        })?;

        let eager = match processors {
            Processors::Factory(_) => config.initial_workers,
            Processors::Shared(_) | Processors::PerWorker(_) => config.max_workers,
        };
        let cancel = coordinator.abort_token().child_token();
        let initial_average = config.tick.as_secs_f64();

        let inner = Arc::new_cyclic(|this| PoolShared {
            this: this.clone(),
            id: Uuid::now_v7(),
            queue: WorkQueue::new(config.synchronous),
            cancel,
            coordinator: coordinator.clone(),
            processors,
            workers: RwLock::new(Vec::with_capacity(config.max_workers)),
            active: AtomicUsize::new(0),
            resize: Mutex::new(()),
            tracker: TaskTracker::new(),
            shutdown: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            average_work_time: AtomicU64::new(initial_average.to_bits()),
            unprocessed: Mutex::new(Vec::new()),
            completion: OnceLock::new(),
            controller: Mutex::new(None),
            finalized: OnceCell::new(),
            config,
        });

        let to_fault = |e: anyhow::Error| DispatchError::ProcessingFault(Fault::new(e));
        for index in 0..eager {
            inner.worker(index).map_err(to_fault)?;
        }
        for index in 0..inner.config.initial_workers {
            inner.start_worker(index).map_err(to_fault)?;
        }
        inner
            .active
            .store(inner.config.initial_workers, Ordering::SeqCst);

        let weak = Arc::downgrade(&inner);
        coordinator.register(
            inner.id,
            Arc::new(move || {
                if let Some(pool) = weak.upgrade() {
                    pool.shutdown_now();
                }
            }),
        );

        if let Some(profile) = inner.config.profile {
            let cancel = inner.cancel.child_token();
            let controller = LoadController::new(
                profile,
                inner.config.min_workers,
                inner.config.max_workers,
                inner.config.tick,
            );
            let span = info_span!("controller", pool = %inner.config.name);
            let task = controller.spawn(
                Arc::clone(&inner) as Arc<dyn ElasticPool>,
                coordinator,
                cancel.clone(),
                span,
            );
            *inner.controller.lock() = Some(ControllerHandle { cancel, task });
        }

        info!(
            pool = %inner.config.name,
            min_workers = inner.config.min_workers,
            max_workers = inner.config.max_workers,
            initial_workers = inner.config.initial_workers,
            synchronous = inner.config.synchronous,
            balanced = inner.config.is_balanced(),
            "Pool started"
        );

        Ok(Self { inner })
    }

    /// Submit an item
    ///
    /// Waits for a ready worker in synchronous mode, re-checking shutdown and
    /// fault state once per tick. Fails with [`DispatchError::Rejected`]
    /// after shutdown or a fault.
    pub async fn enqueue(&self, item: T) -> Result<()> {
        self.submit(item).await.map_err(|_| DispatchError::Rejected)
    }

    /// Like [`enqueue`](Self::enqueue), but hands a rejected item back
    pub(crate) async fn submit(&self, item: T) -> std::result::Result<(), T> {
        let inner = &self.inner;
        let mut item = item;
        loop {
            if inner.is_shutdown()
                || inner.cancel.is_cancelled()
                || inner.coordinator.is_exhausted()
            {
                return Err(item);
            }
            item = match inner.queue.offer(item, inner.config.tick, &inner.cancel).await {
                Offer::Accepted => return Ok(()),
                Offer::Closed(item) => return Err(item),
                Offer::Pending(item) => item,
            };
        }
    }

    /// Stop accepting items; queued and in-flight items are still processed
    pub fn shutdown(&self) {
        self.inner.begin_shutdown();
    }

    /// Stop every worker after its current item and drain the queue
    ///
    /// Drained items are available through [`take_unprocessed`](Self::take_unprocessed).
    /// Idempotent.
    pub fn shutdown_now(&self) {
        self.inner.shutdown_now();
    }

    /// Shut down and wait until every worker has exited, then finalize
    ///
    /// Returns `Ok(false)` if `timeout` elapsed first, including while the
    /// fault fan-out is still running; the pool can be awaited again. After
    /// finalization the captured fault, if any, is returned as
    /// [`DispatchError::ProcessingFault`] on every call.
    pub async fn await_termination(&self, timeout: Duration) -> Result<bool> {
        let inner = &self.inner;
        let deadline = deadline_after(timeout);
        if !inner.terminated.load(Ordering::SeqCst) {
            inner.begin_shutdown();
            inner.tracker.close();

            if tokio::time::timeout_at(deadline, inner.quiesce()).await.is_err() {
                debug!(pool = %inner.config.name, ?timeout, "Termination timed out");
                return Ok(false);
            }
            inner.finalized.get_or_init(|| inner.finalize()).await;
        }

        let Some(fault) = inner.coordinator.fault() else {
            return Ok(true);
        };
        let fanned_out = inner.coordinator.wait_for_shutdown();
        if tokio::time::timeout_at(deadline, fanned_out).await.is_err() {
            debug!(pool = %inner.config.name, ?timeout, "Fault fan-out still running");
            return Ok(false);
        }
        Err(DispatchError::ProcessingFault(fault))
    }

    /// Take the items drained by forceful shutdown
    pub fn take_unprocessed(&self) -> Vec<T> {
        std::mem::take(&mut *self.inner.unprocessed.lock())
    }

    /// Whether the pool was finalized
    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Whether the pool's fault coordinator captured a fault
    pub fn is_aborted(&self) -> bool {
        self.inner.coordinator.is_exhausted()
    }

    /// Current lifecycle state
    pub fn state(&self) -> PoolState {
        let inner = &self.inner;
        if inner.terminated.load(Ordering::SeqCst) {
            PoolState::Terminated
        } else if inner.cancel.is_cancelled() {
            PoolState::Aborting
        } else if inner.is_shutdown() {
            PoolState::Draining
        } else {
            PoolState::Running
        }
    }

    /// Snapshot of the pool's counters
    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        PoolStats {
            name: inner.config.name.clone(),
            state: self.state(),
            active_workers: inner.active_workers(),
            allocated_workers: inner.workers.read().len(),
            processed: inner.processed.load(Ordering::SeqCst),
            queued: inner.queue.len(),
            unprocessed: inner.unprocessed.lock().len(),
            average_work_time: inner.average_work_time(),
        }
    }

    /// Current active worker count
    pub fn active_workers(&self) -> usize {
        self.inner.active_workers()
    }

    /// The pool's configuration
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The pool's fault coordinator
    pub fn coordinator(&self) -> &FaultCoordinator {
        &self.inner.coordinator
    }

    /// Whether both handles drive the same pool
    pub fn ptr_eq(&self, other: &WorkPool<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Install the hook receiving every processed item; only the first call wins
    pub(crate) fn set_completion(&self, hook: CompletionHook<T>) -> bool {
        self.inner.completion.set(hook).is_ok()
    }

    pub(crate) fn is_chained(&self) -> bool {
        self.inner.completion.get().is_some()
    }

    /// Whether the pool was forcefully stopped, by `shutdown_now` or a fault
    pub(crate) fn is_halted(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Record an item that was never handed to this pool's workers
    pub(crate) fn stash(&self, item: T) {
        self.inner.push_unprocessed(item);
    }
}

impl<T> fmt::Debug for WorkPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkPool")
            .field("name", &self.inner.config.name)
            .field("active", &self.inner.active.load(Ordering::SeqCst))
            .field("shutdown", &self.inner.shutdown.load(Ordering::SeqCst))
            .field("terminated", &self.inner.terminated.load(Ordering::SeqCst))
            .finish()
    }
}
