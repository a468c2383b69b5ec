//! Multi-stage pipelines
//!
//! A [`Pipeline`] chains work pools that share one [`FaultCoordinator`]:
//! every item a stage processes successfully is enqueued into the next
//! stage, and a fault in any stage aborts all of them.
//!
//! ```text
//!  enqueue ──► stage 0 ──ok──► stage 1 ──ok──► … ──► stage n (dropped)
//!                 │               │                    │
//!                 └───────────────┴──── error ─────────┘
//!                                  ▼
//!                          FaultCoordinator ──► shutdown_now() on every stage
//! ```
//!
//! Graceful shutdown cascades: only the first stage is closed by
//! [`Pipeline::shutdown`], and each downstream stage is closed by
//! [`Pipeline::await_termination`] once its upstream stage has terminated.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{DispatchError, Fault, Result};
use crate::fault::FaultCoordinator;
use crate::pool::{
    deadline_after, CompletionHook, PoolConfig, PoolState, PoolStats, Processors, WorkPool,
};

/// Ordered chain of work pools with shared fault coordination
pub struct Pipeline<T> {
    stages: Vec<WorkPool<T>>,
    coordinator: FaultCoordinator,
}

impl<T> Pipeline<T>
where
    T: Send + Sync + 'static,
{
    /// Chain already running pools
    ///
    /// Every pool must report to the same fault coordinator and may belong
    /// to one pipeline only.
    pub fn new(stages: Vec<WorkPool<T>>) -> Result<Self> {
        let Some(first) = stages.first() else {
            return Err(DispatchError::invalid("a pipeline needs at least one stage"));
        };
        let coordinator = first.coordinator().clone();

        for (index, stage) in stages.iter().enumerate() {
            if !stage.coordinator().ptr_eq(&coordinator) {
                return Err(DispatchError::invalid(format!(
                    "stage {index} does not share the pipeline's fault coordinator"
                )));
            }
            if stage.is_chained() {
                return Err(DispatchError::invalid(format!(
                    "stage {index} already forwards to another pool"
                )));
            }
            if stages[..index].iter().any(|earlier| earlier.ptr_eq(stage)) {
                return Err(DispatchError::invalid(format!(
                    "stage {index} appears more than once"
                )));
            }
        }

        for pair in stages.windows(2) {
            let next = pair[1].clone();
            let hook: CompletionHook<T> = Arc::new(move |item: T| {
                let next = next.clone();
                async move {
                    match next.submit(item).await {
                        Ok(()) => Ok(()),
                        // Forced stop downstream: account the item there
                        Err(item) if next.is_halted() => {
                            next.stash(item);
                            Ok(())
                        }
                        Err(_) => Err(DispatchError::Rejected.into()),
                    }
                }
                .boxed()
            });
            pair[0].set_completion(hook);
        }

        info!(stages = stages.len(), "Pipeline assembled");
        Ok(Self {
            stages,
            coordinator,
        })
    }

    /// Build a pipeline whose stages are started with one new coordinator
    pub fn builder() -> PipelineBuilder<T> {
        PipelineBuilder::new()
    }

    /// Submit an item to the first stage
    pub async fn enqueue(&self, item: T) -> Result<()> {
        self.first().enqueue(item).await
    }

    /// Close the first stage; downstream stages drain in turn
    pub fn shutdown(&self) {
        self.first().shutdown();
    }

    /// Forcefully shut down every stage
    pub fn shutdown_now(&self) {
        for stage in &self.stages {
            stage.shutdown_now();
        }
    }

    /// Terminate the stages in order within one shared time budget
    ///
    /// Returns `Ok(false)` as soon as a stage does not terminate in time.
    /// When a fault occurred every stage is still awaited, then the first
    /// error observed is returned.
    pub async fn await_termination(&self, timeout: Duration) -> Result<bool> {
        let deadline = deadline_after(timeout);
        let mut first_error = None;

        for (index, stage) in self.stages.iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match stage.await_termination(remaining).await {
                Ok(true) => debug!(stage = index, "Stage terminated"),
                Ok(false) => {
                    debug!(stage = index, "Stage termination timed out");
                    return Ok(false);
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }

    /// Whether every stage terminated
    pub fn is_terminated(&self) -> bool {
        self.stages.iter().all(WorkPool::is_terminated)
    }

    /// Whether any stage aborted
    pub fn is_aborted(&self) -> bool {
        self.stages.iter().any(WorkPool::is_aborted)
    }

    /// Aggregated lifecycle state
    pub fn state(&self) -> PoolState {
        let states: Vec<PoolState> = self.stages.iter().map(WorkPool::state).collect();
        if states.iter().all(|state| *state == PoolState::Terminated) {
            PoolState::Terminated
        } else if states.contains(&PoolState::Aborting) || self.coordinator.is_exhausted() {
            PoolState::Aborting
        } else if states.iter().any(|state| *state != PoolState::Running) {
            PoolState::Draining
        } else {
            PoolState::Running
        }
    }

    /// The captured fault, if any
    pub fn fault(&self) -> Option<Fault> {
        self.coordinator.fault()
    }

    /// Take the items drained by forceful shutdown, stage by stage
    pub fn take_unprocessed(&self) -> Vec<Vec<T>> {
        self.stages.iter().map(WorkPool::take_unprocessed).collect()
    }

    /// Per-stage snapshots
    pub fn stats(&self) -> Vec<PoolStats> {
        self.stages.iter().map(WorkPool::stats).collect()
    }

    /// The stages, in order
    pub fn stages(&self) -> &[WorkPool<T>] {
        &self.stages
    }

    /// The shared fault coordinator
    pub fn coordinator(&self) -> &FaultCoordinator {
        &self.coordinator
    }

    fn first(&self) -> &WorkPool<T> {
        // Construction guarantees at least one stage
        &self.stages[0]
    }
}

impl<T> fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

/// Builder starting every stage with one shared coordinator
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use dispatch::{processor_fn, Pipeline, PoolConfig, Processors};
///
/// # #[tokio::main]
/// # async fn main() -> dispatch::Result<()> {
/// let pipeline = Pipeline::builder()
///     .stage(
///         PoolConfig::fixed(2).with_name("parse"),
///         Processors::shared(processor_fn(|_: &u32| async { Ok::<_, anyhow::Error>(()) })),
///     )
///     .stage(
///         PoolConfig::balanced(1, 4).with_name("store"),
///         Processors::shared(processor_fn(|_: &u32| async { Ok::<_, anyhow::Error>(()) })),
///     )
///     .build()?;
///
/// pipeline.enqueue(7).await?;
/// assert!(pipeline.await_termination(Duration::from_secs(5)).await?);
/// # Ok(())
/// # }
/// ```
pub struct PipelineBuilder<T> {
    coordinator: FaultCoordinator,
    stages: Vec<(PoolConfig, Processors<T>)>,
}

impl<T> Default for PipelineBuilder<T> {
    fn default() -> Self {
        Self {
            coordinator: FaultCoordinator::new(),
            stages: Vec::new(),
        }
    }
}

impl<T> PipelineBuilder<T>
where
    T: Send + Sync + 'static,
{
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage
    pub fn stage(mut self, config: PoolConfig, processors: Processors<T>) -> Self {
        self.stages.push((config, processors));
        self
    }

    /// Use an existing coordinator instead of a new one
    pub fn with_coordinator(mut self, coordinator: FaultCoordinator) -> Self {
        self.coordinator = coordinator;
        self
    }

    /// Register a listener notified with the pipeline's fault
    pub fn on_fault<F>(self, listener: F) -> Self
    where
        F: Fn(&Fault) + Send + Sync + 'static,
    {
        self.coordinator.register_listener(listener);
        self
    }

    /// Validate every stage, then start them
    pub fn build(self) -> Result<Pipeline<T>> {
        if self.stages.is_empty() {
            return Err(DispatchError::invalid("a pipeline needs at least one stage"));
        }
        for (index, (config, processors)) in self.stages.iter().enumerate() {
            config
                .validate()
                .and_then(|()| processors.check_capacity(config.max_workers))
                .map_err(|e| DispatchError::invalid(format!("stage {index}: {e}")))?;
        }

        let mut pools: Vec<WorkPool<T>> = Vec::with_capacity(self.stages.len());
        for (config, processors) in self.stages {
            match WorkPool::with_coordinator(config, processors, self.coordinator.clone()) {
                Ok(pool) => pools.push(pool),
                Err(e) => {
                    for pool in &pools {
                        pool.shutdown_now();
                    }
                    return Err(e);
                }
            }
        }

        Pipeline::new(pools)
    }
}
