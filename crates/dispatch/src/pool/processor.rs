//! Processing capability supplied by callers

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{DispatchError, Result};

/// User-supplied processing capability
///
/// `process` runs on a worker task. An error is fatal: it is handed to the
/// pool's fault coordinator and every worker of the fault domain stops.
/// `terminate` runs exactly once per distinct processor when its pool is
/// finalized, on the failure path as well.
#[async_trait]
pub trait Processor<T>: Send + Sync {
    /// Process one item
    async fn process(&self, item: &T) -> anyhow::Result<()>;

    /// Release resources held by the processor
    async fn terminate(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Processor backed by an async closure
pub struct FnProcessor<T, F> {
    f: F,
    _item: PhantomData<fn(&T)>,
}

/// Wrap an async closure as a [`Processor`]
///
/// # Example
///
/// ```
/// use dispatch::processor_fn;
///
/// let processor = processor_fn(|item: &u64| {
///     let item = *item;
///     async move {
///         anyhow::ensure!(item < 100, "item {item} out of range");
///         Ok(())
///     }
/// });
/// # let _ = processor;
/// ```
pub fn processor_fn<T, F, Fut>(f: F) -> FnProcessor<T, F>
where
    F: Fn(&T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnProcessor {
        f,
        _item: PhantomData,
    }
}

#[async_trait]
impl<T, F, Fut> Processor<T> for FnProcessor<T, F>
where
    T: Sync,
    F: Fn(&T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn process(&self, item: &T) -> anyhow::Result<()> {
        (self.f)(item).await
    }
}

/// Allocates the processor for a lazily created worker, given its index
pub type ProcessorFactory<T> =
    Box<dyn Fn(usize) -> anyhow::Result<Arc<dyn Processor<T>>> + Send + Sync>;

/// How workers obtain their processors
pub enum Processors<T> {
    /// One instance shared by every worker
    Shared(Arc<dyn Processor<T>>),
    /// One instance per worker; the pool may not grow beyond the collection
    PerWorker(Vec<Arc<dyn Processor<T>>>),
    /// Invoked once per worker, the first time its index is activated
    Factory(ProcessorFactory<T>),
}

impl<T> Processors<T> {
    /// Share one processor across all workers
    pub fn shared<P>(processor: P) -> Self
    where
        P: Processor<T> + 'static,
    {
        Self::Shared(Arc::new(processor))
    }

    /// Bind one processor to each worker
    pub fn per_worker<I, P>(processors: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Processor<T> + 'static,
    {
        Self::PerWorker(
            processors
                .into_iter()
                .map(|p| Arc::new(p) as Arc<dyn Processor<T>>)
                .collect(),
        )
    }

    /// Create processors on demand
    pub fn factory<F, P>(factory: F) -> Self
    where
        F: Fn(usize) -> anyhow::Result<P> + Send + Sync + 'static,
        P: Processor<T> + 'static,
    {
        Self::Factory(Box::new(move |index| {
            factory(index).map(|p| Arc::new(p) as Arc<dyn Processor<T>>)
        }))
    }

    /// Upper bound on the number of workers these processors can serve
    pub fn capacity(&self) -> Option<usize> {
        match self {
            Self::PerWorker(processors) => Some(processors.len()),
            Self::Shared(_) | Self::Factory(_) => None,
        }
    }

    pub(crate) fn check_capacity(&self, max_workers: usize) -> Result<()> {
        match self.capacity() {
            Some(capacity) if capacity < max_workers => Err(DispatchError::invalid(format!(
                "max_workers ({max_workers}) exceeds the {capacity} processors supplied"
            ))),
            _ => Ok(()),
        }
    }

    pub(crate) fn processor_for(&self, index: usize) -> anyhow::Result<Arc<dyn Processor<T>>> {
        match self {
            Self::Shared(processor) => Ok(Arc::clone(processor)),
            Self::PerWorker(processors) => processors
                .get(index)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no processor supplied for worker {index}")),
            Self::Factory(factory) => factory(index),
        }
    }
}

impl<T> fmt::Debug for Processors<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared(_) => f.write_str("Processors::Shared"),
            Self::PerWorker(processors) => write!(f, "Processors::PerWorker({})", processors.len()),
            Self::Factory(_) => f.write_str("Processors::Factory"),
        }
    }
}
