//! Worker execution unit

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tracing::{debug, trace};

use super::processor::Processor;
use super::work_pool::PoolShared;
use crate::error::Panicked;

/// One worker slot of a pool
///
/// Workers are never destroyed. Deactivation makes the run loop exit after
/// its in-flight item; reactivation spawns a new run that waits for the old
/// one to finish first.
pub(crate) struct Worker<T> {
    processor: Arc<dyn Processor<T>>,
    working: AtomicBool,
    observable: AtomicBool,
    window: AtomicU64,
    run_lock: tokio::sync::Mutex<()>,
}

impl<T> Worker<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn new(processor: Arc<dyn Processor<T>>) -> Self {
        Self {
            processor,
            working: AtomicBool::new(false),
            observable: AtomicBool::new(false),
            window: AtomicU64::new(0),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn processor(&self) -> &Arc<dyn Processor<T>> {
        &self.processor
    }

    pub(crate) fn is_working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    pub(crate) fn activate(&self) {
        self.working.store(true, Ordering::SeqCst);
    }

    pub(crate) fn deactivate(&self) {
        self.working.store(false, Ordering::SeqCst);
    }

    /// Count completions into the current sampling window
    pub(crate) fn feed(&self, completed: u64) {
        self.window.fetch_add(completed, Ordering::SeqCst);
        self.observable.store(true, Ordering::SeqCst);
    }

    /// Take and reset the current window, if anything was fed since the last take
    pub(crate) fn take_sample(&self) -> Option<u64> {
        if self.observable.swap(false, Ordering::SeqCst) {
            Some(self.window.swap(0, Ordering::SeqCst))
        } else {
            None
        }
    }

    pub(crate) async fn run(self: Arc<Self>, pool: Arc<PoolShared<T>>) {
        let _running = self.run_lock.lock().await;
        debug!("Worker started");

        let wait = pool.config.tick;
        while self.is_working() && !pool.cancel.is_cancelled() {
            let Some(item) = pool.queue.poll(wait, &pool.cancel).await else {
                if pool.is_shutdown() && pool.queue.is_empty() {
                    break;
                }
                self.feed(0);
                continue;
            };

            if pool.cancel.is_cancelled() {
                pool.push_unprocessed(item);
                break;
            }

            let started = Instant::now();
            let processed = AssertUnwindSafe(self.processor.process(&item))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(anyhow::Error::new(Panicked::from_payload("processor", &*payload)))
                });
            if let Err(error) = processed {
                debug!(error = %error, "Processor failed");
                pool.coordinator.handle(error);
                break;
            }
            pool.record_completion(started.elapsed());
            self.feed(1);
            trace!("Item processed");

            let forwarded = AssertUnwindSafe(pool.hand_off(item))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(anyhow::Error::new(Panicked::from_payload("completion hook", &*payload)))
                });
            if let Err(error) = forwarded {
                pool.coordinator.handle(error);
                break;
            }
        }

        debug!(working = self.is_working(), "Worker stopped");
    }
}
