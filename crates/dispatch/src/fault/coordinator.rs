//! First-error-wins fault coordination
//!
//! A [`FaultCoordinator`] is shared by every component of one fault domain
//! (a pool, or every stage of a pipeline). The first call to
//! [`FaultCoordinator::handle`] captures the error, cancels the domain's abort
//! token, and fans out forceful shutdown on a separate task.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{Fault, Panicked};

/// Identity under which a component registers its shutdown action
pub type ComponentId = Uuid;

/// Observer notified with the captured fault during the fan-out
pub type FaultListener = Arc<dyn Fn(&Fault) + Send + Sync>;

/// Forceful shutdown hook registered with a coordinator
pub trait ShutdownAction: Send + Sync {
    /// Stop immediately: drain pending work and signal every worker to stop
    fn shutdown_now(&self);
}

impl<F> ShutdownAction for F
where
    F: Fn() + Send + Sync,
{
    fn shutdown_now(&self) {
        self()
    }
}

#[derive(Default)]
struct Registry {
    listeners: Vec<FaultListener>,
    actions: IndexMap<ComponentId, Arc<dyn ShutdownAction>>,
}

struct CoordinatorInner {
    registry: Mutex<Registry>,
    fault: OnceLock<Fault>,
    abort: CancellationToken,
    halted: CancellationToken,
}

/// Shared first-error-wins registry that fans out cooperative shutdown
///
/// # Example
///
/// ```
/// use dispatch::FaultCoordinator;
///
/// let coordinator = FaultCoordinator::new();
/// coordinator.register_listener(|fault| eprintln!("pipeline failed: {fault}"));
/// assert!(!coordinator.is_exhausted());
/// ```
#[derive(Clone)]
pub struct FaultCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl Default for FaultCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultCoordinator {
    /// Create a coordinator with an empty registry
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                registry: Mutex::new(Registry::default()),
                fault: OnceLock::new(),
                abort: CancellationToken::new(),
                halted: CancellationToken::new(),
            }),
        }
    }

    /// Capture an error and trigger shutdown of every registered component
    ///
    /// Only the first call has an effect; it returns `true`. The fan-out to
    /// listeners and shutdown actions runs on a separate task, so this never
    /// blocks on it.
    pub fn handle(&self, error: impl Into<anyhow::Error>) -> bool {
        let fault = Fault::new(error.into());

        let fan_out = {
            let registry = self.inner.registry.lock();
            if self.inner.fault.set(fault.clone()).is_err() {
                debug!(error = %fault, "Fault already captured, ignoring");
                return false;
            }
            FanOut {
                fault: fault.clone(),
                listeners: registry.listeners.clone(),
                actions: registry
                    .actions
                    .iter()
                    .map(|(id, action)| (*id, Arc::clone(action)))
                    .collect(),
                halted: self.inner.halted.clone(),
            }
        };

        error!(error = %fault, "An error occurred, shutting down now");
        self.inner.abort.cancel();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || fan_out.run());
            }
            Err(_) => {
                let spawned = std::thread::Builder::new()
                    .name("fault-coordinator".to_string())
                    .spawn(move || fan_out.run());
                if let Err(e) = spawned {
                    warn!(error = %e, "Failed to spawn fault fan-out thread");
                    self.inner.halted.cancel();
                }
            }
        }

        true
    }

    /// Register a component's forceful shutdown action
    pub fn register(&self, component: ComponentId, action: Arc<dyn ShutdownAction>) {
        self.inner
            .registry
            .lock()
            .actions
            .insert(component, action);
    }

    /// Register a listener notified with the captured fault
    pub fn register_listener<F>(&self, listener: F)
    where
        F: Fn(&Fault) + Send + Sync + 'static,
    {
        self.inner
            .registry
            .lock()
            .listeners
            .push(Arc::new(listener));
    }

    /// Remove a component's shutdown action
    pub fn remove(&self, component: ComponentId) {
        self.inner
            .registry
            .lock()
            .actions
            .shift_remove(&component);
    }

    /// Whether a fault has been captured
    pub fn is_exhausted(&self) -> bool {
        self.inner.fault.get().is_some()
    }

    /// The captured fault, if any
    pub fn fault(&self) -> Option<Fault> {
        self.inner.fault.get().cloned()
    }

    /// Number of registered shutdown actions
    pub fn registered(&self) -> usize {
        self.inner.registry.lock().actions.len()
    }

    /// Wait until the fan-out triggered by [`handle`](Self::handle) has run
    ///
    /// Returns immediately if no fault has been captured.
    pub async fn wait_for_shutdown(&self) {
        if self.is_exhausted() {
            self.inner.halted.cancelled().await;
        }
    }

    /// Token cancelled the moment a fault is captured
    pub fn abort_token(&self) -> CancellationToken {
        self.inner.abort.clone()
    }

    /// Whether both handles refer to the same coordinator
    pub fn ptr_eq(&self, other: &FaultCoordinator) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for FaultCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultCoordinator")
            .field("exhausted", &self.is_exhausted())
            .field("registered", &self.registered())
            .finish()
    }
}

struct FanOut {
    fault: Fault,
    listeners: Vec<FaultListener>,
    actions: Vec<(ComponentId, Arc<dyn ShutdownAction>)>,
    halted: CancellationToken,
}

/// Cancels the token when dropped, unwinding included
struct HaltOnDrop(CancellationToken);

impl Drop for HaltOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

impl FanOut {
    fn run(self) {
        let _halt = HaltOnDrop(self.halted.clone());

        for listener in &self.listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(&self.fault))) {
                let panicked = Panicked::from_payload("fault listener", &*payload);
                warn!(error = %panicked, "Fault listener failed");
            }
        }
        for (component, action) in &self.actions {
            debug!(%component, "Forcing shutdown");
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| action.shutdown_now())) {
                let panicked = Panicked::from_payload("shutdown action", &*payload);
                warn!(%component, error = %panicked, "Shutdown action failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_first_error_wins() {
        let coordinator = FaultCoordinator::new();
        assert!(coordinator.fault().is_none());

        assert!(coordinator.handle(anyhow::anyhow!("first")));
        assert!(!coordinator.handle(anyhow::anyhow!("second")));

        assert!(coordinator.is_exhausted());
        assert_eq!(coordinator.fault().unwrap().to_string(), "first");
        assert!(coordinator.abort_token().is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_handle_captures_once() {
        let coordinator = FaultCoordinator::new();
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        coordinator.register_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut handles = Vec::new();
        for i in 0..16 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.handle(anyhow::anyhow!("failure {i}"))
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        coordinator.wait_for_shutdown().await;
        assert_eq!(winners, 1);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fan_out_runs_actions_in_order() {
        let coordinator = FaultCoordinator::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            coordinator.register(
                Uuid::now_v7(),
                Arc::new(move || order.lock().push(name)),
            );
        }

        coordinator.handle(anyhow::anyhow!("boom"));
        coordinator.wait_for_shutdown().await;

        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_removed_component_is_not_shut_down() {
        let coordinator = FaultCoordinator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let id = Uuid::now_v7();

        let counter = Arc::clone(&calls);
        coordinator.register(
            id,
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(coordinator.registered(), 1);
        coordinator.remove(id);
        assert_eq!(coordinator.registered(), 0);

        coordinator.handle(anyhow::anyhow!("boom"));
        coordinator.wait_for_shutdown().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_without_fault_returns() {
        let coordinator = FaultCoordinator::new();
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            coordinator.wait_for_shutdown(),
        )
        .await
        .expect("wait should not block without a fault");
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stop_fan_out() {
        let coordinator = FaultCoordinator::new();
        let notified = Arc::new(AtomicUsize::new(0));
        let shut_down = Arc::new(AtomicUsize::new(0));

        coordinator.register_listener(|_| panic!("listener bug"));
        let counter = Arc::clone(&notified);
        coordinator.register_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&shut_down);
        coordinator.register(
            Uuid::now_v7(),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        coordinator.handle(anyhow::anyhow!("boom"));
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            coordinator.wait_for_shutdown(),
        )
        .await
        .expect("fan-out should complete despite the panic");

        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(shut_down.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.fault().unwrap().to_string(), "boom");
    }

    #[test]
    fn test_handle_outside_runtime_uses_thread() {
        let coordinator = FaultCoordinator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        coordinator.register(
            Uuid::now_v7(),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(coordinator.handle(anyhow::anyhow!("boom")));
        futures::executor::block_on(coordinator.wait_for_shutdown());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
