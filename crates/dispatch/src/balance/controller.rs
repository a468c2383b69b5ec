//! Periodic load controller task

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use super::profile::Profile;
use super::table::{Balancer, LoadStatus};
use crate::fault::FaultCoordinator;

/// Resizable worker set driven by a [`LoadController`]
pub(crate) trait ElasticPool: Send + Sync {
    /// Current active worker count
    fn active_workers(&self) -> usize;

    /// Take and reset the samples of every observable active worker
    fn take_samples(&self) -> Vec<u64>;

    /// Smoothed per-item processing time
    fn average_work_time(&self) -> Duration;

    /// Activate one more worker; `false` when clamped or shutting down
    fn grow(&self) -> anyhow::Result<bool>;

    /// Deactivate the highest active worker; `false` when clamped
    fn shrink(&self) -> anyhow::Result<bool>;
}

/// Feedback loop resizing one pool
pub(crate) struct LoadController {
    balancer: Balancer,
    tick: Duration,
}

impl LoadController {
    pub(crate) fn new(
        profile: Profile,
        min_workers: usize,
        max_workers: usize,
        tick: Duration,
    ) -> Self {
        Self {
            balancer: Balancer::new(profile, min_workers, max_workers),
            tick,
        }
    }

    /// Delay before the next sampling window
    ///
    /// The nominal period is stretched so that a window always spans
    /// `period` average processing times.
    pub(crate) fn delay(&self, average_work_time: Duration) -> Duration {
        let period = self.balancer.profile().period;
        let nominal = self.tick.saturating_mul(period);
        let stretched = average_work_time.saturating_mul(period);
        nominal.max(stretched)
    }

    /// Assess one window and apply the decision
    pub(crate) fn tick(&mut self, pool: &dyn ElasticPool) -> anyhow::Result<LoadStatus> {
        let active = pool.active_workers();
        let samples = pool.take_samples();
        let status = self.balancer.assess(active, &samples);

        let resized = match status {
            LoadStatus::Increase => pool.grow()?,
            LoadStatus::Decrease | LoadStatus::Idle => pool.shrink()?,
            LoadStatus::Stable | LoadStatus::Unavailable => false,
        };

        debug!(
            active,
            samples = samples.len(),
            throughput = samples.iter().sum::<u64>(),
            %status,
            resized,
            "Load assessed"
        );
        Ok(status)
    }

    pub(crate) fn spawn(
        self,
        pool: Arc<dyn ElasticPool>,
        coordinator: FaultCoordinator,
        cancel: CancellationToken,
        span: tracing::Span,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(pool, coordinator, cancel).instrument(span))
    }

    async fn run(
        mut self,
        pool: Arc<dyn ElasticPool>,
        coordinator: FaultCoordinator,
        cancel: CancellationToken,
    ) {
        debug!(profile = ?self.balancer.profile(), "Load controller started");
        loop {
            let delay = self.delay(pool.average_work_time());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            if let Err(error) = self.tick(pool.as_ref()) {
                coordinator.handle(error);
                break;
            }
        }
        debug!(table = %self.balancer.table(), "Load controller stopped");
    }
}
