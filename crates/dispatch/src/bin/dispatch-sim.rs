use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dispatch::{Pipeline, PoolConfig, Processor, Processors};
use rand::Rng;
use tokio::sync::Semaphore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Synthetic resource that serves at most `capacity` items at a time
struct Contended {
    permits: Semaphore,
    latency: Duration,
    fail_at: Option<u64>,
    seen: AtomicU64,
}

#[async_trait]
impl Processor<u64> for Contended {
    async fn process(&self, item: &u64) -> Result<()> {
        let seen = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_at == Some(seen) {
            anyhow::bail!("synthetic failure on item {item}");
        }

        let _permit = self.permits.acquire().await?;
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        tokio::time::sleep(self.latency.mul_f64(jitter)).await;
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        tracing::info!(processed = self.seen.load(Ordering::SeqCst), "Processor terminated");
        Ok(())
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "info")
    // - DISPATCH_*: pool configuration, see PoolConfig::from_env
    // - SIM_ITEMS, SIM_STAGES, SIM_CAPACITY, SIM_LATENCY_MS, SIM_FAIL_AT: workload
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = PoolConfig::from_env();
    let items: u64 = env_or("SIM_ITEMS", 10_000);
    let stages: usize = env_or("SIM_STAGES", 2);
    let capacity: usize = env_or("SIM_CAPACITY", 10);
    let latency = Duration::from_millis(env_or("SIM_LATENCY_MS", 5));
    let fail_at = std::env::var("SIM_FAIL_AT").ok().and_then(|v| v.parse().ok());

    tracing::info!(
        items,
        stages,
        capacity,
        min_workers = config.min_workers,
        max_workers = config.max_workers,
        profile = ?config.profile,
        "dispatch-sim starting..."
    );

    let mut builder = Pipeline::builder().on_fault(|fault| {
        tracing::error!(error = %fault, at = %fault.occurred_at(), "Pipeline fault");
    });
    for stage in 0..stages.max(1) {
        let processor = Contended {
            permits: Semaphore::new(capacity.max(1)),
            latency,
            // Only the last stage fails, so upstream stages see the abort
            fail_at: if stage + 1 == stages.max(1) { fail_at } else { None },
            seen: AtomicU64::new(0),
        };
        builder = builder.stage(
            config.clone().with_name(format!("stage-{stage}")),
            Processors::shared(processor),
        );
    }
    let pipeline = builder.build().context("Failed to build pipeline")?;

    let producer = async {
        for item in 0..items {
            if let Err(e) = pipeline.enqueue(item).await {
                tracing::warn!(item, error = %e, "Enqueue rejected, stopping producer");
                break;
            }
        }
        pipeline.shutdown();
    };

    tokio::select! {
        _ = producer => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            pipeline.shutdown_now();
        }
    }

    let outcome = pipeline.await_termination(Duration::from_secs(3600)).await;
    for stats in pipeline.stats() {
        tracing::info!(
            stage = %stats.name,
            state = %stats.state,
            processed = stats.processed,
            unprocessed = stats.unprocessed,
            active_workers = stats.active_workers,
            allocated_workers = stats.allocated_workers,
            "Stage summary"
        );
    }

    match outcome {
        Ok(true) => tracing::info!("dispatch-sim complete"),
        Ok(false) => tracing::warn!("Pipeline did not terminate in time"),
        Err(e) => return Err(e).context("Pipeline aborted"),
    }
    Ok(())
}
