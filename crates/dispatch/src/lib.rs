//! # Dispatch
//!
//! An adaptive, failure-aware work-dispatch engine for Tokio.
//!
//! ## Features
//!
//! - **Work pools**: a queue (buffered FIFO or synchronous handoff) feeding a set of workers
//! - **Load control**: an optional feedback loop that samples throughput and resizes the pool
//! - **Pipelines**: pools chained into stages, each completed item handed to the next stage
//! - **Fault coordination**: the first error anywhere stops every related worker, exactly once
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Pipeline                             │
//! │  (ordered stages, cascading graceful shutdown)              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkPool                              │
//! │  (queue, workers, quiescence barrier, unprocessed items)    │
//! └─────────────────────────────────────────────────────────────┘
//!               │                               │
//!               ▼                               ▼
//! ┌───────────────────────────┐   ┌─────────────────────────────┐
//! │      LoadController       │   │      FaultCoordinator       │
//! │ (throughput hill-climbing)│   │ (first error wins, fan-out) │
//! └───────────────────────────┘   └─────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use dispatch::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> dispatch::Result<()> {
//! let pool = WorkPool::new(
//!     PoolConfig::balanced(1, 8).with_synchronous(false),
//!     Processors::shared(processor_fn(|n: &u64| {
//!         let n = *n;
//!         async move {
//!             anyhow::ensure!(n < 1_000, "{n} is too large");
//!             Ok(())
//!         }
//!     })),
//! )?;
//!
//! for n in 0..100 {
//!     pool.enqueue(n).await?;
//! }
//! assert!(pool.await_termination(Duration::from_secs(30)).await?);
//! # Ok(())
//! # }
//! ```

pub mod balance;
pub mod error;
pub mod fault;
pub mod pipeline;
pub mod pool;

/// Prelude for common imports
pub mod prelude {
    pub use crate::balance::{LoadStatus, Profile};
    pub use crate::error::{DispatchError, Fault, Result};
    pub use crate::fault::{FaultCoordinator, ShutdownAction};
    pub use crate::pipeline::{Pipeline, PipelineBuilder};
    pub use crate::pool::{
        processor_fn, PoolConfig, PoolState, PoolStats, Processor, Processors, WorkPool,
    };
}

// Re-export key types at crate root
pub use balance::{Balancer, LoadStatus, PerformanceTable, Profile};
pub use error::{DispatchError, Fault, Panicked, Result};
pub use fault::{ComponentId, FaultCoordinator, FaultListener, ShutdownAction};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use pool::{
    processor_fn, FnProcessor, PoolConfig, PoolState, PoolStats, Processor, ProcessorFactory,
    Processors, WorkPool, DEFAULT_TICK,
};
