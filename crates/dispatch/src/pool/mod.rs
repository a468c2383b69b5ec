//! Work pool
//!
//! This module provides:
//! - [`WorkPool`] - queue plus workers, with graceful and forceful shutdown
//! - [`PoolConfig`] - worker bounds, queue mode, optional load controller
//! - [`Processor`] / [`Processors`] - the caller-supplied processing capability
//!
//! # Architecture
//!
//! ```text
//!  producers ──enqueue──► WorkQueue ──poll──► Worker 0 ─┐
//!                            │               Worker 1 ─┼─► Processor::process
//!                            │               Worker … ─┘        │
//!                            │                                  │ ok: completion hook
//!                     shutdown_now drains                       │ err: FaultCoordinator
//!                            ▼                                  ▼
//!                       unprocessed                    next stage / dropped
//!
//!  LoadController (optional) ── samples workers ──► grow / shrink
//! ```

mod config;
mod processor;
mod queue;
mod work_pool;
mod worker;

pub use config::{PoolConfig, DEFAULT_TICK};
pub use processor::{processor_fn, FnProcessor, Processor, ProcessorFactory, Processors};
pub use work_pool::{PoolState, PoolStats, WorkPool};

pub(crate) use work_pool::{deadline_after, CompletionHook};
