//! Adaptive worker-count control
//!
//! This module provides:
//! - [`Profile`] - sampling period, smoothing weights, growth threshold
//! - [`PerformanceTable`] - worker count to observed throughput
//! - [`Balancer`] - hill-climbing decisions over the table
//!
//! # Tick
//!
//! ```text
//!  sleep(max(period × tick, period × avg work time))
//!        │
//!        ▼
//!  samples from observable workers ──► none?  ──► Unavailable
//!        │ sum
//!        ▼
//!  throughput == 0 ──────────────────────────────► Idle (shrink)
//!        │
//!        ▼
//!  record (N, throughput); compare with N-1 and N+1
//!        │
//!        ├── better above ──► grow   (≤ max)
//!        ├── better below ──► shrink (≥ min)
//!        └── otherwise   ──► hold, fluid profiles forget N±1
//! ```

mod controller;
mod profile;
mod table;

pub(crate) use controller::{ElasticPool, LoadController};
pub use profile::Profile;
pub use table::{Balancer, LoadStatus, PerformanceTable};
