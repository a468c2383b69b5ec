//! Fault coordination
//!
//! This module provides:
//! - [`FaultCoordinator`] - first-error-wins registry with asynchronous shutdown fan-out
//! - [`ShutdownAction`] - forceful shutdown hook implemented by pools
//!
//! # Flow
//!
//! ```text
//!  worker / controller / stage handoff
//!              │ handle(error)
//!              ▼
//!  ┌───────────────────────────┐   abort token cancelled
//!  │     FaultCoordinator      │ ─────────────────────────► every worker stops
//!  │ (fault captured once)     │
//!  └─────────────┬─────────────┘
//!                │ fan-out task
//!                ▼
//!   listeners(fault), then shutdown_now() per component
//! ```

mod coordinator;

pub use coordinator::{ComponentId, FaultCoordinator, FaultListener, ShutdownAction};
