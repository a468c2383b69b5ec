//! Error taxonomy for the dispatch engine
//!
//! - [`DispatchError`] - what callers of pools and pipelines observe
//! - [`Fault`] - the first processing error captured by a fault coordinator,
//!   shared verbatim with every caller that awaits termination
//! - [`Panicked`] - a caught panic, reported like any other processing error

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Dispatch errors
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Enqueue attempted after shutdown was requested or a fault occurred
    #[error("work item rejected: pool is shut down or has faulted")]
    Rejected,

    /// Malformed worker bounds or pipeline definition
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A processor (or controller tick, or stage handoff) failed
    #[error("processing fault: {0}")]
    ProcessingFault(#[source] Fault),
}

impl DispatchError {
    /// Create an invalid configuration error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    /// Returns the captured fault, if this is a processing fault
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Self::ProcessingFault(fault) => Some(fault),
            _ => None,
        }
    }

    /// Check if the error is a rejected enqueue
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected)
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, DispatchError>;

/// A panic caught on a worker or fault fan-out path
#[derive(Debug, Clone, Error)]
#[error("{context} panicked: {message}")]
pub struct Panicked {
    /// What was running: "processor", "completion hook", ...
    pub context: &'static str,
    /// The panic message, when the payload was a string
    pub message: String,
}

impl Panicked {
    pub(crate) fn from_payload(context: &'static str, payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self { context, message }
    }
}

/// The first error captured by a [`FaultCoordinator`](crate::FaultCoordinator)
///
/// Cheap to clone; all clones refer to the same captured error, so
/// [`Fault::ptr_eq`] can be used to check that two observers saw the same
/// failure.
#[derive(Clone)]
pub struct Fault {
    inner: Arc<FaultInner>,
}

struct FaultInner {
    error: anyhow::Error,
    occurred_at: DateTime<Utc>,
}

impl Fault {
    /// Capture an error now
    pub fn new(error: anyhow::Error) -> Self {
        Self {
            inner: Arc::new(FaultInner {
                error,
                occurred_at: Utc::now(),
            }),
        }
    }

    /// The captured error
    pub fn error(&self) -> &anyhow::Error {
        &self.inner.error
    }

    /// When the error was captured
    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.inner.occurred_at
    }

    /// Attempt to view the captured error as a concrete type
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.inner.error.downcast_ref::<E>()
    }

    /// Whether both handles refer to the same captured error
    pub fn ptr_eq(&self, other: &Fault) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("error", &self.inner.error)
            .field("occurred_at", &self.inner.occurred_at)
            .finish()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.error)
    }
}

impl std::error::Error for Fault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.error.source()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("simulated failure")]
    struct Simulated;

    #[test]
    fn test_fault_downcast() {
        let fault = Fault::new(Simulated.into());
        assert!(fault.downcast_ref::<Simulated>().is_some());
        assert_eq!(fault.to_string(), "simulated failure");
    }

    #[test]
    fn test_fault_clones_share_identity() {
        let fault = Fault::new(anyhow::anyhow!("boom"));
        let other = Fault::new(anyhow::anyhow!("boom"));
        assert!(fault.ptr_eq(&fault.clone()));
        assert!(!fault.ptr_eq(&other));
    }

    #[test]
    fn test_dispatch_error_display() {
        assert!(DispatchError::Rejected.to_string().contains("rejected"));
        assert!(DispatchError::invalid("min_workers must be at least 1")
            .to_string()
            .contains("min_workers"));

        let err = DispatchError::ProcessingFault(Fault::new(Simulated.into()));
        assert!(err.to_string().contains("simulated failure"));
        assert!(err.fault().is_some());
        assert!(!err.is_rejected());
    }

    #[test]
    fn test_panicked_from_payload() {
        let payload = std::panic::catch_unwind(|| panic!("item {} is bad", 7)).unwrap_err();
        let panicked = Panicked::from_payload("processor", payload.as_ref());
        assert_eq!(panicked.to_string(), "processor panicked: item 7 is bad");

        let payload = std::panic::catch_unwind(|| std::panic::panic_any(42u8)).unwrap_err();
        let panicked = Panicked::from_payload("listener", payload.as_ref());
        assert_eq!(panicked.message, "non-string panic payload");
    }
}
