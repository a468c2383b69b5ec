//! Work pool configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::balance::Profile;
use crate::error::{DispatchError, Result};

/// Default timing unit: enqueue retry wait, worker poll wait, sampling unit
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Work pool configuration
///
/// A pool runs between `min_workers` and `max_workers` workers and starts
/// with `initial_workers`. The load controller is attached only when a
/// [`Profile`] is set; without one the pool stays at its initial size.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Name used in log spans
    pub name: String,

    /// Lower worker bound (at least 1)
    pub min_workers: usize,

    /// Upper worker bound
    pub max_workers: usize,

    /// Workers started with the pool
    pub initial_workers: usize,

    /// Hand items directly to idle workers instead of buffering them
    pub synchronous: bool,

    /// Load controller profile; `None` keeps the pool at a fixed size
    pub profile: Option<Profile>,

    /// Timing unit
    #[serde(with = "duration_millis")]
    pub tick: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            name: "pool".to_string(),
            min_workers: workers,
            max_workers: workers,
            initial_workers: workers,
            synchronous: true,
            profile: None,
            tick: DEFAULT_TICK,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with explicit bounds and no load controller
    pub fn new(min_workers: usize, max_workers: usize, initial_workers: usize) -> Self {
        Self {
            min_workers,
            max_workers,
            initial_workers,
            ..Default::default()
        }
    }

    /// Fixed-size pool
    pub fn fixed(workers: usize) -> Self {
        Self::new(workers, workers, workers)
    }

    /// Balanced pool starting at `min_workers` with the medium profile
    pub fn balanced(min_workers: usize, max_workers: usize) -> Self {
        Self::new(min_workers, max_workers, min_workers).with_profile(Profile::MEDIUM)
    }

    /// Set the pool name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the initial worker count
    pub fn with_initial_workers(mut self, initial: usize) -> Self {
        self.initial_workers = initial;
        self
    }

    /// Use a synchronous handoff queue (`true`) or a buffered FIFO (`false`)
    pub fn with_synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    /// Attach a load controller with the given profile
    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Detach the load controller
    pub fn without_profile(mut self) -> Self {
        self.profile = None;
        self
    }

    /// Set the timing unit
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Whether a load controller will be attached
    pub fn is_balanced(&self) -> bool {
        self.profile.is_some()
    }

    /// Validate the worker bounds and the profile
    pub fn validate(&self) -> Result<()> {
        if self.min_workers < 1 {
            return Err(DispatchError::invalid("min_workers must be at least 1"));
        }
        if self.max_workers < self.min_workers {
            return Err(DispatchError::invalid(format!(
                "max_workers ({}) must not be below min_workers ({})",
                self.max_workers, self.min_workers
            )));
        }
        if !(self.min_workers..=self.max_workers).contains(&self.initial_workers) {
            return Err(DispatchError::invalid(format!(
                "initial_workers ({}) must be within {}..={}",
                self.initial_workers, self.min_workers, self.max_workers
            )));
        }
        if self.tick.is_zero() {
            return Err(DispatchError::invalid("tick must be greater than zero"));
        }
        if let Some(profile) = &self.profile {
            profile.validate()?;
        }
        Ok(())
    }

    /// Create configuration from `DISPATCH_*` environment variables
    ///
    /// Unset or unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| lookup(key).and_then(|value| value.trim().parse::<usize>().ok());

        let defaults = Self::default();
        let min_workers = parsed("DISPATCH_MIN_WORKERS").unwrap_or(defaults.min_workers);
        let max_workers =
            parsed("DISPATCH_MAX_WORKERS").unwrap_or(min_workers.max(defaults.max_workers));
        let initial_workers = parsed("DISPATCH_INITIAL_WORKERS").unwrap_or(min_workers);

        let synchronous = lookup("DISPATCH_SYNCHRONOUS")
            .and_then(|value| match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => Some(true),
                "0" | "false" | "no" => Some(false),
                _ => None,
            })
            .unwrap_or(defaults.synchronous);

        let profile = lookup("DISPATCH_PROFILE").and_then(|name| Profile::named(&name));

        let tick = lookup("DISPATCH_TICK_MS")
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|millis| *millis > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.tick);

        Self {
            min_workers,
            max_workers,
            initial_workers,
            synchronous,
            profile,
            tick,
            ..defaults
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert!(config.min_workers >= 1);
        assert_eq!(config.min_workers, config.max_workers);
        assert!(config.synchronous);
        assert!(!config.is_balanced());
        assert_eq!(config.tick, DEFAULT_TICK);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = PoolConfig::balanced(2, 8)
            .with_name("resize")
            .with_initial_workers(4)
            .with_synchronous(false)
            .with_tick(Duration::from_millis(50));

        assert_eq!(config.name, "resize");
        assert_eq!(config.initial_workers, 4);
        assert!(!config.synchronous);
        assert_eq!(config.profile, Some(Profile::MEDIUM));
        assert!(config.validate().is_ok());
        assert!(!config.without_profile().is_balanced());
    }

    #[test]
    fn test_validation_rejects_bad_bounds() {
        assert!(PoolConfig::fixed(0).validate().is_err());
        assert!(PoolConfig::new(4, 2, 3).validate().is_err());
        assert!(PoolConfig::new(2, 4, 5).validate().is_err());
        assert!(PoolConfig::new(2, 4, 1).validate().is_err());
        assert!(PoolConfig::fixed(2).with_tick(Duration::ZERO).validate().is_err());
        assert!(PoolConfig::fixed(2)
            .with_profile(Profile::MEDIUM.with_worth(0.0).with_period(1))
            .validate()
            .is_ok());

        let err = PoolConfig::new(2, 4, 5).validate().unwrap_err();
        assert!(matches!(err, DispatchError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_from_lookup() {
        let config = PoolConfig::from_lookup(lookup(&[
            ("DISPATCH_MIN_WORKERS", "2"),
            ("DISPATCH_MAX_WORKERS", "12"),
            ("DISPATCH_INITIAL_WORKERS", "3"),
            ("DISPATCH_SYNCHRONOUS", "false"),
            ("DISPATCH_PROFILE", "slow"),
            ("DISPATCH_TICK_MS", "250"),
        ]));

        assert_eq!(config.min_workers, 2);
        assert_eq!(config.max_workers, 12);
        assert_eq!(config.initial_workers, 3);
        assert!(!config.synchronous);
        assert_eq!(config.profile, Some(Profile::SLOW));
        assert_eq!(config.tick, Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_falls_back_on_garbage() {
        let config = PoolConfig::from_lookup(lookup(&[
            ("DISPATCH_MIN_WORKERS", "many"),
            ("DISPATCH_SYNCHRONOUS", "perhaps"),
            ("DISPATCH_PROFILE", "turbo"),
            ("DISPATCH_TICK_MS", "0"),
        ]));
        let defaults = PoolConfig::default();

        assert_eq!(config.min_workers, defaults.min_workers);
        assert_eq!(config.synchronous, defaults.synchronous);
        assert_eq!(config.profile, None);
        assert_eq!(config.tick, DEFAULT_TICK);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialization() {
        let config = PoolConfig::balanced(1, 4).with_tick(Duration::from_millis(20));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["tick"], 20);

        let parsed: PoolConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }
}
