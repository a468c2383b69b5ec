//! Load controller profiles

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// Tuning of the load controller
///
/// A profile fixes the sampling period (in pool ticks), the exponential
/// smoothing weights applied to per-item processing time, the fraction by
/// which a larger worker count must beat the current throughput before the
/// controller grows, and whether stale performance entries are forgotten.
///
/// # Example
///
/// ```
/// use dispatch::Profile;
///
/// let profile = Profile::FAST.with_worth(0.08);
/// assert_eq!(profile.period, 3);
/// assert!(profile.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    /// Sampling period, in pool ticks
    pub period: u32,

    /// Weight of the newest processing-time sample
    pub high: f64,

    /// Weight of the running average
    pub low: f64,

    /// Minimum relative gain that justifies growing the pool
    pub worth: f64,

    /// Forget neighbouring performance entries once a local optimum holds
    pub fluid: bool,
}

impl Profile {
    /// Reacts quickly, grows on small gains, keeps re-exploring
    pub const FAST: Profile = Profile {
        period: 3,
        high: 0.9,
        low: 0.1,
        worth: 0.05,
        fluid: true,
    };

    /// Balanced default
    pub const MEDIUM: Profile = Profile {
        period: 5,
        high: 0.5,
        low: 0.5,
        worth: 0.1,
        fluid: true,
    };

    /// Conservative; never forgets, so it settles on a local optimum
    pub const SLOW: Profile = Profile {
        period: 10,
        high: 0.1,
        low: 0.9,
        worth: 0.2,
        fluid: false,
    };

    /// Create a custom profile
    pub fn new(period: u32, high: f64, low: f64, worth: f64, fluid: bool) -> Self {
        Self {
            period,
            high,
            low,
            worth,
            fluid,
        }
    }

    /// Look up a preset by name (`fast`, `medium`, `slow`)
    pub fn named(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "fast" => Some(Self::FAST),
            "medium" => Some(Self::MEDIUM),
            "slow" => Some(Self::SLOW),
            _ => None,
        }
    }

    /// Set the sampling period
    pub fn with_period(mut self, period: u32) -> Self {
        self.period = period.max(1);
        self
    }

    /// Set the growth threshold
    pub fn with_worth(mut self, worth: f64) -> Self {
        self.worth = worth.max(0.0);
        self
    }

    /// Set the forgetting policy
    pub fn with_fluid(mut self, fluid: bool) -> Self {
        self.fluid = fluid;
        self
    }

    /// Smooth a new processing-time sample into the running average
    pub fn smooth(&self, average: f64, sample: f64) -> f64 {
        average * self.low + sample * self.high
    }

    /// Whether `candidate` improves on `current` by more than the worth fraction
    pub fn is_worth(&self, candidate: u64, current: u64) -> bool {
        if current == 0 {
            return candidate > 0;
        }
        (candidate as f64 - current as f64) / current as f64 > self.worth
    }

    /// Validate the profile
    pub fn validate(&self) -> Result<()> {
        if self.period == 0 {
            return Err(DispatchError::invalid("profile period must be at least 1"));
        }
        for (name, weight) in [("high", self.high), ("low", self.low)] {
            if !(0.0..=1.0).contains(&weight) {
                return Err(DispatchError::invalid(format!(
                    "profile weight {name} must be within 0..=1, got {weight}"
                )));
            }
        }
        if !self.worth.is_finite() || self.worth < 0.0 {
            return Err(DispatchError::invalid(format!(
                "profile worth must be a non-negative fraction, got {}",
                self.worth
            )));
        }
        Ok(())
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self::MEDIUM
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert_eq!(Profile::FAST, Profile::new(3, 0.9, 0.1, 0.05, true));
        assert_eq!(Profile::MEDIUM, Profile::new(5, 0.5, 0.5, 0.1, true));
        assert_eq!(Profile::SLOW, Profile::new(10, 0.1, 0.9, 0.2, false));
        assert_eq!(Profile::default(), Profile::MEDIUM);
    }

    #[test]
    fn test_named() {
        assert_eq!(Profile::named("Fast"), Some(Profile::FAST));
        assert_eq!(Profile::named(" slow "), Some(Profile::SLOW));
        assert_eq!(Profile::named("turbo"), None);
    }

    #[test]
    fn test_is_worth() {
        let profile = Profile::MEDIUM;
        assert!(profile.is_worth(111, 100));
        assert!(!profile.is_worth(110, 100));
        assert!(!profile.is_worth(90, 100));
        assert!(profile.is_worth(1, 0));
    }

    #[test]
    fn test_smooth() {
        let profile = Profile::FAST;
        let average = profile.smooth(1000.0, 0.0);
        assert!((average - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_validation() {
        assert!(Profile::SLOW.validate().is_ok());
        assert!(Profile::new(0, 0.5, 0.5, 0.1, true).validate().is_err());
        assert!(Profile::new(5, 1.5, 0.5, 0.1, true).validate().is_err());
        assert!(Profile::new(5, 0.5, 0.5, -0.1, true).validate().is_err());
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&Profile::SLOW).unwrap();
        let parsed: Profile = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Profile::SLOW);
    }
}
