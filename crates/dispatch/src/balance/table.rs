//! Performance table and hill-climbing decisions
//!
//! The [`Balancer`] is a pure state machine: it is fed the throughput samples
//! of one sampling window and the current worker count, and answers whether
//! the pool should grow, shrink or hold. It owns no threads and no clock, so
//! its behaviour can be tested against synthetic throughput curves.

use std::collections::BTreeMap;
use std::fmt;

use super::profile::Profile;

/// Outcome of one sampling window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// A larger pool is expected to do better
    Increase,
    /// Hold the current worker count
    Stable,
    /// A smaller pool does at least as well
    Decrease,
    /// Workers reported samples but processed nothing
    Idle,
    /// No worker produced a sample since the previous window
    Unavailable,
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Increase => write!(f, "increase"),
            Self::Stable => write!(f, "stable"),
            Self::Decrease => write!(f, "decrease"),
            Self::Idle => write!(f, "idle"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Worker count to last observed throughput (items per sampling window)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerformanceTable {
    entries: BTreeMap<usize, u64>,
}

impl PerformanceTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the throughput observed with `workers` active
    pub fn record(&mut self, workers: usize, throughput: u64) {
        self.entries.insert(workers, throughput);
    }

    /// Last throughput observed with `workers` active
    pub fn get(&self, workers: usize) -> Option<u64> {
        self.entries.get(&workers).copied()
    }

    /// Forget the entry for `workers`
    pub fn forget(&mut self, workers: usize) {
        self.entries.remove(&workers);
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending worker-count order
    pub fn iter(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.entries.iter().map(|(workers, throughput)| (*workers, *throughput))
    }
}

impl fmt::Display for PerformanceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Hold,
    Down,
}

/// Hill-climbing decision state for one pool
#[derive(Debug, Clone)]
pub struct Balancer {
    profile: Profile,
    min_workers: usize,
    max_workers: usize,
    table: PerformanceTable,
}

impl Balancer {
    /// Create a balancer for the given bounds
    pub fn new(profile: Profile, min_workers: usize, max_workers: usize) -> Self {
        Self {
            profile,
            min_workers,
            max_workers,
            table: PerformanceTable::new(),
        }
    }

    /// The profile in use
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// The performance history gathered so far
    pub fn table(&self) -> &PerformanceTable {
        &self.table
    }

    /// Assess one sampling window taken with `active` workers
    pub fn assess(&mut self, active: usize, samples: &[u64]) -> LoadStatus {
        if samples.is_empty() {
            return LoadStatus::Unavailable;
        }

        let throughput: u64 = samples.iter().sum();
        if throughput == 0 {
            return LoadStatus::Idle;
        }

        self.table.record(active, throughput);
        let higher_key = active + 1;
        let lower_key = active.checked_sub(1);
        let higher = self.table.get(higher_key);
        let lower = lower_key.and_then(|key| self.table.get(key));

        // No neighbour known yet: explore, growing first
        let direction = self.compare(throughput, lower, higher);
        if active < self.max_workers && matches!(direction, None | Some(Direction::Up)) {
            LoadStatus::Increase
        } else if active > self.min_workers && matches!(direction, None | Some(Direction::Down)) {
            LoadStatus::Decrease
        } else {
            if self.profile.fluid {
                self.table.forget(higher_key);
                if let Some(key) = lower_key {
                    self.table.forget(key);
                }
            }
            LoadStatus::Stable
        }
    }

    fn compare(&self, current: u64, lower: Option<u64>, higher: Option<u64>) -> Option<Direction> {
        match (lower, higher) {
            (Some(lower), Some(higher)) if higher > lower => {
                Some(if self.profile.is_worth(higher, current) {
                    Direction::Up
                } else {
                    Direction::Hold
                })
            }
            (Some(lower), Some(_)) => Some(if lower >= current {
                Direction::Down
            } else {
                Direction::Hold
            }),
            (None, Some(higher)) => Some(if self.profile.is_worth(higher, current) {
                Direction::Up
            } else {
                Direction::Down
            }),
            (Some(lower), None) => Some(if lower >= current {
                Direction::Down
            } else {
                Direction::Up
            }),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Apply decisions the way the controller does, clamped to the bounds
    fn step(balancer: &mut Balancer, active: usize, throughput: u64) -> usize {
        match balancer.assess(active, &[throughput]) {
            LoadStatus::Increase => active + 1,
            LoadStatus::Decrease | LoadStatus::Idle if active > balancer.min_workers => active - 1,
            _ => active,
        }
    }

    fn saturating_at_ten(workers: usize) -> u64 {
        workers.min(10) as u64 * 100
    }

    #[test]
    fn test_unavailable_without_samples() {
        let mut balancer = Balancer::new(Profile::MEDIUM, 1, 4);
        assert_eq!(balancer.assess(2, &[]), LoadStatus::Unavailable);
        assert!(balancer.table().is_empty());
    }

    #[test]
    fn test_idle_on_zero_throughput() {
        let mut balancer = Balancer::new(Profile::MEDIUM, 1, 4);
        assert_eq!(balancer.assess(2, &[0, 0]), LoadStatus::Idle);
        assert!(balancer.table().is_empty());
    }

    #[test]
    fn test_explores_upward_without_history() {
        let mut balancer = Balancer::new(Profile::MEDIUM, 1, 4);
        assert_eq!(balancer.assess(1, &[40, 2]), LoadStatus::Increase);
        assert_eq!(balancer.table().get(1), Some(42));
    }

    #[test]
    fn test_explores_downward_at_max() {
        let mut balancer = Balancer::new(Profile::MEDIUM, 1, 4);
        assert_eq!(balancer.assess(4, &[10]), LoadStatus::Decrease);
    }

    #[test]
    fn test_lower_only() {
        let mut balancer = Balancer::new(Profile::MEDIUM, 1, 8);
        balancer.assess(2, &[100]);
        // 3 workers worse than 2
        assert_eq!(balancer.assess(3, &[90]), LoadStatus::Decrease);
        // 3 workers better than 2
        assert_eq!(balancer.assess(3, &[150]), LoadStatus::Increase);
    }

    #[test]
    fn test_higher_only_requires_worth() {
        let mut balancer = Balancer::new(Profile::MEDIUM, 1, 8);
        balancer.table.record(4, 105);
        assert_eq!(balancer.assess(3, &[100]), LoadStatus::Decrease);
        balancer.table.record(4, 150);
        assert_eq!(balancer.assess(3, &[100]), LoadStatus::Increase);
    }

    #[test]
    fn test_both_neighbours_hold_and_forget_when_fluid() {
        let mut balancer = Balancer::new(Profile::MEDIUM, 1, 8);
        balancer.table.record(2, 90);
        balancer.table.record(4, 105);
        assert_eq!(balancer.assess(3, &[100]), LoadStatus::Stable);
        assert_eq!(balancer.table().get(2), None);
        assert_eq!(balancer.table().get(4), None);
        assert_eq!(balancer.table().get(3), Some(100));
    }

    #[test]
    fn test_both_neighbours_hold_and_remember_when_not_fluid() {
        let mut balancer = Balancer::new(Profile::SLOW, 1, 8);
        balancer.table.record(2, 90);
        balancer.table.record(4, 105);
        assert_eq!(balancer.assess(3, &[100]), LoadStatus::Stable);
        assert_eq!(balancer.table().len(), 3);
    }

    #[test]
    fn test_both_neighbours_lower_better() {
        let mut balancer = Balancer::new(Profile::MEDIUM, 1, 8);
        balancer.table.record(2, 120);
        balancer.table.record(4, 80);
        assert_eq!(balancer.assess(3, &[100]), LoadStatus::Decrease);
    }

    #[test]
    fn test_clamped_at_bounds() {
        let mut balancer = Balancer::new(Profile::SLOW, 2, 2);
        assert_eq!(balancer.assess(2, &[100]), LoadStatus::Stable);
    }

    #[test]
    fn test_converges_on_saturation_point_when_not_fluid() {
        let mut balancer = Balancer::new(Profile::SLOW, 1, 20);
        let mut active = 1;
        let mut history = Vec::new();
        for _ in 0..60 {
            active = step(&mut balancer, active, saturating_at_ten(active));
            history.push(active);
        }

        assert!(history.iter().all(|workers| (1..=20).contains(workers)));
        // Settles within a bounded number of windows and never moves again
        assert!(history[12..].iter().all(|workers| *workers == 10));
    }

    #[test]
    fn test_fluid_profile_keeps_exploring_near_optimum() {
        let mut balancer = Balancer::new(Profile::FAST, 1, 20);
        let mut active = 1;
        let mut history = Vec::new();
        for _ in 0..60 {
            active = step(&mut balancer, active, saturating_at_ten(active));
            history.push(active);
        }

        assert!(history[12..].iter().all(|workers| (9..=11).contains(workers)));
    }

    #[test]
    fn test_noisy_throughput_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for profile in [Profile::FAST, Profile::MEDIUM, Profile::SLOW] {
            let mut balancer = Balancer::new(profile, 3, 12);
            let mut active = 5;
            for _ in 0..500 {
                let throughput = rng.gen_range(0..1_000);
                active = step(&mut balancer, active, throughput);
                assert!((3..=12).contains(&active), "left bounds: {active}");
            }
            assert!(balancer.table().iter().all(|(workers, _)| (3..=12).contains(&workers)));
        }
    }

    #[test]
    fn test_load_status_display() {
        assert_eq!(LoadStatus::Increase.to_string(), "increase");
        assert_eq!(LoadStatus::Unavailable.to_string(), "unavailable");
    }
}
