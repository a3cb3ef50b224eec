//! Worker selection for dispatching requests across the worker pool
//!
//! The coordinator asks a [`WorkerSelector`] for one worker per inbound
//! request. Random selection is the default; the other strategies can be
//! enabled through `server.balance` without touching the dispatch plumbing.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

/// Worker selection strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    /// Random: pick a worker uniformly at random, independently per request
    #[default]
    Random,
    /// Round-robin: cycle through workers in pool order
    RoundRobin,
    /// Least outstanding: pick the worker with the fewest in-flight dispatches
    LeastOutstanding,
}

/// Anything the selector can pick from
pub trait Outstanding {
    /// Number of dispatches currently awaiting a reply
    fn outstanding(&self) -> usize;
}

impl Outstanding for usize {
    fn outstanding(&self) -> usize {
        *self
    }
}

/// Picks a worker index for each dispatch
#[derive(Debug)]
pub struct WorkerSelector {
    strategy: SelectionStrategy,
    /// Current index for round-robin
    round_robin_index: AtomicUsize,
}

impl WorkerSelector {
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            strategy,
            round_robin_index: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Select the index of the next worker, or `None` if there are no candidates
    pub fn select<T: Outstanding>(&self, candidates: &[T]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let index = match self.strategy {
            SelectionStrategy::Random => rand::thread_rng().gen_range(0..candidates.len()),
            SelectionStrategy::RoundRobin => {
                self.round_robin_index.fetch_add(1, Ordering::Relaxed) % candidates.len()
            }
            SelectionStrategy::LeastOutstanding => candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| c.outstanding())
                .map(|(i, _)| i)?,
        };

        trace!(index, strategy = ?self.strategy, "Selected worker");
        Some(index)
    }
}

impl Default for WorkerSelector {
    fn default() -> Self {
        Self::new(SelectionStrategy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_pool() {
        let selector = WorkerSelector::default();
        let candidates: [usize; 0] = [];
        assert_eq!(selector.select(&candidates), None);
    }

    #[test]
    fn test_random_is_default() {
        assert_eq!(WorkerSelector::default().strategy(), SelectionStrategy::Random);
    }

    #[test]
    fn test_random_distribution_converges() {
        let selector = WorkerSelector::new(SelectionStrategy::Random);
        let candidates = [0usize; 4];
        let draws = 40_000;
        let mut counts = [0usize; 4];

        for _ in 0..draws {
            let index = selector.select(&candidates).unwrap();
            counts[index] += 1;
        }

        for count in counts {
            let share = count as f64 / draws as f64;
            assert!((0.22..0.28).contains(&share), "share {} too far from 0.25", share);
        }
    }

    #[test]
    fn test_random_single_worker() {
        let selector = WorkerSelector::new(SelectionStrategy::Random);
        for _ in 0..100 {
            assert_eq!(selector.select(&[0usize]), Some(0));
        }
    }

    #[test]
    fn test_round_robin() {
        let selector = WorkerSelector::new(SelectionStrategy::RoundRobin);
        let candidates = [0usize; 3];

        assert_eq!(selector.select(&candidates), Some(0));
        assert_eq!(selector.select(&candidates), Some(1));
        assert_eq!(selector.select(&candidates), Some(2));
        assert_eq!(selector.select(&candidates), Some(0)); // wraps around
    }

    #[test]
    fn test_least_outstanding() {
        let selector = WorkerSelector::new(SelectionStrategy::LeastOutstanding);
        assert_eq!(selector.select(&[3usize, 1, 2]), Some(1));
        // ties go to the first worker in pool order
        assert_eq!(selector.select(&[2usize, 0, 0]), Some(1));
    }

    #[test]
    fn test_strategy_deserialize() {
        #[derive(Deserialize)]
        struct Wrapper {
            balance: SelectionStrategy,
        }

        let w: Wrapper = toml::from_str(r#"balance = "least-outstanding""#).unwrap();
        assert_eq!(w.balance, SelectionStrategy::LeastOutstanding);

        let w: Wrapper = toml::from_str(r#"balance = "round-robin""#).unwrap();
        assert_eq!(w.balance, SelectionStrategy::RoundRobin);
    }
}
