//! Worker selection strategies

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::task::TaskPriority;
use crate::error::SwitchboardError;

/// Load figures a strategy selects on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerLoad {
    pub active: usize,
    pub max_concurrent: usize,
    pub completed: u64,
}

impl WorkerLoad {
    pub fn utilization(&self) -> f64 {
        if self.max_concurrent == 0 {
            return 1.0;
        }
        self.active as f64 / self.max_concurrent as f64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Fewest completed tasks
    RoundRobin,
    /// Fewest active tasks
    #[default]
    LeastLoaded,
    /// Least-busy worker, urgent tasks first in line for it
    PriorityFirst,
    /// Lowest active/max_concurrent ratio
    ResourceAware,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::RoundRobin,
        Strategy::LeastLoaded,
        Strategy::PriorityFirst,
        Strategy::ResourceAware,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastLoaded => "least_loaded",
            Strategy::PriorityFirst => "priority_first",
            Strategy::ResourceAware => "resource_aware",
        }
    }

    /// Index of the chosen candidate. Ties go to the earliest candidate, so
    /// callers pass workers in registration order.
    ///
    /// `PriorityFirst` picks exactly like `LeastLoaded`: urgency is already
    /// honoured by the queue handing out the highest-priority task first.
    pub fn select(&self, candidates: &[WorkerLoad], _priority: TaskPriority) -> Option<usize> {
        match self {
            Strategy::RoundRobin => min_index_by(candidates, |w| w.completed as f64),
            Strategy::LeastLoaded | Strategy::PriorityFirst => {
                min_index_by(candidates, |w| w.active as f64)
            }
            Strategy::ResourceAware => min_index_by(candidates, WorkerLoad::utilization),
        }
    }
}

fn min_index_by(candidates: &[WorkerLoad], key: impl Fn(&WorkerLoad) -> f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, worker) in candidates.iter().enumerate() {
        let score = key(worker);
        match best {
            Some((_, best_score)) if score >= best_score => {}
            _ => best = Some((index, score)),
        }
    }
    best.map(|(index, _)| index)
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = SwitchboardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Strategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| SwitchboardError::Validation(format!("Unknown strategy: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(active: usize, max_concurrent: usize, completed: u64) -> WorkerLoad {
        WorkerLoad {
            active,
            max_concurrent,
            completed,
        }
    }

    #[test]
    fn test_parse_names() {
        for strategy in Strategy::ALL {
            assert_eq!(strategy.as_str().parse::<Strategy>().unwrap(), strategy);
        }
        assert!(matches!(
            "fastest".parse::<Strategy>(),
            Err(SwitchboardError::Validation(_))
        ));
    }

    #[test]
    fn test_strategies_pick_expected_worker() {
        let workers = [load(2, 10, 1), load(1, 2, 5), load(3, 3, 0)];

        assert_eq!(Strategy::RoundRobin.select(&workers, TaskPriority::Normal), Some(2));
        assert_eq!(Strategy::LeastLoaded.select(&workers, TaskPriority::Normal), Some(1));
        assert_eq!(Strategy::PriorityFirst.select(&workers, TaskPriority::Critical), Some(1));
        assert_eq!(Strategy::ResourceAware.select(&workers, TaskPriority::Normal), Some(0));
    }

    #[test]
    fn test_ties_go_to_first_candidate() {
        let workers = [load(1, 4, 0), load(1, 4, 0)];
        assert_eq!(Strategy::LeastLoaded.select(&workers, TaskPriority::Low), Some(0));
        assert_eq!(Strategy::LeastLoaded.select(&[], TaskPriority::Low), None);
    }

    #[test]
    fn test_priority_first_matches_least_loaded() {
        let workers = [load(4, 10, 0), load(0, 1, 9), load(2, 2, 3)];
        for priority in [
            TaskPriority::Low,
            TaskPriority::Normal,
            TaskPriority::High,
            TaskPriority::Critical,
        ] {
            assert_eq!(
                Strategy::PriorityFirst.select(&workers, priority),
                Strategy::LeastLoaded.select(&workers, priority)
            );
        }
    }
}
