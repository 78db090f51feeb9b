//! Budget governor.
//!
//! A [`Budget`] caps four independent dimensions. [`check`] is pure: it
//! compares a [`UsageSnapshot`] against the caps and reports the first
//! dimension that has been reached. A dimension trips when usage is greater
//! than or equal to its limit.

use serde::{Deserialize, Serialize};

/// Resource ceilings for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub max_cost_usd: f64,
    /// `None` means tokens are not capped.
    #[serde(default)]
    pub max_tokens: Option<u64>,
    pub max_iterations: u32,
    pub max_wall_clock_secs: f64,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_cost_usd: 5.0,
            max_tokens: None,
            max_iterations: 50,
            max_wall_clock_secs: 3600.0,
        }
    }
}

impl Budget {
    pub fn with_max_cost_usd(mut self, max: f64) -> Self {
        self.max_cost_usd = max;
        self
    }

    pub fn with_max_tokens(mut self, max: u64) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_max_wall_clock_secs(mut self, secs: f64) -> Self {
        self.max_wall_clock_secs = secs;
        self
    }
}

/// Budgeted resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDimension {
    Cost,
    Tokens,
    Iterations,
    WallClock,
}

impl std::fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetDimension::Cost => write!(f, "cost"),
            BudgetDimension::Tokens => write!(f, "tokens"),
            BudgetDimension::Iterations => write!(f, "iterations"),
            BudgetDimension::WallClock => write!(f, "wall_clock"),
        }
    }
}

/// Resource consumption at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageSnapshot {
    pub cost_usd: f64,
    pub tokens: u64,
    pub iterations: u32,
    pub elapsed_secs: f64,
}

/// Outcome of a budget check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetVerdict {
    pub exceeded: bool,
    pub dimension: Option<BudgetDimension>,
}

impl BudgetVerdict {
    fn within() -> Self {
        Self {
            exceeded: false,
            dimension: None,
        }
    }

    fn tripped(dimension: BudgetDimension) -> Self {
        Self {
            exceeded: true,
            dimension: Some(dimension),
        }
    }
}

/// Compare usage against the budget. Dimensions are checked in the order
/// cost, tokens, iterations, wall clock.
pub fn check(budget: &Budget, usage: &UsageSnapshot) -> BudgetVerdict {
    if usage.cost_usd >= budget.max_cost_usd {
        return BudgetVerdict::tripped(BudgetDimension::Cost);
    }
    if let Some(max) = budget.max_tokens
        && usage.tokens >= max
    {
        return BudgetVerdict::tripped(BudgetDimension::Tokens);
    }
    if usage.iterations >= budget.max_iterations {
        return BudgetVerdict::tripped(BudgetDimension::Iterations);
    }
    if usage.elapsed_secs >= budget.max_wall_clock_secs {
        return BudgetVerdict::tripped(BudgetDimension::WallClock);
    }
    BudgetVerdict::within()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let b = Budget::default();
        assert_eq!(b.max_cost_usd, 5.0);
        assert_eq!(b.max_tokens, None);
        assert_eq!(b.max_iterations, 50);
        assert_eq!(b.max_wall_clock_secs, 3600.0);
    }

    #[test]
    fn within_budget() {
        let verdict = check(
            &Budget::default(),
            &UsageSnapshot {
                cost_usd: 1.0,
                tokens: 10_000,
                iterations: 3,
                elapsed_secs: 12.0,
            },
        );
        assert!(!verdict.exceeded);
        assert_eq!(verdict.dimension, None);
    }

    #[test]
    fn limit_reached_trips() {
        let budget = Budget::default().with_max_cost_usd(0.01);
        let verdict = check(
            &budget,
            &UsageSnapshot {
                cost_usd: 0.01,
                ..Default::default()
            },
        );
        assert!(verdict.exceeded);
        assert_eq!(verdict.dimension, Some(BudgetDimension::Cost));
    }

    #[test]
    fn tokens_only_when_capped() {
        let usage = UsageSnapshot {
            tokens: 1_000_000,
            ..Default::default()
        };
        assert!(!check(&Budget::default(), &usage).exceeded);
        let capped = Budget::default().with_max_tokens(500);
        assert_eq!(check(&capped, &usage).dimension, Some(BudgetDimension::Tokens));
    }

    #[test]
    fn iterations_and_wall_clock() {
        let budget = Budget::default()
            .with_max_iterations(2)
            .with_max_wall_clock_secs(10.0);
        let iter = UsageSnapshot {
            iterations: 2,
            ..Default::default()
        };
        assert_eq!(check(&budget, &iter).dimension, Some(BudgetDimension::Iterations));
        let clock = UsageSnapshot {
            elapsed_secs: 10.5,
            ..Default::default()
        };
        assert_eq!(check(&budget, &clock).dimension, Some(BudgetDimension::WallClock));
    }

    #[test]
    fn cost_reported_before_other_dimensions() {
        let budget = Budget::default().with_max_cost_usd(1.0).with_max_iterations(1);
        let usage = UsageSnapshot {
            cost_usd: 2.0,
            iterations: 5,
            ..Default::default()
        };
        assert_eq!(check(&budget, &usage).dimension, Some(BudgetDimension::Cost));
    }
}
