//! Session budgets: three dimensions (cost, steps, wall clock), checked
//! before each step, consumed monotonically, never replenished.
//!
//! A `BudgetFrame` carries *absolute* ceilings measured against the
//! session-cumulative spend, so a subplan's consumption counts against every
//! ancestor automatically and a child can only narrow what it inherited.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Immutable per-session (or per-subplan) limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimits {
    /// Maximum cumulative cost in USD.
    pub max_cost_usd: f64,
    /// Maximum number of executed steps.
    pub max_steps: u32,
    /// Maximum wall-clock time in milliseconds.
    pub max_duration_ms: u64,
}

impl BudgetLimits {
    /// Clamp to a parent's limits (inheritance enforcement).
    pub fn clamp_to(&self, parent: &BudgetLimits) -> BudgetLimits {
        BudgetLimits {
            max_cost_usd: self.max_cost_usd.min(parent.max_cost_usd),
            max_steps: self.max_steps.min(parent.max_steps),
            max_duration_ms: self.max_duration_ms.min(parent.max_duration_ms),
        }
    }
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            max_cost_usd: 1.0,
            max_steps: 30,
            max_duration_ms: 300_000,
        }
    }
}

/// Mutable consumption state, session-cumulative.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BudgetSpend {
    pub cost_usd: f64,
    pub steps: u32,
}

/// Which dimension tripped first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetBreach {
    Cost,
    Steps,
    Duration,
}

impl BudgetBreach {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetBreach::Cost => "cost",
            BudgetBreach::Steps => "steps",
            BudgetBreach::Duration => "duration",
        }
    }
}

/// Absolute ceilings for one plan (root or subplan).
#[derive(Debug, Clone)]
pub struct BudgetFrame {
    pub cost_ceiling: f64,
    pub step_ceiling: u32,
    pub deadline: Instant,
}

impl BudgetFrame {
    pub fn root(limits: &BudgetLimits, started: Instant) -> Self {
        Self {
            cost_ceiling: limits.max_cost_usd,
            step_ceiling: limits.max_steps,
            deadline: started + Duration::from_millis(limits.max_duration_ms),
        }
    }

    /// Derive a child frame: the child's request is measured from the spend
    /// at derivation time and capped by the parent ceiling. No request means
    /// the child inherits the parent ceiling unchanged.
    pub fn child(
        &self,
        spend: &BudgetSpend,
        max_steps: Option<u32>,
        max_cost_usd: Option<f64>,
    ) -> Self {
        Self {
            cost_ceiling: match max_cost_usd {
                Some(c) => (spend.cost_usd + c).min(self.cost_ceiling),
                None => self.cost_ceiling,
            },
            step_ceiling: match max_steps {
                Some(s) => spend.steps.saturating_add(s).min(self.step_ceiling),
                None => self.step_ceiling,
            },
            deadline: self.deadline,
        }
    }

    /// Pre-step check. The comparison is spend-so-far against the ceiling,
    /// so a single step may push the total over before the next check halts.
    /// Order: cost, steps, elapsed time; first breach wins.
    pub fn check(&self, spend: &BudgetSpend, now: Instant) -> Option<BudgetBreach> {
        if spend.cost_usd >= self.cost_ceiling {
            return Some(BudgetBreach::Cost);
        }
        if spend.steps >= self.step_ceiling {
            return Some(BudgetBreach::Steps);
        }
        if now >= self.deadline {
            return Some(BudgetBreach::Duration);
        }
        None
    }
}
