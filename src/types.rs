//! Core data model: plans, steps, stored results, effort levels, and the
//! structured objects review passes emit.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::budget::BudgetLimits;

/// Reasoning effort, totally ordered. Tripwires may only escalate.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Low,
    #[default]
    Medium,
    High,
    Max,
}

impl Effort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effort::Low => "low",
            Effort::Medium => "medium",
            Effort::High => "high",
            Effort::Max => "max",
        }
    }
}

/// A plan as returned by the planning call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub session_plan: Option<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub session_budget: Option<BudgetLimits>,
    #[serde(default)]
    pub mid_session_tripwires: Vec<SessionTripwire>,
}

/// What to do when a step has exhausted its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    Continue,
    Halt,
}

/// One node of the plan tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_result_as: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<FailurePolicy>,
    #[serde(flatten)]
    pub kind: StepKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke a named capability.
    Action {
        tool: String,
        #[serde(default)]
        input: Value,
    },
    /// One generative call; the textual result is the step result.
    Think {
        prompt: String,
        #[serde(default)]
        model: Option<String>,
    },
    /// Ask a short categorical question and run the matching branch.
    Conditional {
        question: String,
        branches: HashMap<String, Vec<Step>>,
    },
    /// Ask for a nested plan and recurse into it.
    Subplan {
        goal: String,
        #[serde(default)]
        max_steps: Option<u32>,
        #[serde(default)]
        max_cost_usd: Option<f64>,
    },
    /// Run a review pass in place.
    Reflect,
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Action { .. } => "action",
            StepKind::Think { .. } => "think",
            StepKind::Conditional { .. } => "conditional",
            StepKind::Subplan { .. } => "subplan",
            StepKind::Reflect => "reflect",
        }
    }
}

/// How a step ended up, keyed by step id. Dependents of anything but
/// `Succeeded` are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepDisposition {
    Succeeded,
    Failed,
    Skipped,
}

/// A stored step result. The explicit `Failed` tag is what dependency and
/// template skips key on; a successful `null` value is an ordinary result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StoredResult {
    Ok { value: Value },
    Failed { error: String },
}

impl StoredResult {
    pub fn is_failed(&self) -> bool {
        matches!(self, StoredResult::Failed { .. })
    }
}

/// Session-scoped tripwire evaluated between steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTripwire {
    pub when: SessionCondition,
    pub action: TripwireAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionCondition {
    AnyStepFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripwireAction {
    Halt,
    SkipRest,
    Replan,
}

/// Structured output of a review pass (in-session or deep).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewOutput {
    /// `session_summary` in normal reviews, `reflection` in deep ones.
    #[serde(alias = "session_summary")]
    pub reflection: String,
    pub note_to_future_self: String,
    #[serde(default)]
    pub kv_operations: Vec<KvOperation>,
    #[serde(default)]
    pub next_wake_config: Option<WakeConfig>,
    #[serde(default)]
    pub updated_defaults: Option<Value>,
    #[serde(default)]
    pub updated_wisdom: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvOperation {
    pub op: KvOpKind,
    pub key: String,
    #[serde(default)]
    pub value: Option<Value>,
    /// Target key for `rename`.
    #[serde(default)]
    pub to: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvOpKind {
    Put,
    Delete,
    Rename,
}

/// Standing wake-time configuration, written by review passes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WakeConfig {
    #[serde(default)]
    pub next_wake: Option<DateTime<Utc>>,
    #[serde(default)]
    pub effort: Option<Effort>,
    /// Per-key overrides merged into `config:defaults` at wake.
    #[serde(default)]
    pub overrides: Option<Value>,
}

/// The in-flight marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
}

/// Bookkeeping snapshot of the last cleanly completed session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub completed_at: DateTime<Utc>,
    pub cost_usd: f64,
    pub steps: u32,
    /// Ground-truth snapshot, used by `changed` tripwires next wake.
    #[serde(default)]
    pub ground_truth: Value,
    #[serde(default)]
    pub deep_review: bool,
}

/// Deep-review scheduling record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepReflectSchedule {
    pub last_at: DateTime<Utc>,
    pub last_session_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effort_is_totally_ordered() {
        assert!(Effort::Low < Effort::Medium);
        assert!(Effort::Medium < Effort::High);
        assert!(Effort::High < Effort::Max);
        assert_eq!(Effort::High.max(Effort::Low), Effort::High);
    }

    #[test]
    fn step_kind_round_trips_with_flat_tag() {
        let raw = serde_json::json!({
            "id": "s1",
            "kind": "action",
            "tool": "notify",
            "input": {"message": "hi"},
            "store_result_as": "sent",
            "depends_on": ["s0"]
        });
        let step: Step = serde_json::from_value(raw).unwrap();
        assert_eq!(step.id, "s1");
        assert_eq!(step.depends_on, vec!["s0".to_string()]);
        match &step.kind {
            StepKind::Action { tool, input } => {
                assert_eq!(tool, "notify");
                assert_eq!(input["message"], "hi");
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn reflect_step_needs_only_the_tag() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "id": "r",
            "kind": "reflect"
        }))
        .unwrap();
        assert!(matches!(step.kind, StepKind::Reflect));
    }

    #[test]
    fn plan_defaults_are_lenient() {
        let plan: Plan = serde_json::from_value(serde_json::json!({
            "steps": []
        }))
        .unwrap();
        assert!(plan.session_budget.is_none());
        assert!(plan.mid_session_tripwires.is_empty());
    }

    #[test]
    fn review_output_accepts_session_summary_alias() {
        let out: ReviewOutput = serde_json::from_value(serde_json::json!({
            "session_summary": "did things",
            "note_to_future_self": "keep going",
            "kv_operations": [{"op": "put", "key": "wisdom", "value": "x"}]
        }))
        .unwrap();
        assert_eq!(out.reflection, "did things");
        assert_eq!(out.kv_operations.len(), 1);
    }
}
