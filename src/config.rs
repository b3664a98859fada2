//! Operating parameters and registries, all loaded from the durable store at
//! wake time: `config:defaults` (merged with standing wake-time overrides),
//! `config:models` (per-token rates), `config:resources` (ground-truth
//! checker accounts).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::budget::BudgetLimits;
use crate::types::Effort;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineDefaults {
    pub model: String,
    pub fallback_model: String,
    pub max_tokens: u32,
    pub effort: Effort,
    pub session_budget: BudgetLimits,
    /// Default retry count for a failing step.
    pub step_retries: u32,
    pub max_subplan_depth: u32,
    pub sleep_minutes: i64,
    /// First deep review once the lifetime session counter reaches this.
    pub deep_review_after_sessions: u64,
    pub deep_review_interval_sessions: u64,
    pub deep_review_interval_days: i64,
    /// How many recent session logs a deep review reads.
    pub deep_review_history: usize,
    pub tripwires: Vec<Tripwire>,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            fallback_model: "claude-3-5-haiku-20241022".to_string(),
            max_tokens: 4096,
            effort: Effort::Medium,
            session_budget: BudgetLimits::default(),
            step_retries: 1,
            max_subplan_depth: 3,
            sleep_minutes: 60,
            deep_review_after_sessions: 10,
            deep_review_interval_sessions: 10,
            deep_review_interval_days: 7,
            deep_review_history: 3,
            tripwires: Vec::new(),
        }
    }
}

/// Wake-time tripwire: compare live data at `path` against a threshold and
/// raise the session effort. Effort only ever escalates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tripwire {
    /// Dot-separated path into the live context document.
    pub path: String,
    pub op: TripwireOp,
    #[serde(default)]
    pub value: Option<Value>,
    pub raise_to: Effort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripwireOp {
    Below,
    Above,
    Equals,
    /// Differs from the same path in the previous session's snapshot.
    Changed,
}

impl Tripwire {
    /// Evaluate against the live document and the previous session's
    /// snapshot. `None` threshold makes `below`/`above`/`equals` inert.
    pub fn fires(&self, live: &Value, previous: &Value) -> bool {
        let current = lookup_path(live, &self.path);
        match self.op {
            TripwireOp::Below => match (current.and_then(Value::as_f64), self.value.as_ref().and_then(Value::as_f64)) {
                (Some(c), Some(t)) => c < t,
                _ => false,
            },
            TripwireOp::Above => match (current.and_then(Value::as_f64), self.value.as_ref().and_then(Value::as_f64)) {
                (Some(c), Some(t)) => c > t,
                _ => false,
            },
            TripwireOp::Equals => match (current, self.value.as_ref()) {
                (Some(c), Some(t)) => c == t,
                _ => false,
            },
            TripwireOp::Changed => current != lookup_path(previous, &self.path),
        }
    }
}

fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = doc;
    for segment in path.split('.') {
        node = node.get(segment)?;
    }
    Some(node)
}

/// Apply ordered tripwires; the result is the highest effort any rule asked
/// for, never lower than the starting effort. Returns the fired rules.
pub fn apply_tripwires<'a>(
    base: Effort,
    rules: &'a [Tripwire],
    live: &Value,
    previous: &Value,
) -> (Effort, Vec<&'a Tripwire>) {
    let mut effort = base;
    let mut fired = Vec::new();
    for rule in rules {
        if rule.fires(live, previous) {
            effort = effort.max(rule.raise_to);
            fired.push(rule);
        }
    }
    (effort, fired)
}

/// Shallow per-key merge of overrides into a defaults document: when both
/// sides hold objects the merge recurses exactly one level, otherwise the
/// override replaces the default.
pub fn merge_overrides(base: &mut Value, overrides: &Value) {
    let (Some(base_map), Some(over_map)) = (base.as_object_mut(), overrides.as_object()) else {
        return;
    };
    for (key, over_val) in over_map {
        match (base_map.get_mut(key), over_val.as_object()) {
            (Some(Value::Object(existing)), Some(nested)) => {
                for (k, v) in nested {
                    existing.insert(k.clone(), v.clone());
                }
            }
            _ => {
                base_map.insert(key.clone(), over_val.clone());
            }
        }
    }
}

/// `config:models`: per-1k-token rates keyed by model id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelRegistry {
    pub models: HashMap<String, ModelRates>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRates {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelRegistry {
    /// Estimated USD cost; an unrecognized model yields `None`, never an error.
    pub fn estimate(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> Option<f64> {
        let rates = self.models.get(model)?;
        Some(
            prompt_tokens as f64 / 1000.0 * rates.input_per_1k
                + completion_tokens as f64 / 1000.0 * rates.output_per_1k,
        )
    }
}

/// `config:resources`: externally checkable ground truth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRegistry {
    #[serde(default)]
    pub accounts: Vec<ResourceAccount>,
}

/// One account whose balance/usage is fetched by a registered checker
/// capability at wake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAccount {
    pub name: String,
    /// Capability name to invoke.
    pub checker: String,
    #[serde(default)]
    pub params: Value,
}
