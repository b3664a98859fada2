//! The plan execution engine: a resource-bounded interpreter for externally
//! supplied step trees.
//!
//! Per step, in order: budget gate, session tripwires, template resolution
//! (a failed reference skips the step without charging the step budget),
//! dependency check, typed dispatch, retries, result storage, failure
//! policy. Subplans recurse with a derived budget frame and an explicit
//! depth counter.

use async_recursion::async_recursion;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::budget::BudgetFrame;
use crate::errors::{EngineError, EngineResult};
use crate::karma::KarmaEventKind;
use crate::llm::{extract_json, LlmMessage, LlmRequest, Thinking};
use crate::reflect::{self, ReviewKind};
use crate::session::{Services, Session};
use crate::store::keys;
use crate::template::{self, Resolution};
use crate::types::{
    FailurePolicy, Plan, SessionCondition, SessionTripwire, Step, StepDisposition, StepKind,
    StoredResult, TripwireAction,
};

/// Built-in fallback when no subplan prompt template is seeded; the format
/// contract is engine mechanics, not tunable content.
const FALLBACK_SUBPLAN_PROMPT: &str = "Produce a JSON object {\"steps\": [...]} of typed steps \
(kinds: action, think, conditional, subplan, reflect) that accomplishes this goal:\n{{goal}}";

/// How a plan (or subplan) run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOutcome {
    Completed,
    BudgetExceeded,
    Halted,
    SkippedRest,
    ReplanRequested,
}

#[async_recursion]
pub async fn execute_steps(
    session: &mut Session,
    services: &mut Services,
    steps: &[Step],
    frame: &BudgetFrame,
    tripwires: &[SessionTripwire],
    depth: u32,
) -> EngineResult<PlanOutcome> {
    for step in steps {
        // (a) Budget, before any work. First breach halts the rest.
        if let Some(breach) = frame.check(&session.spend, std::time::Instant::now()) {
            session
                .ledger
                .record(
                    KarmaEventKind::BudgetExceeded,
                    json!({
                        "dimension": breach.as_str(),
                        "at_step": step.id,
                        "cost_usd": session.spend.cost_usd,
                        "steps": session.spend.steps,
                        "depth": depth,
                    }),
                )
                .await?;
            return Ok(PlanOutcome::BudgetExceeded);
        }

        // (b) Session-scoped tripwires.
        for tripwire in tripwires {
            let fired = match tripwire.when {
                SessionCondition::AnyStepFailed => session.any_step_failed(),
            };
            if !fired {
                continue;
            }
            session
                .ledger
                .record(
                    KarmaEventKind::TripwireFired,
                    json!({ "when": tripwire.when, "action": tripwire.action, "at_step": step.id }),
                )
                .await?;
            match tripwire.action {
                TripwireAction::Halt => return Ok(PlanOutcome::Halted),
                TripwireAction::SkipRest => return Ok(PlanOutcome::SkippedRest),
                TripwireAction::Replan => {
                    session
                        .ledger
                        .record(KarmaEventKind::ReplanRequested, json!({ "at_step": step.id }))
                        .await?;
                    return Ok(PlanOutcome::ReplanRequested);
                }
            }
        }

        // Dependency gate: anything but a recorded success skips, and the
        // skip is recorded, never retried.
        if let Some(dep) = step
            .depends_on
            .iter()
            .find(|dep| session.dispositions.get(*dep) != Some(&StepDisposition::Succeeded))
        {
            skip_step(session, step, "dependency", dep).await?;
            continue;
        }

        // (c) Variable substitution. A failed reference resolves the whole
        // step to a skip, not charged against the step budget.
        let resolved = match resolve_kind(&step.kind, &session.vars) {
            Resolution::Value(kind) => kind,
            Resolution::FailedRef(name) => {
                skip_step(session, step, "failed_reference", &name).await?;
                continue;
            }
        };

        // A subplan past the depth bound aborts that branch only; it is
        // deterministic, so there is nothing to retry.
        if matches!(resolved, StepKind::Subplan { .. })
            && depth + 1 > services.defaults.max_subplan_depth
        {
            session
                .ledger
                .record(
                    KarmaEventKind::DepthExceeded,
                    json!({ "id": step.id, "depth": depth + 1 }),
                )
                .await?;
            if fail_step(session, step, "subplan depth exceeded").await? {
                return Ok(PlanOutcome::Halted);
            }
            continue;
        }

        session.spend.steps += 1;
        session
            .ledger
            .record(
                KarmaEventKind::StepStarted,
                json!({ "id": step.id, "kind": resolved.name(), "depth": depth }),
            )
            .await?;

        // (d) Dispatch with retries.
        let retries = step.max_retries.unwrap_or(services.defaults.step_retries);
        let mut attempt = 0u32;
        let outcome = loop {
            match dispatch(session, services, &resolved, frame, tripwires, depth).await {
                Ok(Dispatched::Value(value)) => break Ok(value),
                Ok(Dispatched::Interrupted(plan_outcome)) => {
                    // A halt raised inside a branch or subplan belongs to
                    // the session, not to this step; already recorded at
                    // the point it fired.
                    return Ok(plan_outcome);
                }
                Err(e) => {
                    let reason = e.to_string();
                    // Malformed model output is recorded and never retried.
                    let retryable = !matches!(e, EngineError::PlanMalformed(_));
                    if retryable && attempt < retries {
                        attempt += 1;
                        session
                            .ledger
                            .record(
                                KarmaEventKind::StepRetrying,
                                json!({ "id": step.id, "attempt": attempt, "error": reason }),
                            )
                            .await?;
                        continue;
                    }
                    break Err(reason);
                }
            }
        };

        match outcome {
            Ok(value) => {
                session
                    .ledger
                    .record(
                        KarmaEventKind::StepCompleted,
                        json!({ "id": step.id, "attempts": attempt + 1 }),
                    )
                    .await?;
                session
                    .dispositions
                    .insert(step.id.clone(), StepDisposition::Succeeded);
                if let Some(name) = &step.store_result_as {
                    session
                        .vars
                        .insert(name.clone(), StoredResult::Ok { value });
                }
            }
            Err(reason) => {
                if fail_step(session, step, &reason).await? {
                    return Ok(PlanOutcome::Halted);
                }
            }
        }
    }

    Ok(PlanOutcome::Completed)
}

/// Record a skip and leave a failure marker so dependents skip too.
async fn skip_step(
    session: &mut Session,
    step: &Step,
    reason: &str,
    detail: &str,
) -> EngineResult<()> {
    session
        .ledger
        .record(
            KarmaEventKind::StepSkipped,
            json!({ "id": step.id, "reason": reason, "detail": detail }),
        )
        .await?;
    session
        .dispositions
        .insert(step.id.clone(), StepDisposition::Skipped);
    if let Some(name) = &step.store_result_as {
        session.vars.insert(
            name.clone(),
            StoredResult::Failed {
                error: format!("skipped: {reason}"),
            },
        );
    }
    Ok(())
}

/// Record a terminal step failure. Returns true when the failure policy
/// halts the plan.
async fn fail_step(session: &mut Session, step: &Step, reason: &str) -> EngineResult<bool> {
    tracing::warn!(step_id = %step.id, reason, "step failed");
    session
        .ledger
        .record(
            KarmaEventKind::StepFailed,
            json!({ "id": step.id, "error": reason }),
        )
        .await?;
    session
        .dispositions
        .insert(step.id.clone(), StepDisposition::Failed);
    if let Some(name) = &step.store_result_as {
        session.vars.insert(
            name.clone(),
            StoredResult::Failed {
                error: reason.to_string(),
            },
        );
    }
    Ok(step.on_failure == Some(FailurePolicy::Halt))
}

/// Substitute variables in the fields a step kind consumes now. Nested
/// branch steps resolve when (and if) they execute, against the vars stored
/// by then.
fn resolve_kind(
    kind: &StepKind,
    vars: &HashMap<String, StoredResult>,
) -> Resolution<StepKind> {
    match kind {
        StepKind::Action { tool, input } => {
            let tool = match template::resolve_str(tool, vars) {
                Resolution::Value(v) => v,
                Resolution::FailedRef(name) => return Resolution::FailedRef(name),
            };
            match template::resolve_json(input, vars) {
                Resolution::Value(input) => Resolution::Value(StepKind::Action { tool, input }),
                Resolution::FailedRef(name) => Resolution::FailedRef(name),
            }
        }
        StepKind::Think { prompt, model } => match template::resolve_str(prompt, vars) {
            Resolution::Value(prompt) => Resolution::Value(StepKind::Think {
                prompt,
                model: model.clone(),
            }),
            Resolution::FailedRef(name) => Resolution::FailedRef(name),
        },
        StepKind::Conditional { question, branches } => {
            match template::resolve_str(question, vars) {
                Resolution::Value(question) => Resolution::Value(StepKind::Conditional {
                    question,
                    branches: branches.clone(),
                }),
                Resolution::FailedRef(name) => Resolution::FailedRef(name),
            }
        }
        StepKind::Subplan {
            goal,
            max_steps,
            max_cost_usd,
        } => match template::resolve_str(goal, vars) {
            Resolution::Value(goal) => Resolution::Value(StepKind::Subplan {
                goal,
                max_steps: *max_steps,
                max_cost_usd: *max_cost_usd,
            }),
            Resolution::FailedRef(name) => Resolution::FailedRef(name),
        },
        StepKind::Reflect => Resolution::Value(StepKind::Reflect),
    }
}

/// Result of dispatching one step: a value, or a session-level interruption
/// raised somewhere inside a nested branch.
enum Dispatched {
    Value(Value),
    Interrupted(PlanOutcome),
}

#[async_recursion]
async fn dispatch(
    session: &mut Session,
    services: &mut Services,
    kind: &StepKind,
    frame: &BudgetFrame,
    tripwires: &[SessionTripwire],
    depth: u32,
) -> EngineResult<Dispatched> {
    match kind {
        StepKind::Action { tool, input } => {
            session
                .ledger
                .record(KarmaEventKind::ToolCall, json!({ "tool": tool }))
                .await?;
            let value = services.host.invoke(tool, input.clone()).await?;
            Ok(Dispatched::Value(value))
        }

        StepKind::Think { prompt, model } => {
            let completion = call_model(session, services, model.as_deref(), prompt).await?;
            Ok(Dispatched::Value(Value::String(completion)))
        }

        StepKind::Conditional { question, branches } => {
            let choices: Vec<&str> = branches.keys().map(String::as_str).collect();
            let prompt = format!(
                "{question}\n\nAnswer with exactly one of: {}",
                choices.join(", ")
            );
            let answer = call_model(session, services, None, &prompt).await?;
            let normalized = normalize_choice(&answer);

            let branch = branches
                .iter()
                .find(|(name, _)| normalize_choice(name) == normalized);
            match branch {
                Some((name, steps)) => {
                    tracing::debug!(branch = %name, "conditional selected");
                    // Branches share this plan's frame and depth.
                    let outcome =
                        execute_steps(session, services, steps, frame, tripwires, depth).await?;
                    if outcome != PlanOutcome::Completed {
                        return Ok(Dispatched::Interrupted(outcome));
                    }
                    Ok(Dispatched::Value(Value::String(normalized)))
                }
                // No matching branch is a no-op, not a failure.
                None => Ok(Dispatched::Value(Value::String(normalized))),
            }
        }

        StepKind::Subplan {
            goal,
            max_steps,
            max_cost_usd,
        } => {
            let base = services
                .store
                .get_text(keys::PROMPT_SUBPLAN)
                .await?
                .unwrap_or_else(|| FALLBACK_SUBPLAN_PROMPT.to_string());
            let mut prompt_vars = HashMap::new();
            prompt_vars.insert("goal".to_string(), goal.clone());
            let prompt = template::render_prompt(&base, &prompt_vars);

            let content = call_model(session, services, None, &prompt).await?;
            let plan: Plan = extract_json(&content)?;
            session
                .ledger
                .record(
                    KarmaEventKind::PlanReceived,
                    json!({ "subplan": true, "goal": goal, "steps": plan.steps.len() }),
                )
                .await?;

            // Child ceilings: the tighter of the step's declaration and the
            // nested plan's own request, capped by the parent's remainder.
            let req_steps = opt_min(*max_steps, plan.session_budget.as_ref().map(|b| b.max_steps));
            let req_cost = opt_min_f64(
                *max_cost_usd,
                plan.session_budget.as_ref().map(|b| b.max_cost_usd),
            );
            let child = frame.child(&session.spend, req_steps, req_cost);

            let outcome = execute_steps(
                session,
                services,
                &plan.steps,
                &child,
                tripwires,
                depth + 1,
            )
            .await?;
            match outcome {
                // Exhausting the child's own budget is contained; the
                // parent's gate re-checks against the parent ceilings.
                PlanOutcome::Completed | PlanOutcome::BudgetExceeded => Ok(Dispatched::Value(
                    json!({ "goal": goal, "outcome": outcome }),
                )),
                other => Ok(Dispatched::Interrupted(other)),
            }
        }

        StepKind::Reflect => {
            let summary = reflect::run_review(session, services, ReviewKind::InSession).await?;
            Ok(Dispatched::Value(summary))
        }
    }
}

/// One generative call charged to the session.
async fn call_model(
    session: &mut Session,
    services: &mut Services,
    model: Option<&str>,
    prompt: &str,
) -> EngineResult<String> {
    let request = LlmRequest {
        model: model.unwrap_or(&services.defaults.model).to_string(),
        max_tokens: services.defaults.max_tokens,
        messages: vec![LlmMessage::user(prompt)],
        thinking: Some(Thinking {
            effort: session.effort,
        }),
    };
    let completion = services
        .cascade
        .complete(&mut session.ledger, &request)
        .await?;
    session.spend.cost_usd += completion.cost_usd.unwrap_or(0.0);
    Ok(completion.content)
}

fn normalize_choice(answer: &str) -> String {
    answer
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c == '.' || c == '!' || c == ':')
        .to_lowercase()
}

fn opt_min(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn opt_min_f64(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
