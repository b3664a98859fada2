//! Review passes: the engine's only sanctioned path for mutating its own
//! durable instructions.
//!
//! An in-session `reflect` step and the periodic deep review share one
//! mechanism: build a prompt over recent history and durable state, ask the
//! model for a structured review object, and apply its mutations, every
//! store operation individually guarded, with a write against the identity
//! key rejected and recorded rather than applied.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::{json, Value};

use crate::config::merge_overrides;
use crate::errors::{EngineError, EngineResult};
use crate::karma::{KarmaEventKind, KarmaLedger};
use crate::llm::{extract_json, LlmMessage, LlmRequest, Thinking};
use crate::session::{Services, Session};
use crate::store::keys;
use crate::template::render_prompt;
use crate::types::{DeepReflectSchedule, KvOpKind, ReviewOutput, SessionRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewKind {
    InSession,
    Deep,
}

/// Built-in format contract, used when no review template is seeded.
const FALLBACK_REVIEW_PROMPT: &str = "Review the recent activity below and respond with a JSON \
object {\"session_summary\": \"...\", \"note_to_future_self\": \"...\", \"kv_operations\": [], \
\"updated_wisdom\": null}.\n\nIdentity:\n{{identity}}\n\nWisdom:\n{{wisdom}}\n\nRecent \
activity:\n{{karma}}";

/// Run one review pass and apply its output. Returns the applied summary.
pub async fn run_review(
    session: &mut Session,
    services: &mut Services,
    kind: ReviewKind,
) -> EngineResult<Value> {
    let template_key = match kind {
        ReviewKind::InSession => keys::PROMPT_REFLECT,
        ReviewKind::Deep => keys::PROMPT_DEEP_REFLECT,
    };
    let base = services
        .store
        .get_text(template_key)
        .await?
        .unwrap_or_else(|| FALLBACK_REVIEW_PROMPT.to_string());

    let mut vars = HashMap::new();
    vars.insert(
        "identity".to_string(),
        services
            .store
            .get_text(keys::SOUL)
            .await?
            .unwrap_or_default(),
    );
    vars.insert(
        "wisdom".to_string(),
        services
            .store
            .get_text(keys::WISDOM)
            .await?
            .unwrap_or_default(),
    );
    vars.insert(
        "karma".to_string(),
        serde_json::to_string(session.ledger.entries())?,
    );
    if kind == ReviewKind::Deep {
        vars.insert("history".to_string(), recent_history(services).await?);
    }
    let prompt = render_prompt(&base, &vars);

    let request = LlmRequest {
        model: services.defaults.model.clone(),
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

    let output: ReviewOutput = match extract_json(&completion.content) {
        Ok(output) => output,
        Err(e) => {
            session
                .ledger
                .record(
                    KarmaEventKind::PlanMalformed,
                    json!({ "in": "review", "error": e.to_string() }),
                )
                .await?;
            return Err(e);
        }
    };

    apply_review(session, services, kind, &output).await?;

    Ok(json!({
        "reflection": output.reflection,
        "note_to_future_self": output.note_to_future_self,
    }))
}

async fn apply_review(
    session: &mut Session,
    services: &mut Services,
    kind: ReviewKind,
    output: &ReviewOutput,
) -> EngineResult<()> {
    let mut violations = 0usize;
    for op in &output.kv_operations {
        let result = match op.op {
            KvOpKind::Put => {
                services
                    .store
                    .put(&op.key, op.value.as_ref().unwrap_or(&Value::Null))
                    .await
            }
            KvOpKind::Delete => services.store.delete(&op.key).await.map(|_| ()),
            KvOpKind::Rename => match &op.to {
                Some(to) => services.store.rename(&op.key, to).await.map(|_| ()),
                None => {
                    record_rejected(&mut session.ledger, &op.key, "rename without target").await?;
                    continue;
                }
            },
        };
        match result {
            Ok(()) => {}
            Err(EngineError::ProtectedKey(key)) => {
                // Rejected and surfaced, never silently dropped; the rest of
                // the review still applies.
                violations += 1;
                record_rejected(&mut session.ledger, &key, "protected key").await?;
            }
            Err(other) => return Err(other),
        }
    }

    if let Some(wisdom) = &output.updated_wisdom {
        services.store.put(keys::WISDOM, &json!(wisdom)).await?;
    }
    if let Some(updates) = &output.updated_defaults {
        let mut base = services
            .store
            .get(keys::CONFIG_DEFAULTS)
            .await?
            .unwrap_or_else(|| json!({}));
        merge_overrides(&mut base, updates);
        services.store.put(keys::CONFIG_DEFAULTS, &base).await?;
    }
    if let Some(wake) = &output.next_wake_config {
        services.store.put_json(keys::WAKE_CONFIG, wake).await?;
    }
    services.store.put_json(keys::LAST_REFLECT, output).await?;

    if kind == ReviewKind::Deep {
        let counter = services
            .store
            .get_json::<u64>(keys::SESSION_COUNTER)
            .await?
            .unwrap_or(0);
        services
            .store
            .put_json(
                keys::DEEP_REFLECT_SCHEDULE,
                &DeepReflectSchedule {
                    last_at: Utc::now(),
                    last_session_count: counter,
                },
            )
            .await?;
    }

    session
        .ledger
        .record(
            match kind {
                ReviewKind::InSession => KarmaEventKind::ReflectApplied,
                ReviewKind::Deep => KarmaEventKind::DeepReview,
            },
            json!({
                "kv_operations": output.kv_operations.len(),
                "rejected_writes": violations,
                "updated_wisdom": output.updated_wisdom.is_some(),
                "updated_defaults": output.updated_defaults.is_some(),
                "next_wake_config": output.next_wake_config.is_some(),
            }),
        )
        .await
}

async fn record_rejected(
    ledger: &mut KarmaLedger,
    key: &str,
    reason: &str,
) -> EngineResult<()> {
    tracing::warn!(key, reason, "review write rejected");
    ledger
        .record(
            KarmaEventKind::ReviewRejectedWrite,
            json!({ "key": key, "reason": reason }),
        )
        .await
}

/// Karma logs of the most recent completed sessions, for the deep review's
/// longer look back.
async fn recent_history(services: &mut Services) -> EngineResult<String> {
    let recent = services
        .store
        .get_json::<Vec<SessionRecord>>(keys::SESSION_RECENT)
        .await?
        .unwrap_or_default();
    let take = services.defaults.deep_review_history;
    let mut history = Vec::new();
    for record in recent.iter().rev().take(take) {
        let entries = KarmaLedger::load(&services.store, &record.session_id).await?;
        history.push(json!({
            "session_id": record.session_id,
            "completed_at": record.completed_at,
            "cost_usd": record.cost_usd,
            "events": entries,
        }));
    }
    Ok(serde_json::to_string(&history)?)
}
