//! Session lifecycle: the sole entry point `wake()`, invoked once per timer
//! tick.
//!
//! Sleep gating, crash detection via the breadcrumb, ground-truth fan-out,
//! configuration merge, tripwire evaluation, dispatch to a normal planning
//! session or the periodic deep review, and bookkeeping. On any unhandled
//! failure the breadcrumb is deliberately left in place so the next wake
//! treats this session as a crash and hands its full trail to planning.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use crate::budget::BudgetFrame;
use crate::capability::CapabilityHost;
use crate::config::{
    apply_tripwires, merge_overrides, EngineDefaults, ModelRegistry, ResourceRegistry,
};
use crate::errors::{EngineError, EngineResult};
use crate::karma::{KarmaEvent, KarmaEventKind, KarmaLedger};
use crate::llm::{extract_json, LlmMessage, LlmProvider, LlmRequest, ProviderCascade, Thinking};
use crate::orchestrator::{execute_steps, PlanOutcome};
use crate::reflect::{run_review, ReviewKind};
use crate::sandbox::SandboxRuntime;
use crate::session::{Services, Session};
use crate::store::{keys, Store};
use crate::types::{Breadcrumb, DeepReflectSchedule, Effort, Plan, SessionRecord, WakeConfig};

/// How many completed-session records the rolling history keeps.
const RECENT_SESSIONS_KEPT: usize = 10;

pub struct Swayambhu {
    store: Store,
    runtime: Arc<dyn SandboxRuntime>,
    builtin: Arc<dyn LlmProvider>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WakeOutcome {
    /// The scheduled next wake is still in the future; nothing ran.
    Asleep { until: DateTime<Utc> },
    Completed {
        session_id: String,
        deep_review: bool,
    },
}

impl Swayambhu {
    pub fn new(
        store: Store,
        runtime: Arc<dyn SandboxRuntime>,
        builtin: Arc<dyn LlmProvider>,
    ) -> Self {
        Self {
            store,
            runtime,
            builtin,
        }
    }

    pub async fn wake(&self) -> EngineResult<WakeOutcome> {
        let now = Utc::now();

        // 1. Sleep gate.
        let wake_cfg = self
            .store
            .get_json::<WakeConfig>(keys::WAKE_CONFIG)
            .await?
            .unwrap_or_default();
        if let Some(next) = wake_cfg.next_wake {
            if next > now {
                tracing::debug!(until = %next, "not due yet");
                return Ok(WakeOutcome::Asleep { until: next });
            }
        }

        // 2. A breadcrumb with no matching completion *is* the crash signal.
        let crash = match self.store.get_json::<Breadcrumb>(keys::BREADCRUMB).await? {
            Some(crumb) => {
                let entries = KarmaLedger::load(&self.store, &crumb.session_id).await?;
                Some((crumb, entries))
            }
            None => None,
        };

        let mut session = Session::new(self.store.clone(), Effort::default());

        // 3. The breadcrumb is the sole crash-detection mechanism; failing to
        // write it aborts the session rather than running untracked.
        self.store
            .put_json(
                keys::BREADCRUMB,
                &Breadcrumb {
                    session_id: session.id.clone(),
                    started_at: session.started_at,
                },
            )
            .await
            .map_err(|e| EngineError::Breadcrumb(e.to_string()))?;

        match self.run_session(&mut session, crash, &wake_cfg, now).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!(error = %e, session_id = %session.id, "session died");
                // Best effort: the breadcrumb stays so the next wake recovers.
                let _ = session
                    .ledger
                    .record(KarmaEventKind::Fatal, json!({ "error": e.to_string() }))
                    .await;
                Err(e)
            }
        }
    }

    async fn run_session(
        &self,
        session: &mut Session,
        crash: Option<(Breadcrumb, Vec<KarmaEvent>)>,
        wake_cfg: &WakeConfig,
        now: DateTime<Utc>,
    ) -> EngineResult<WakeOutcome> {
        session
            .ledger
            .record(
                KarmaEventKind::SessionStarted,
                json!({ "session_id": session.id, "crashed_predecessor": crash.is_some() }),
            )
            .await?;

        let crash_context = match &crash {
            Some((crumb, entries)) => {
                session
                    .ledger
                    .record(
                        KarmaEventKind::CrashDetected,
                        json!({
                            "session_id": crumb.session_id,
                            "started_at": crumb.started_at,
                            "entry_count": entries.len(),
                            "last": entries.last(),
                        }),
                    )
                    .await?;
                Some(json!({
                    "session_id": crumb.session_id,
                    "last": entries.last(),
                    "events": entries,
                }))
            }
            None => None,
        };

        // 5. Configuration: defaults + standing overrides, registries,
        // identity. Garbage in the defaults document degrades to built-ins
        // rather than killing the wake.
        let mut defaults_doc = self
            .store
            .get(keys::CONFIG_DEFAULTS)
            .await?
            .unwrap_or_else(|| json!({}));
        if let Some(overrides) = &wake_cfg.overrides {
            merge_overrides(&mut defaults_doc, overrides);
        }
        let defaults: EngineDefaults = serde_json::from_value(defaults_doc).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "unusable config:defaults, using built-ins");
            EngineDefaults::default()
        });
        let models = self
            .store
            .get_json::<ModelRegistry>(keys::CONFIG_MODELS)
            .await?
            .unwrap_or_default();
        let resources = self
            .store
            .get_json::<ResourceRegistry>(keys::CONFIG_RESOURCES)
            .await?
            .unwrap_or_default();

        let mut services = Services {
            host: CapabilityHost::new(self.store.clone(), self.runtime.clone()),
            cascade: ProviderCascade::new(
                self.store.clone(),
                self.runtime.clone(),
                self.builtin.clone(),
                models,
                defaults.fallback_model.clone(),
            ),
            store: self.store.clone(),
            defaults,
        };

        // 4. Ground truth the model cannot hallucinate, fetched in parallel;
        // individual checker failures degrade to null.
        let ground_truth = fetch_ground_truth(session, &mut services, &resources).await?;

        // 6. Tripwires against live data; effort only ever escalates.
        let mut effort = wake_cfg.effort.unwrap_or(services.defaults.effort);
        let previous = self
            .store
            .get_json::<SessionRecord>(keys::SESSION_LAST_COMPLETED)
            .await?
            .map(|r| json!({ "ground_truth": r.ground_truth }))
            .unwrap_or_else(|| json!({}));
        let counter = self
            .store
            .get_json::<u64>(keys::SESSION_COUNTER)
            .await?
            .unwrap_or(0);
        let live = json!({ "ground_truth": ground_truth, "session_counter": counter });
        let (escalated, fired) = apply_tripwires(effort, &services.defaults.tripwires, &live, &previous);
        for rule in fired {
            session
                .ledger
                .record(
                    KarmaEventKind::TripwireFired,
                    json!({ "path": rule.path, "op": rule.op, "raise_to": rule.raise_to }),
                )
                .await?;
        }
        if escalated > effort {
            session
                .ledger
                .record(
                    KarmaEventKind::EffortEscalated,
                    json!({ "from": effort, "to": escalated }),
                )
                .await?;
        }
        effort = escalated;
        session.effort = effort;

        // 7. Periodic deep self-review, or the normal planning session.
        let deep_due = self.deep_review_due(&services.defaults, counter, now).await?;
        if deep_due {
            match run_review(session, &mut services, ReviewKind::Deep).await {
                Ok(_) => {}
                // A malformed review is recorded and ends the session; it is
                // not a crash.
                Err(EngineError::PlanMalformed(_)) => {}
                Err(other) => return Err(other),
            }
        } else {
            self.plan_and_execute(session, &mut services, crash_context.as_ref(), &ground_truth)
                .await?;
        }

        // 8. Bookkeeping, then the breadcrumb goes away.
        session
            .ledger
            .record(
                KarmaEventKind::SessionCompleted,
                json!({
                    "cost_usd": session.spend.cost_usd,
                    "steps": session.spend.steps,
                    "deep_review": deep_due,
                }),
            )
            .await?;

        let record = SessionRecord {
            session_id: session.id.clone(),
            completed_at: now,
            cost_usd: session.spend.cost_usd,
            steps: session.spend.steps,
            ground_truth,
            deep_review: deep_due,
        };
        self.store
            .put_json(keys::SESSION_LAST_COMPLETED, &record)
            .await?;
        let mut recent = self
            .store
            .get_json::<Vec<SessionRecord>>(keys::SESSION_RECENT)
            .await?
            .unwrap_or_default();
        recent.push(record);
        if recent.len() > RECENT_SESSIONS_KEPT {
            let drop = recent.len() - RECENT_SESSIONS_KEPT;
            recent.drain(..drop);
        }
        self.store.put_json(keys::SESSION_RECENT, &recent).await?;
        self.store
            .put_json(keys::SESSION_COUNTER, &(counter + 1))
            .await?;

        // A review may already have scheduled the next wake; only fill in
        // the default sleep when nothing in the future is set.
        let mut wake_cfg = self
            .store
            .get_json::<WakeConfig>(keys::WAKE_CONFIG)
            .await?
            .unwrap_or_default();
        if wake_cfg.next_wake.map_or(true, |t| t <= now) {
            wake_cfg.next_wake = Some(now + Duration::minutes(services.defaults.sleep_minutes));
            self.store.put_json(keys::WAKE_CONFIG, &wake_cfg).await?;
        }

        self.store.delete(keys::BREADCRUMB).await?;
        tracing::info!(
            session_id = %session.id,
            cost_usd = session.spend.cost_usd,
            steps = session.spend.steps,
            deep_review = deep_due,
            "session completed"
        );
        Ok(WakeOutcome::Completed {
            session_id: session.id.clone(),
            deep_review: deep_due,
        })
    }

    /// Due when no schedule exists and the lifetime counter reached the
    /// first-review threshold, or when either the session interval or the
    /// day interval has elapsed; an OR, whichever fires first.
    async fn deep_review_due(
        &self,
        defaults: &EngineDefaults,
        counter: u64,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        Ok(
            match self
                .store
                .get_json::<DeepReflectSchedule>(keys::DEEP_REFLECT_SCHEDULE)
                .await?
            {
                None => counter >= defaults.deep_review_after_sessions,
                Some(schedule) => {
                    counter.saturating_sub(schedule.last_session_count)
                        >= defaults.deep_review_interval_sessions
                        || (now - schedule.last_at).num_days() >= defaults.deep_review_interval_days
                }
            },
        )
    }

    async fn plan_and_execute(
        &self,
        session: &mut Session,
        services: &mut Services,
        crash_context: Option<&Value>,
        ground_truth: &Value,
    ) -> EngineResult<()> {
        let Some(template) = self.store.get_text(keys::PROMPT_PLANNING).await? else {
            // Seeding is external; an unseeded engine records the gap and
            // sleeps instead of inventing its own instructions.
            session
                .ledger
                .record(
                    KarmaEventKind::PlanMalformed,
                    json!({ "in": "planning", "error": "planning template missing" }),
                )
                .await?;
            return Ok(());
        };

        let identity = self.store.get_text(keys::SOUL).await?.unwrap_or_default();
        let wisdom = self.store.get_text(keys::WISDOM).await?.unwrap_or_default();
        let note = self
            .store
            .get_json::<crate::types::ReviewOutput>(keys::LAST_REFLECT)
            .await?
            .map(|r| r.note_to_future_self)
            .unwrap_or_default();

        let mut replan_context: Option<String> = None;
        loop {
            let mut vars = HashMap::new();
            vars.insert("identity".to_string(), identity.clone());
            vars.insert("wisdom".to_string(), wisdom.clone());
            vars.insert("note".to_string(), note.clone());
            vars.insert("ground_truth".to_string(), ground_truth.to_string());
            vars.insert("effort".to_string(), session.effort.as_str().to_string());
            vars.insert(
                "budget".to_string(),
                serde_json::to_string(&services.defaults.session_budget)?,
            );
            vars.insert(
                "crash".to_string(),
                crash_context.map(|c| c.to_string()).unwrap_or_default(),
            );
            vars.insert(
                "replan".to_string(),
                replan_context.clone().unwrap_or_default(),
            );
            let prompt = crate::template::render_prompt(&template, &vars);

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

            let plan: Plan = match extract_json(&completion.content) {
                Ok(plan) => plan,
                Err(e) => {
                    // Recorded, and the session ends without executing
                    // steps. No retry.
                    session
                        .ledger
                        .record(
                            KarmaEventKind::PlanMalformed,
                            json!({ "in": "planning", "error": e.to_string() }),
                        )
                        .await?;
                    return Ok(());
                }
            };
            session
                .ledger
                .record(
                    KarmaEventKind::PlanReceived,
                    json!({
                        "steps": plan.steps.len(),
                        "session_plan": plan.session_plan,
                        "replan": replan_context.is_some(),
                    }),
                )
                .await?;

            // A plan may narrow its own budget, never widen past defaults.
            let limits = match &plan.session_budget {
                Some(requested) => requested.clamp_to(&services.defaults.session_budget),
                None => services.defaults.session_budget.clone(),
            };
            let frame = BudgetFrame::root(&limits, session.started);

            let outcome = execute_steps(
                session,
                services,
                &plan.steps,
                &frame,
                &plan.mid_session_tripwires,
                0,
            )
            .await?;

            if outcome == PlanOutcome::ReplanRequested && !session.replanned {
                session.replanned = true;
                replan_context = Some(format!(
                    "a tripwire requested a re-plan after {} steps; dispositions: {}",
                    session.spend.steps,
                    serde_json::to_string(&session.dispositions)?
                ));
                continue;
            }
            return Ok(());
        }
    }
}

/// Fan out over the configured checker capabilities; join before
/// proceeding. Partial failures degrade to null values, never abort the
/// fetch.
async fn fetch_ground_truth(
    session: &mut Session,
    services: &mut Services,
    resources: &ResourceRegistry,
) -> EngineResult<Value> {
    let mut loaded = Vec::with_capacity(resources.accounts.len());
    for account in &resources.accounts {
        let capability = services.host.load(&account.checker).await;
        loaded.push((account, capability));
    }

    let host = &services.host;
    let checks = loaded.iter().map(|(account, capability)| async move {
        match capability {
            Ok((code, meta)) => match host
                .invoke_dynamic(&account.checker, code, meta, account.params.clone())
                .await
            {
                Ok(value) => (account.name.clone(), value, None),
                Err(e) => (account.name.clone(), Value::Null, Some(e.to_string())),
            },
            Err(e) => (account.name.clone(), Value::Null, Some(e.to_string())),
        }
    });
    let results = futures::future::join_all(checks).await;

    let mut balances = serde_json::Map::new();
    let mut errors = serde_json::Map::new();
    for (name, value, error) in results {
        balances.insert(name.clone(), value);
        if let Some(error) = error {
            tracing::warn!(account = %name, error = %error, "ground-truth checker failed");
            errors.insert(name, Value::String(error));
        }
    }
    let ground_truth = Value::Object(balances);
    session
        .ledger
        .record(
            KarmaEventKind::GroundTruth,
            json!({ "balances": ground_truth, "errors": errors }),
        )
        .await?;
    Ok(ground_truth)
}
