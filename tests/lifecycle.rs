//! End-to-end wake cycles against a temp store, a mock sandbox runtime, and
//! a scripted provider sitting at the cascade's built-in tier.

use std::sync::Arc;

use serde_json::json;

use swayambhu::karma::{KarmaEventKind, KarmaLedger};
use swayambhu::lifecycle::{Swayambhu, WakeOutcome};
use swayambhu::store::{keys, FileKvStore, Store};
use swayambhu::test_support::{ScriptedLlm, ToolRuntime};
use swayambhu::types::{Breadcrumb, DeepReflectSchedule, Effort, SessionRecord, WakeConfig};

struct World {
    _dir: tempfile::TempDir,
    store: Store,
    runtime: Arc<ToolRuntime>,
    llm: Arc<ScriptedLlm>,
    engine: Swayambhu,
}

fn world(replies: Vec<Result<String, String>>) -> World {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(Arc::new(FileKvStore::new(dir.path()).unwrap()));
    let runtime = ToolRuntime::new();
    let llm = ScriptedLlm::new(replies);
    let engine = Swayambhu::new(store.clone(), runtime.clone(), llm.clone());
    World {
        _dir: dir,
        store,
        runtime,
        llm,
        engine,
    }
}

async fn seed_planning_template(store: &Store) {
    store
        .put(
            keys::PROMPT_PLANNING,
            &json!("Plan the session.\nGround truth: {{ground_truth}}\nCrash: {{crash}}"),
        )
        .await
        .unwrap();
}

fn completed_session_id(outcome: &WakeOutcome) -> String {
    match outcome {
        WakeOutcome::Completed { session_id, .. } => session_id.clone(),
        other => panic!("expected completion, got {other:?}"),
    }
}

async fn session_events(store: &Store, session_id: &str) -> Vec<KarmaEventKind> {
    KarmaLedger::load(store, session_id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.kind)
        .collect()
}

#[tokio::test]
async fn future_next_wake_is_a_no_op_tick() {
    let w = world(vec![]);
    w.store
        .put_json(
            keys::WAKE_CONFIG,
            &WakeConfig {
                next_wake: Some(chrono::Utc::now() + chrono::Duration::hours(2)),
                effort: None,
                overrides: None,
            },
        )
        .await
        .unwrap();

    let outcome = w.engine.wake().await.unwrap();
    assert!(matches!(outcome, WakeOutcome::Asleep { .. }));
    // Nothing ran: no breadcrumb, no session log, no counter.
    assert!(w.store.get(keys::BREADCRUMB).await.unwrap().is_none());
    assert!(w.store.keys("karma:").await.unwrap().is_empty());
}

#[tokio::test]
async fn normal_session_plans_executes_and_cleans_up() {
    let plan = json!({
        "session_plan": "check in and notify",
        "steps": [
            {"id": "s1", "kind": "action", "tool": "notify", "input": {"message": "hello"}}
        ]
    });
    let w = world(vec![Ok(plan.to_string())]);
    seed_planning_template(&w.store).await;
    w.store
        .put(&keys::tool_code("notify"), &json!("{\"sent\": true}"))
        .await
        .unwrap();

    let outcome = w.engine.wake().await.unwrap();
    let session_id = completed_session_id(&outcome);

    assert_eq!(w.runtime.calls_to("notify").len(), 1);
    assert!(w.store.get(keys::BREADCRUMB).await.unwrap().is_none());
    assert_eq!(
        w.store
            .get_json::<u64>(keys::SESSION_COUNTER)
            .await
            .unwrap(),
        Some(1)
    );
    let record = w
        .store
        .get_json::<SessionRecord>(keys::SESSION_LAST_COMPLETED)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.session_id, session_id);
    assert_eq!(record.steps, 1);

    let events = session_events(&w.store, &session_id).await;
    assert!(events.contains(&KarmaEventKind::PlanReceived));
    assert!(events.contains(&KarmaEventKind::ToolCall));
    assert_eq!(*events.last().unwrap(), KarmaEventKind::SessionCompleted);

    // The default sleep was scheduled into the future.
    let wake_cfg = w
        .store
        .get_json::<WakeConfig>(keys::WAKE_CONFIG)
        .await
        .unwrap()
        .unwrap();
    assert!(wake_cfg.next_wake.unwrap() > chrono::Utc::now());
}

#[tokio::test]
async fn crash_context_is_the_dead_sessions_full_trail() {
    let w = world(vec![Ok(json!({"steps": []}).to_string())]);
    seed_planning_template(&w.store).await;

    // A predecessor that died mid-sequence: breadcrumb intact, log ends
    // abruptly.
    let mut dead = KarmaLedger::new("dead-1", w.store.clone());
    dead.record(KarmaEventKind::SessionStarted, json!({"session_id": "dead-1"}))
        .await
        .unwrap();
    dead.record(KarmaEventKind::StepStarted, json!({"id": "s7"}))
        .await
        .unwrap();
    drop(dead);
    w.store
        .put_json(
            keys::BREADCRUMB,
            &Breadcrumb {
                session_id: "dead-1".to_string(),
                started_at: chrono::Utc::now(),
            },
        )
        .await
        .unwrap();

    let outcome = w.engine.wake().await.unwrap();
    let session_id = completed_session_id(&outcome);

    // The crash context handed to planning is exactly the persisted trail:
    // the full entry list plus its last entry, nothing lost or fabricated.
    let persisted = KarmaLedger::load(&w.store, "dead-1").await.unwrap();
    assert_eq!(persisted.len(), 2);
    let expected = json!({
        "session_id": "dead-1",
        "last": persisted.last(),
        "events": &persisted,
    })
    .to_string();
    let requests = w.llm.requests();
    assert_eq!(requests.len(), 1);
    assert!(
        requests[0].messages[0].content.contains(&expected),
        "planning prompt missing the crash trail"
    );

    let events = session_events(&w.store, &session_id).await;
    assert!(events.contains(&KarmaEventKind::CrashDetected));
    // The recovered wake completed cleanly, so its own breadcrumb is gone.
    assert!(w.store.get(keys::BREADCRUMB).await.unwrap().is_none());
}

#[tokio::test]
async fn ground_truth_failures_degrade_to_null_and_tripwires_escalate() {
    let w = world(vec![Ok(json!({"steps": []}).to_string())]);
    seed_planning_template(&w.store).await;
    w.store
        .put(&keys::tool_code("credit_check"), &json!("{\"balance\": 3.5}"))
        .await
        .unwrap();
    w.store
        .put(&keys::tool_code("wallet_check"), &json!("FAIL"))
        .await
        .unwrap();
    w.store
        .put(
            keys::CONFIG_RESOURCES,
            &json!({"accounts": [
                {"name": "credit", "checker": "credit_check"},
                {"name": "wallet", "checker": "wallet_check"}
            ]}),
        )
        .await
        .unwrap();
    w.store
        .put(
            keys::CONFIG_DEFAULTS,
            &json!({"tripwires": [
                {"path": "ground_truth.credit.balance", "op": "below", "value": 5.0, "raise_to": "high"}
            ]}),
        )
        .await
        .unwrap();

    let outcome = w.engine.wake().await.unwrap();
    let session_id = completed_session_id(&outcome);

    let entries = KarmaLedger::load(&w.store, &session_id).await.unwrap();
    let ground_truth = entries
        .iter()
        .find(|e| e.kind == KarmaEventKind::GroundTruth)
        .unwrap();
    assert_eq!(ground_truth.payload["balances"]["credit"]["balance"], 3.5);
    // The failing checker degraded to null instead of aborting the fetch.
    assert_eq!(ground_truth.payload["balances"]["wallet"], json!(null));
    assert!(ground_truth.payload["errors"]["wallet"].is_string());

    assert!(entries
        .iter()
        .any(|e| e.kind == KarmaEventKind::EffortEscalated));
    let requests = w.llm.requests();
    assert_eq!(requests[0].thinking.as_ref().unwrap().effort, Effort::High);
}

#[tokio::test]
async fn deep_review_runs_when_the_counter_interval_fires() {
    let review = json!({
        "reflection": "ten sessions in",
        "note_to_future_self": "stay the course",
        "updated_wisdom": "distilled"
    });
    let w = world(vec![Ok(review.to_string())]);
    w.store
        .put_json(keys::SESSION_COUNTER, &10u64)
        .await
        .unwrap();

    let outcome = w.engine.wake().await.unwrap();
    assert!(matches!(
        outcome,
        WakeOutcome::Completed {
            deep_review: true,
            ..
        }
    ));

    let schedule = w
        .store
        .get_json::<DeepReflectSchedule>(keys::DEEP_REFLECT_SCHEDULE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(schedule.last_session_count, 10);
    assert_eq!(
        w.store.get(keys::WISDOM).await.unwrap().unwrap(),
        json!("distilled")
    );
    assert_eq!(
        w.store
            .get_json::<u64>(keys::SESSION_COUNTER)
            .await
            .unwrap(),
        Some(11)
    );
}

#[tokio::test]
async fn day_interval_alone_triggers_deep_review() {
    let review = json!({
        "reflection": "calendar fired",
        "note_to_future_self": "ok"
    });
    let w = world(vec![Ok(review.to_string())]);
    // Session interval far away (1 of 10), day interval long past.
    w.store.put_json(keys::SESSION_COUNTER, &1u64).await.unwrap();
    w.store
        .put_json(
            keys::DEEP_REFLECT_SCHEDULE,
            &DeepReflectSchedule {
                last_at: chrono::Utc::now() - chrono::Duration::days(30),
                last_session_count: 0,
            },
        )
        .await
        .unwrap();

    let outcome = w.engine.wake().await.unwrap();
    assert!(matches!(
        outcome,
        WakeOutcome::Completed {
            deep_review: true,
            ..
        }
    ));
}

#[tokio::test]
async fn malformed_plan_ends_the_session_without_steps() {
    let w = world(vec![Ok("I will not be producing JSON today".to_string())]);
    seed_planning_template(&w.store).await;

    let outcome = w.engine.wake().await.unwrap();
    let session_id = completed_session_id(&outcome);

    let events = session_events(&w.store, &session_id).await;
    assert!(events.contains(&KarmaEventKind::PlanMalformed));
    assert!(!events.contains(&KarmaEventKind::StepStarted));
    // No retry: exactly one planning call.
    assert_eq!(w.llm.requests().len(), 1);
    // Still a clean completion.
    assert!(w.store.get(keys::BREADCRUMB).await.unwrap().is_none());
    assert_eq!(
        w.store
            .get_json::<u64>(keys::SESSION_COUNTER)
            .await
            .unwrap(),
        Some(1)
    );
}

#[tokio::test]
async fn hard_provider_failure_leaves_the_breadcrumb_for_recovery() {
    // Every tier fails on both the requested and the fallback model.
    let w = world(vec![]);
    seed_planning_template(&w.store).await;

    let err = w.engine.wake().await.unwrap_err();
    assert!(matches!(err, swayambhu::EngineError::Provider(_)));

    // The breadcrumb stays so the next wake treats this as a crash, and the
    // dead session's trail ends with the fatal entry.
    let crumb = w
        .store
        .get_json::<Breadcrumb>(keys::BREADCRUMB)
        .await
        .unwrap()
        .expect("breadcrumb must survive a fatal session");
    let events = session_events(&w.store, &crumb.session_id).await;
    assert_eq!(*events.last().unwrap(), KarmaEventKind::Fatal);
}

#[tokio::test]
async fn identity_key_rejects_engine_writes_forever() {
    let w = world(vec![]);
    for _ in 0..3 {
        let err = w.store.put(keys::SOUL, &json!("new identity")).await;
        assert!(matches!(
            err,
            Err(swayambhu::EngineError::ProtectedKey(_))
        ));
        w.store.put("anything:else", &json!(1)).await.unwrap();
    }
}
