//! Per-session flight recorder.
//!
//! Every notable event lands here, and each append durably persists the
//! *entire* accumulated log before returning. Write-amplifying on purpose:
//! after any crash the persisted log is complete up to the last recorded
//! entry, with no buffering gap. Entries are hash-chained so a tampered or
//! truncated-in-the-middle log is detectable.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::errors::EngineResult;
use crate::store::{keys, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KarmaEventKind {
    SessionStarted,
    CrashDetected,
    GroundTruth,
    EffortEscalated,
    PlanReceived,
    PlanMalformed,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepRetrying,
    StepSkipped,
    BudgetExceeded,
    TripwireFired,
    ReplanRequested,
    DepthExceeded,
    LlmCall,
    LlmTierFallback,
    LlmModelFallback,
    ToolCall,
    ReflectApplied,
    ReviewRejectedWrite,
    DeepReview,
    SessionCompleted,
    Fatal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KarmaEvent {
    pub kind: KarmaEventKind,
    pub payload: Value,
    pub at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub chain_hash: String,
}

/// Append-only event log for one session, flushed to `karma:{session}` on
/// every append.
pub struct KarmaLedger {
    session_id: String,
    started: Instant,
    entries: Vec<KarmaEvent>,
    store: Store,
}

impl KarmaLedger {
    pub fn new(session_id: impl Into<String>, store: Store) -> Self {
        Self {
            session_id: session_id.into(),
            started: Instant::now(),
            entries: Vec::new(),
            store,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn entries(&self) -> &[KarmaEvent] {
        &self.entries
    }

    /// Append one entry and synchronously persist the full log.
    pub async fn record(&mut self, kind: KarmaEventKind, payload: Value) -> EngineResult<()> {
        let at = Utc::now();
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        let prev = self.entries.last().map(|e| e.chain_hash.as_str());
        let chain_hash = chain_hash(prev, &kind, &payload, &at, elapsed_ms);

        tracing::debug!(
            session_id = %self.session_id,
            kind = ?kind,
            "karma event"
        );

        self.entries.push(KarmaEvent {
            kind,
            payload,
            at,
            elapsed_ms,
            chain_hash,
        });
        self.store
            .put_json(&keys::karma(&self.session_id), &self.entries)
            .await
    }

    /// Load the persisted log for a (possibly dead) session.
    pub async fn load(store: &Store, session_id: &str) -> EngineResult<Vec<KarmaEvent>> {
        Ok(store
            .get_json::<Vec<KarmaEvent>>(&keys::karma(session_id))
            .await?
            .unwrap_or_default())
    }

    /// Recompute the hash chain over a persisted log.
    pub fn verify_integrity(entries: &[KarmaEvent]) -> bool {
        let mut prev: Option<&str> = None;
        for entry in entries {
            let expected = chain_hash(prev, &entry.kind, &entry.payload, &entry.at, entry.elapsed_ms);
            if entry.chain_hash != expected {
                return false;
            }
            prev = Some(entry.chain_hash.as_str());
        }
        true
    }
}

fn chain_hash(
    prev: Option<&str>,
    kind: &KarmaEventKind,
    payload: &Value,
    at: &DateTime<Utc>,
    elapsed_ms: u64,
) -> String {
    let mut hasher = Sha256::new();
    if let Some(prev) = prev {
        hasher.update(prev.as_bytes());
    }
    // Serialization of an enum tag and a Value is deterministic enough for a
    // tamper check; this is forensics, not cryptographic provenance.
    hasher.update(serde_json::to_string(kind).unwrap_or_default().as_bytes());
    hasher.update(payload.to_string().as_bytes());
    hasher.update(at.to_rfc3339().as_bytes());
    hasher.update(elapsed_ms.to_le_bytes());
    format!("{:x}", hasher.finalize())
}
