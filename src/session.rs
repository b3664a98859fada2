//! Explicit per-session context threaded through every component, with no
//! hidden globals. Constructed at wake, dropped at sleep; only what was
//! written to the store survives it.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::budget::BudgetSpend;
use crate::capability::CapabilityHost;
use crate::config::EngineDefaults;
use crate::karma::KarmaLedger;
use crate::llm::ProviderCascade;
use crate::store::Store;
use crate::types::{Effort, StepDisposition, StoredResult};

pub struct Session {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub started: Instant,
    pub effort: Effort,
    pub spend: BudgetSpend,
    /// Stored step results, keyed by `store_result_as` name.
    pub vars: HashMap<String, StoredResult>,
    /// How each executed step ended, keyed by step id.
    pub dispositions: HashMap<String, StepDisposition>,
    pub ledger: KarmaLedger,
    /// At most one re-plan round per session.
    pub replanned: bool,
}

impl Session {
    pub fn new(store: Store, effort: Effort) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            ledger: KarmaLedger::new(id.clone(), store),
            id,
            started_at: Utc::now(),
            started: Instant::now(),
            effort,
            spend: BudgetSpend::default(),
            vars: HashMap::new(),
            dispositions: HashMap::new(),
            replanned: false,
        }
    }

    pub fn any_step_failed(&self) -> bool {
        self.dispositions
            .values()
            .any(|d| *d == StepDisposition::Failed)
    }
}

/// The shared service handles a session executes against.
pub struct Services {
    pub store: Store,
    pub host: CapabilityHost,
    pub cascade: ProviderCascade,
    pub defaults: EngineDefaults,
}
