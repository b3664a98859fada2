//! Engine-wide error type.
//!
//! Budget exhaustion is deliberately absent: running out of budget is a
//! recorded halt condition, not an error (see `orchestrator::PlanHalt`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(String),

    /// Any write path targeting the identity document.
    #[error("write to protected key '{0}' rejected")]
    ProtectedKey(String),

    #[error("capability '{capability}' failed: {reason}")]
    Sandbox { capability: String, reason: String },

    #[error("{what} timed out after {ms}ms")]
    Timeout { what: String, ms: u64 },

    /// Generative call failed after every cascade tier and the fallback model.
    #[error("provider call failed: {0}")]
    Provider(String),

    /// Model output could not be parsed as a plan or review object.
    #[error("malformed model output: {0}")]
    PlanMalformed(String),

    /// The in-flight marker could not be written; the session must not start.
    #[error("breadcrumb: {0}")]
    Breadcrumb(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
