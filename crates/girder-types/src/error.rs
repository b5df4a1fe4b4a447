use crate::quota::QuotaDimension;
use thiserror::Error;

/// Girder error taxonomy. Variants map 1:1 onto the external error kinds;
/// `Io`/`Serialization` are crate-internal and surface as `internal` at the
/// service boundary.
#[derive(Error, Debug)]
pub enum GirderError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Tenant-scoped missing record. Deliberately never distinguishes
    /// "absent" from "forbidden".
    #[error("not found: {0}")]
    NotFound(String),

    #[error("quota exceeded: {dimension:?} current={current} limit={limit}")]
    QuotaExceeded {
        dimension: QuotaDimension,
        current: f64,
        limit: f64,
    },

    /// Idempotency collision with differing fields.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Operation not valid for the current (terminal) state.
    #[error("terminal: {0}")]
    Terminal(String),

    #[error("internal error (correlation id {correlation_id})")]
    Internal { correlation_id: String },

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Journal append or replay failure. Fatal to the mutation it guarded.
    #[error("journal error: {0}")]
    Journal(String),
}

impl GirderError {
    pub fn internal() -> Self {
        GirderError::Internal {
            correlation_id: crate::id::new_correlation_id(),
        }
    }

    /// Stable external error code. Preview/snapshot denials surface as
    /// `rate_limit_exceeded`, LLM budget denials as `payment_required`.
    pub fn code(&self) -> &'static str {
        match self {
            GirderError::InvalidInput(_) => "invalid_input",
            GirderError::NotFound(_) => "not_found",
            GirderError::QuotaExceeded { dimension, .. } => match dimension {
                QuotaDimension::ActivePreviews | QuotaDimension::SnapshotRate => {
                    "rate_limit_exceeded"
                }
                QuotaDimension::LlmBudget => "payment_required",
            },
            GirderError::Conflict(_) => "conflict",
            GirderError::Terminal(_) => "terminal",
            GirderError::Internal { .. } => "internal",
            GirderError::DeadlineExceeded(_) => "deadline_exceeded",
            GirderError::Io(_) | GirderError::Serialization(_) | GirderError::Journal(_) => {
                "internal"
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, GirderError>;
