use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline failure taxonomy.
///
/// Validator, synthesizer and engine rejections are recovered by the
/// orchestrator's retry loop. `CatalogUnavailable`, `ConnectionFailure`,
/// `ExecutionTimeout` and `TurnDeadlineExceeded` end the turn with a
/// plain-language failure; the session stays usable.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error("Schema catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("Language model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("No acceptable query after {attempts} attempts")]
    SynthesisExhausted {
        attempts: u32,
        last_reason: Option<String>,
    },

    #[error("Unsafe operation: {0}")]
    UnsafeOperation(String),

    #[error("Unknown identifier: {0}")]
    UnknownIdentifier(String),

    #[error("Potentially unbounded query: {0}")]
    PotentiallyUnbounded(String),

    #[error("Injection suspected: {0}")]
    InjectionSuspected(String),

    #[error("Query execution timeout after {0} ms")]
    ExecutionTimeout(u64),

    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("Query rejected by engine: {0}")]
    QueryRejectedByEngine(String),

    #[error("Turn deadline of {0} ms exceeded")]
    TurnDeadlineExceeded(u64),
}

impl PipelineError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::CatalogUnavailable(_) => "CATALOG_UNAVAILABLE",
            PipelineError::ModelUnavailable(_) => "MODEL_UNAVAILABLE",
            PipelineError::SynthesisExhausted { .. } => "SYNTHESIS_EXHAUSTED",
            PipelineError::UnsafeOperation(_) => "UNSAFE_OPERATION",
            PipelineError::UnknownIdentifier(_) => "UNKNOWN_IDENTIFIER",
            PipelineError::PotentiallyUnbounded(_) => "POTENTIALLY_UNBOUNDED",
            PipelineError::InjectionSuspected(_) => "INJECTION_SUSPECTED",
            PipelineError::ExecutionTimeout(_) => "EXECUTION_TIMEOUT",
            PipelineError::ConnectionFailure(_) => "CONNECTION_FAILURE",
            PipelineError::QueryRejectedByEngine(_) => "QUERY_REJECTED_BY_ENGINE",
            PipelineError::TurnDeadlineExceeded(_) => "TURN_DEADLINE_EXCEEDED",
        }
    }

    /// Whether the orchestrator feeds this failure back into synthesis
    /// instead of ending the turn.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::UnsafeOperation(_)
                | PipelineError::UnknownIdentifier(_)
                | PipelineError::PotentiallyUnbounded(_)
                | PipelineError::InjectionSuspected(_)
                | PipelineError::QueryRejectedByEngine(_)
        )
    }

    /// Plain-language text shown to the user when the turn cannot continue
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::CatalogUnavailable(_) => {
                "I can't read the database structure right now, so I can't answer data questions. Please try again shortly.".to_string()
            }
            PipelineError::ModelUnavailable(_) => {
                "The language model is not responding at the moment. Please try again in a little while.".to_string()
            }
            PipelineError::SynthesisExhausted { .. } => {
                "I couldn't turn that question into a safe query. Could you rephrase it?".to_string()
            }
            PipelineError::ExecutionTimeout(ms) => format!(
                "The query took longer than {} seconds and was stopped. Try narrowing the question, for example with a time range or a filter.",
                ms / 1000
            ),
            PipelineError::ConnectionFailure(_) => {
                "The database is busy or unreachable right now. Please try again shortly.".to_string()
            }
            PipelineError::TurnDeadlineExceeded(_) => {
                "That took too long to answer and was stopped. Please try again or ask a narrower question.".to_string()
            }
            PipelineError::UnsafeOperation(_) => {
                "I can only read data; changes to the database are not allowed.".to_string()
            }
            PipelineError::UnknownIdentifier(_)
            | PipelineError::PotentiallyUnbounded(_)
            | PipelineError::InjectionSuspected(_)
            | PipelineError::QueryRejectedByEngine(_) => {
                "I couldn't build a valid query for that question.".to_string()
            }
        }
    }
}

/// Reason a candidate query was refused by the validator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionKind {
    UnsafeOperation,
    UnknownIdentifier,
    PotentiallyUnbounded,
    InjectionSuspected,
}

impl RejectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionKind::UnsafeOperation => "UNSAFE_OPERATION",
            RejectionKind::UnknownIdentifier => "UNKNOWN_IDENTIFIER",
            RejectionKind::PotentiallyUnbounded => "POTENTIALLY_UNBOUNDED",
            RejectionKind::InjectionSuspected => "INJECTION_SUSPECTED",
        }
    }
}

/// Validator rejection with its human-readable detail
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub detail: String,
}

impl Rejection {
    pub fn new(kind: RejectionKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn unsafe_operation(detail: impl Into<String>) -> Self {
        Self::new(RejectionKind::UnsafeOperation, detail)
    }

    pub fn unknown_identifier(detail: impl Into<String>) -> Self {
        Self::new(RejectionKind::UnknownIdentifier, detail)
    }

    pub fn potentially_unbounded(detail: impl Into<String>) -> Self {
        Self::new(RejectionKind::PotentiallyUnbounded, detail)
    }

    pub fn injection_suspected(detail: impl Into<String>) -> Self {
        Self::new(RejectionKind::InjectionSuspected, detail)
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.detail)
    }
}

impl From<Rejection> for PipelineError {
    fn from(rejection: Rejection) -> Self {
        match rejection.kind {
            RejectionKind::UnsafeOperation => PipelineError::UnsafeOperation(rejection.detail),
            RejectionKind::UnknownIdentifier => PipelineError::UnknownIdentifier(rejection.detail),
            RejectionKind::PotentiallyUnbounded => {
                PipelineError::PotentiallyUnbounded(rejection.detail)
            }
            RejectionKind::InjectionSuspected => PipelineError::InjectionSuspected(rejection.detail),
        }
    }
}
