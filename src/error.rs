// =============================================================================
// Engine error taxonomy
// =============================================================================
//
// GuardrailBlock is deliberately absent: a suppressed entry is a normal
// outcome and travels as `StepOutcome::Blocked`, not as an error.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// Bar window or signal vector could not be obtained for this step.
    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    /// A state transition would break a ledger or position invariant.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
