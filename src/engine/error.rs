use std::fmt;

use thiserror::Error;
use ulid::Ulid;

use crate::sealed::SealError;

/// First policy that rejected a candidate booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyViolation {
    pub policy_id: Ulid,
    pub rule: &'static str,
    pub reason: String,
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    PolicyViolation(PolicyViolation),
    #[error("booking conflicts with existing reservation {0}")]
    Conflict(Ulid),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("{0}")]
    InvalidState(String),
    #[error("payment required before confirmation")]
    PaymentRequired,
    #[error("payment gateway rejected the request ({status}): {message}")]
    GatewayRejected { status: u16, message: String },
    #[error("payment processing failed after {attempts} attempt(s), status unknown: {cause}")]
    GatewayUnknownOutcome { attempts: usize, cause: String },
    #[error("invalid signature")]
    InvalidSignature,
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
    #[error(transparent)]
    Seal(#[from] SealError),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl fmt::Display) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Stable machine-readable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::PolicyViolation(_) => "POLICY_VIOLATION",
            EngineError::Conflict(_) => "BOOKING_CONFLICT",
            EngineError::NotFound { .. } => "NOT_FOUND",
            EngineError::InvalidState(_) => "INVALID_STATE",
            EngineError::PaymentRequired => "PAYMENT_REQUIRED",
            EngineError::GatewayRejected { .. } => "PAYMENT_FAILED",
            EngineError::GatewayUnknownOutcome { .. } => "PAYMENT_STATUS_UNKNOWN",
            EngineError::InvalidSignature => "INVALID_SIGNATURE",
            EngineError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            EngineError::WalError(_) => "STORAGE_ERROR",
            EngineError::Seal(_) => "ENCRYPTION_ERROR",
        }
    }
}
