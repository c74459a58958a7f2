//! HORNET: Error Taxonomy
//!
//! One error enum for every cross-component boundary. Cross-tenant access
//! surfaces as not-found so the API leaks nothing about other tenants'
//! resources.

use thiserror::Error;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, HornetError>;

/// The cross-component error taxonomy.
#[derive(Debug, Error)]
pub enum HornetError {
    /// Missing or invalid credential.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Access to another tenant's resource; reported as not-found.
    #[error("resource not found")]
    TenantIsolation,

    /// Malformed input; never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Idempotency or state-machine violation; never retried.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Network, timeout, upstream 5xx; retried where outbound.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Token budget exceeded for an incident.
    #[error("token budget exhausted ({used}/{budget})")]
    BudgetExhausted { used: i64, budget: i64 },

    /// A phase deadline expired.
    #[error("deadline exceeded in {phase}")]
    DeadlineExceeded { phase: String },

    /// Connector validation failure or upstream rejection.
    #[error("connector failure: {0}")]
    Connector(String),

    /// Anything else; surfaced as 500 with a correlation id.
    #[error("internal error: {0}")]
    Internal(String),
}

impl HornetError {
    /// Whether an outbound caller should retry per the backoff ladder.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Stable machine-readable code for API responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "unauthorized",
            Self::TenantIsolation => "not_found",
            Self::Validation(_) => "validation_error",
            Self::Conflict(_) => "conflict",
            Self::Transient(_) => "transient_error",
            Self::BudgetExhausted { .. } => "budget_exhausted",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::Connector(_) => "connector_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(HornetError::Transient("timeout".into()).is_retryable());
        assert!(!HornetError::Validation("bad".into()).is_retryable());
        assert!(!HornetError::Conflict("dup".into()).is_retryable());
    }

    #[test]
    fn test_isolation_reads_as_not_found() {
        let err = HornetError::TenantIsolation;
        assert_eq!(err.code(), "not_found");
        assert_eq!(err.to_string(), "resource not found");
    }
}
