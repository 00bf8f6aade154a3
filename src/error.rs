// Copyright 2026 DashFlow Contributors

//! Error taxonomy for the adapter core.
//!
//! Every component returns a narrow, structured error enum; the top-level
//! [`UtacError`] unifies them for the [`crate::adapter::Adapter`]'s pipeline
//! handler, which converts any of these into an
//! [`crate::types::AdapterResult`] with `kind = error` and a stable `code`
//! (see `error_code`). Internal messages never reach a conversational
//! summary verbatim; `InternalError` carries a correlation id instead.

use std::fmt;

use uuid::Uuid;

/// Field-level validation failure, attached to [`UtacError::Validation`].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    pub code: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>, code: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into(), code: code.into() }
    }
}

/// Top-level error kinds, matching spec §7 verbatim.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum UtacError {
    /// Input or transformation failed. Never retried.
    #[error("validation failed: {} field error(s)", .0.len())]
    Validation(Vec<FieldError>),

    /// The source tool raised or returned a failure status. May be retried
    /// per the adapter's retry policy.
    #[error("execution failed: {message}")]
    Execution { message: String, retriable: bool },

    /// Rate limit exceeded, breaker open, or pool exhausted past deadline.
    /// Not retried internally; carries a retry-after hint.
    #[error("admission refused: {reason}")]
    Admission { reason: AdmissionReason, retry_after_ms: Option<u64> },

    /// A health probe failed. Reported to the monitor, never surfaced to
    /// callers directly.
    #[error("health check failed: {message}")]
    Health { component: String, message: String },

    /// Unexpected internal fault. Never leaks raw internals to callers;
    /// correlate via `correlation_id` in logs.
    #[error("internal error (correlation id {correlation_id})")]
    Internal { correlation_id: Uuid, source: String },
}

/// Why an [`UtacError::Admission`] was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AdmissionReason {
    RateLimited,
    CircuitOpen,
    PoolExhausted,
}

impl fmt::Display for AdmissionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdmissionReason::RateLimited => "rate_limited",
            AdmissionReason::CircuitOpen => "circuit_open",
            AdmissionReason::PoolExhausted => "pool_exhausted",
        };
        f.write_str(s)
    }
}

impl UtacError {
    /// Internal error from an arbitrary display-able cause, stamping a fresh
    /// correlation id for log correlation without leaking `source` to users.
    pub fn internal(source: impl fmt::Display) -> Self {
        UtacError::Internal { correlation_id: Uuid::new_v4(), source: source.to_string() }
    }

    /// Stable machine-readable error code for the conversational envelope.
    pub fn code(&self) -> &'static str {
        match self {
            UtacError::Validation(_) => "validation_error",
            UtacError::Execution { .. } => "execution_error",
            UtacError::Admission { reason, .. } => match reason {
                AdmissionReason::RateLimited => "rate_limited",
                AdmissionReason::CircuitOpen => "circuit_open",
                AdmissionReason::PoolExhausted => "pool_exhausted",
            },
            UtacError::Health { .. } => "health_error",
            UtacError::Internal { .. } => "internal_error",
        }
    }

    /// Whether the adapter's retry policy may retry this failure.
    pub fn is_retriable(&self) -> bool {
        matches!(self, UtacError::Execution { retriable: true, .. })
    }
}

pub type UtacResult<T> = Result<T, UtacError>;
