//! Crate-wide error type.
//!
//! This module has zero imports from `crate::store`, `crate::engine`, or any
//! backend crate built on top of `vulcan-core`. Every fallible operation in
//! this crate returns a `Result<T, VulcanError>`; application code that needs
//! `.context()` chaining wraps these in `anyhow::Error` at the call site.

use thiserror::Error;

/// The semantic error kinds shared across the engine, store, registry, and
/// backend contract. Variants are deliberately coarse; callers match on
/// kind, not on backend-specific detail, which lives in the message.
#[derive(Debug, Error)]
pub enum VulcanError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("workload not found: {0}")]
    NotFound(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("workload timed out after {0}s")]
    Timeout(u64),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl VulcanError {
    /// Stable machine-readable kind name, used by metrics/log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::ResourceExhaustion(_) => "resource_exhaustion",
            Self::Provisioning(_) => "provisioning",
            Self::Protocol(_) => "protocol",
            Self::Timeout(_) => "timeout",
            Self::Persistence(_) => "persistence",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for VulcanError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VulcanError>;
