//! Error taxonomy for the signing core.
//!
//! Write-path operations report outcomes (`RotationOutcome` in the rotation
//! module); `VaultError` covers everything that is genuinely an error.
//! `Fatal` is reserved for invariant violations detected mid-flight.

use std::fmt;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VaultError {
    /// Malformed input: bad domain, missing kid, payload shape, config out
    /// of range. Carries the offending field.
    Validation { field: &'static str, message: String },
    /// Requested key material, metadata, or policy does not exist.
    NotFound { what: String },
    /// A resource that must be created fresh already exists.
    Conflict { what: String },
    /// Store-level failure: key/metadata file I/O, policy transaction
    /// failure, lock transport failure. Rollback trigger inside the engine.
    Store { op: &'static str, message: String },
    /// Invariant violation. Never handled, only propagated.
    Fatal { message: String },
}

impl VaultError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        Self::Conflict { what: what.into() }
    }

    pub fn store(op: &'static str, err: impl fmt::Display) -> Self {
        Self::Store {
            op,
            message: err.to_string(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// Short machine-readable kind label, used in outcomes and audit detail.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::Store { .. } => "store_failure",
            Self::Fatal { .. } => "fatal",
        }
    }
}

impl fmt::Display for VaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { field, message } => write!(f, "invalid {}: {}", field, message),
            Self::NotFound { what } => write!(f, "not found: {}", what),
            Self::Conflict { what } => write!(f, "already exists: {}", what),
            Self::Store { op, message } => write!(f, "store failure during {}: {}", op, message),
            Self::Fatal { message } => write!(f, "fatal: {}", message),
        }
    }
}

impl std::error::Error for VaultError {}
