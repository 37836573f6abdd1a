use std::fmt;

/// Typed failure classes shared across the core.
///
/// `NotFound` maps to missing sources / connectors / failures / ruleset
/// versions; `Invalid` maps to request-validation and invariant violations.
/// Both carry the full human-readable message so callers can surface them
/// unchanged, while still being matchable via `downcast_ref::<DomainError>()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    NotFound(String),
    Invalid(String),
}

impl DomainError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        DomainError::NotFound(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        DomainError::Invalid(msg.into())
    }
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainError::NotFound(msg) => write!(f, "{msg}"),
            DomainError::Invalid(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for DomainError {}
