//! Error types for PiiVault.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Gone: {0}")]
    Gone(String),

    /// Store unreachable, busy past the deadline, or the caller's timeout expired.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code, shared by the HTTP surface and per-item batch outcomes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Conflict(_) => "PV_CONFLICT",
            Self::NotFound(_) => "PV_NOT_FOUND",
            Self::Forbidden(_) => "PV_FORBIDDEN",
            Self::Validation(_) => "PV_VALIDATION",
            Self::Gone(_) => "PV_GONE",
            Self::Unavailable(_) => "PV_UNAVAILABLE",
            Self::Database(_)
            | Self::Crypto(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Config(_)
            | Self::Internal(_) => "PV_INTERNAL",
        }
    }

    /// Whether an idempotent read may be retried after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct_for_taxonomy() {
        let codes = [
            Error::Conflict(String::new()).code(),
            Error::NotFound(String::new()).code(),
            Error::Forbidden(String::new()).code(),
            Error::Validation(String::new()).code(),
            Error::Gone(String::new()).code(),
            Error::Unavailable(String::new()).code(),
        ];
        let mut sorted = codes.to_vec();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), codes.len());
    }

    #[test]
    fn test_only_unavailable_is_transient() {
        assert!(Error::Unavailable("busy".into()).is_transient());
        assert!(!Error::NotFound("x".into()).is_transient());
        assert!(!Error::Conflict("x".into()).is_transient());
    }
}
