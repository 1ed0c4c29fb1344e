use thiserror::Error;

/// Engine result type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the deployment and alerting engines.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("lease unavailable: {0}")]
    LeaseUnavailable(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Error::InvalidConfiguration(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Error::PermissionDenied(msg.into())
    }

    pub fn lease_unavailable(msg: impl Into<String>) -> Self {
        Error::LeaseUnavailable(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn dependency_unavailable(msg: impl Into<String>) -> Self {
        Error::DependencyUnavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Transient dependency failures may be retried within a step's retry
    /// budget; everything else fails the attempt outright.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::DependencyUnavailable(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("serialization failed: {err}"))
    }
}
