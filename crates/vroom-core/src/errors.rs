/// Credential failures. Always terminal for the request; no connection is created.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,
    #[error("invalid credential: {0}")]
    Invalid(String),
    #[error("credential expired")]
    Expired,
}

/// Failure of the session repository itself, as opposed to a miss.
#[derive(Clone, Debug, thiserror::Error)]
pub enum LookupError {
    #[error("session lookup failed: {0}")]
    Backend(String),
}

/// Errors raised by a [`crate::SessionStateProvider`].
///
/// These are transient from the stream's point of view: the refresh loop logs
/// them and tries again on the next tick.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("state provider unavailable: {0}")]
    Unavailable(String),
    #[error("snapshot serialization failed: {0}")]
    Serialization(String),
}

impl ProviderError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Serialization(_) => "serialization",
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::Serialization(e.to_string())
    }
}
