use thiserror::Error;

/// Failure taxonomy for inventory fetches and tree operations. `Clone` so a
/// shared in-flight fetch can fan its outcome out to every awaiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("access denied to project '{0}'")]
    AccessDenied(String),
    #[error("backend listing failed: {0}")]
    Backend(String),
    #[error("fetch cancelled")]
    Cancelled,
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
}

impl FetchError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}
