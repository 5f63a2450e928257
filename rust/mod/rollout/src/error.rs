use bundlenudge_core::ServiceError;
use bundlenudge_kv::KVError;
use thiserror::Error;

/// Rollout engine error type.
///
/// Configuration invariant violations each get their own kind so callers can
/// tell a protected-channel rename from a lost race without parsing messages.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation: {0}")]
    Validation(String),

    /// Rename or delete of `production` / `staging` / `development`.
    #[error("protected channel: {0}")]
    ProtectedChannel(String),

    /// Deleting the app's current default channel.
    #[error("default channel: {0}")]
    DefaultChannel(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Attempt to lower a serving release's rollout percentage.
    #[error("non-monotonic rollout: {0}")]
    NonMonotonicRollout(String),

    /// Another release on the channel is already rolling.
    #[error("rollout in progress: {0}")]
    RolloutInProgress(String),

    /// A conditional write lost to a concurrent writer. Safe to retry.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl RolloutError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RolloutError::Conflict(_))
    }
}

impl From<KVError> for RolloutError {
    fn from(e: KVError) -> Self {
        match e {
            KVError::Storage(m) => RolloutError::Storage(m),
            KVError::Serialization(m) => RolloutError::Internal(m),
        }
    }
}

impl From<RolloutError> for ServiceError {
    fn from(e: RolloutError) -> Self {
        let message = e.to_string();
        match e {
            RolloutError::NotFound(_) => ServiceError::NotFound(message),
            RolloutError::Validation(_) => ServiceError::Validation(message),
            RolloutError::ProtectedChannel(_)
            | RolloutError::DefaultChannel(_)
            | RolloutError::InvalidTransition(_)
            | RolloutError::NonMonotonicRollout(_)
            | RolloutError::RolloutInProgress(_) => ServiceError::FailedPrecondition(message),
            RolloutError::Conflict(_) => ServiceError::Conflict(message),
            RolloutError::Storage(_) => ServiceError::Storage(message),
            RolloutError::Internal(_) => ServiceError::Internal(message),
        }
    }
}
