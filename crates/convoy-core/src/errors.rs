use std::time::Duration;

/// Typed error hierarchy for orchestration operations.
/// Classifies errors as caller errors (surfaced synchronously, never retried
/// by the core) or internal failures (handled by force-terminating the
/// affected session and reported through the update stream).
#[derive(Clone, Debug, thiserror::Error)]
pub enum OrchestratorError {
    // Caller errors — surfaced synchronously
    #[error("capacity exhausted: no ready instance within {waited:?}")]
    CapacityExhausted { waited: Duration },
    #[error("state conflict: {0}")]
    StateConflict(String),
    #[error("validation error: {0}")]
    Validation(String),

    // Internal failures — resolved by force-terminating the session
    #[error("channel lost: {0}")]
    ChannelLost(String),
    #[error("instance failed: {0}")]
    InstanceFailed(String),

    // Provisioning collaborator errors — retried by the pool controller
    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Errors the caller sees directly; retry policy belongs to the caller.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::CapacityExhausted { .. } | Self::StateConflict(_) | Self::Validation(_)
        )
    }

    /// Errors handled inside the core by unbinding and reporting
    /// asynchronously, never by failing unrelated calls.
    pub fn is_internal_failure(&self) -> bool {
        matches!(self, Self::ChannelLost(_) | Self::InstanceFailed(_))
    }

    /// Short classification string for logging and wire error codes.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::CapacityExhausted { .. } => "capacity_exhausted",
            Self::StateConflict(_) => "state_conflict",
            Self::Validation(_) => "validation",
            Self::ChannelLost(_) => "channel_lost",
            Self::InstanceFailed(_) => "instance_failed",
            Self::ProvisioningFailed(_) => "provisioning_failed",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_error_classification() {
        assert!(OrchestratorError::CapacityExhausted { waited: Duration::from_secs(30) }
            .is_caller_error());
        assert!(OrchestratorError::StateConflict("busy".into()).is_caller_error());
        assert!(OrchestratorError::Validation("bad id".into()).is_caller_error());
        assert!(!OrchestratorError::ChannelLost("gap".into()).is_caller_error());
    }

    #[test]
    fn internal_failure_classification() {
        assert!(OrchestratorError::ChannelLost("window exceeded".into()).is_internal_failure());
        assert!(OrchestratorError::InstanceFailed("heartbeat".into()).is_internal_failure());
        assert!(!OrchestratorError::StateConflict("busy".into()).is_internal_failure());
        assert!(!OrchestratorError::ProvisioningFailed("quota".into()).is_internal_failure());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(
            OrchestratorError::CapacityExhausted { waited: Duration::from_secs(1) }.error_kind(),
            "capacity_exhausted"
        );
        assert_eq!(OrchestratorError::ChannelLost("x".into()).error_kind(), "channel_lost");
        assert_eq!(
            OrchestratorError::ProvisioningFailed("x".into()).error_kind(),
            "provisioning_failed"
        );
    }

    #[test]
    fn display_includes_detail() {
        let err = OrchestratorError::StateConflict("task already in progress".into());
        assert!(err.to_string().contains("task already in progress"));
    }
}
