//! Typed error values for every failure kind named in §7. Propagation policy
//! (retry vs. surface vs. never-retry) lives with the callers that handle
//! each variant, not in this module.

use crate::model::StageShuffleId;
use thiserror::Error;

/// The error-kind enum carried in every RPC reply, per §6's wire protocol
/// note ("an error-kind enum in the reply").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NoShuffleWorkers,
    NoToken,
    Backpressure,
    InputNotReady,
    Dfs,
    StageAborted,
    Config,
    Protocol,
}

/// Context attached to a user-visible failure: `{StageShuffleId,
/// partitionId?, workerId?, errorKind}` per §7.
#[derive(Debug, Error)]
pub enum RssError {
    #[error("no live shuffle workers for datacenter/cluster")]
    NoShuffleWorkersError,

    #[error("no token available on control channel within deadline")]
    NoTokenError,

    #[error("worker under memory pressure, retry with backoff")]
    BackpressureError,

    #[error("reader timed out waiting for stage {stage:?} to become ready")]
    InputNotReadyError { stage: StageShuffleId },

    #[error("dfs operation failed for stage {stage:?} partition {partition_id:?}: {message}")]
    DfsError {
        stage: Option<StageShuffleId>,
        partition_id: Option<u32>,
        message: String,
    },

    #[error("stage {stage:?} was aborted")]
    StageAbortedError { stage: StageShuffleId },

    #[error("invalid configuration: {message}")]
    ConfigError { message: String },

    #[error("protocol error: {message}")]
    ProtocolError { message: String },
}

impl RssError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RssError::NoShuffleWorkersError => ErrorKind::NoShuffleWorkers,
            RssError::NoTokenError => ErrorKind::NoToken,
            RssError::BackpressureError => ErrorKind::Backpressure,
            RssError::InputNotReadyError { .. } => ErrorKind::InputNotReady,
            RssError::DfsError { .. } => ErrorKind::Dfs,
            RssError::StageAbortedError { .. } => ErrorKind::StageAborted,
            RssError::ConfigError { .. } => ErrorKind::Config,
            RssError::ProtocolError { .. } => ErrorKind::Protocol,
        }
    }

    /// §7: "backpressure and transient network errors are retried locally at
    /// the client ... Protocol errors are never retried."
    pub fn is_retryable(&self) -> bool {
        matches!(self, RssError::BackpressureError | RssError::NoTokenError)
    }
}

/// Outcome of `SendBlock`: a duplicate is "ack-only, informational" per §7,
/// not a failure — modeled as a distinct return value rather than an `Err`
/// so callers don't have to special-case it out of error-handling paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendBlockOutcome {
    Accepted,
    Duplicate,
}

pub type Result<T> = std::result::Result<T, RssError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backpressure_and_token_errors_are_retryable() {
        assert!(RssError::BackpressureError.is_retryable());
        assert!(RssError::NoTokenError.is_retryable());
    }

    #[test]
    fn protocol_and_config_errors_are_not_retryable() {
        assert!(!RssError::ProtocolError { message: "x".into() }.is_retryable());
        assert!(!RssError::ConfigError { message: "x".into() }.is_retryable());
    }

    #[test]
    fn error_kind_matches_variant() {
        let stage = StageShuffleId::new("a", 0, 0, 0);
        assert_eq!(RssError::NoShuffleWorkersError.kind(), ErrorKind::NoShuffleWorkers);
        assert_eq!(
            RssError::InputNotReadyError { stage: stage.clone() }.kind(),
            ErrorKind::InputNotReady
        );
        assert_eq!(RssError::StageAbortedError { stage }.kind(), ErrorKind::StageAborted);
    }
}
