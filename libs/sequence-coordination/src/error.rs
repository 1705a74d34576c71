//! Error types for sequence coordination.
//!
//! Callers can tell a readiness timeout or an exhausted claim budget (both
//! surfaced to the boundary) apart from the transient failures the allocator
//! recovers from on its own.

use std::time::Duration;

use thiserror::Error;

/// Top-level error type for the sequence-coordination crate.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The session did not reach `Connected` within the readiness budget.
    #[error("ensemble connection not ready after {waited:?}")]
    ConnectionTimeout { waited: Duration },

    /// A create hit a node that already exists.
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// The parent of a node does not exist.
    #[error("no node: {0}")]
    NoNode(String),

    /// Another instance claimed this number first.
    #[error("sequence number {0} already claimed")]
    ClaimCollision(u32),

    /// Ensemble round trip failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The session handle has no live connection behind it.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// Every claim attempt in the budget failed.
    #[error("sequence allocation exhausted after {attempts} attempts")]
    AllocationExhausted { attempts: u32 },

    /// Every number up to `max` is held; nothing is left to claim.
    #[error("sequence numbers exhausted: all of 1..={max} are claimed")]
    NumberSpaceFull { max: u32 },

    /// The caller cancelled the operation at a suspension point.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid ensemble or allocator configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl CoordinationError {
    /// Returns true if the allocator may retry the attempt that produced this
    /// error within its remaining budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::NodeExists(_)
                | CoordinationError::NoNode(_)
                | CoordinationError::ClaimCollision(_)
                | CoordinationError::Transport(_)
                | CoordinationError::NotConnected(_)
        )
    }

    /// Returns true if a claim lost a race for its number.
    pub fn is_collision(&self) -> bool {
        matches!(self, CoordinationError::ClaimCollision(_))
    }

    /// Returns true if this is the readiness timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoordinationError::ConnectionTimeout { .. })
    }
}

/// Shorthand result alias for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let collision = CoordinationError::ClaimCollision(3);
        assert!(collision.is_retryable());
        assert!(collision.is_collision());
        assert!(!collision.is_timeout());

        let transport = CoordinationError::Transport("conn reset".into());
        assert!(transport.is_retryable());
        assert!(!transport.is_collision());

        let timeout = CoordinationError::ConnectionTimeout {
            waited: Duration::from_secs(5),
        };
        assert!(!timeout.is_retryable());
        assert!(timeout.is_timeout());

        let exhausted = CoordinationError::AllocationExhausted { attempts: 5 };
        assert!(!exhausted.is_retryable());
        assert!(!CoordinationError::NumberSpaceFull { max: u32::MAX }.is_retryable());

        assert!(!CoordinationError::Cancelled.is_retryable());
        assert!(!CoordinationError::Config("empty".into()).is_retryable());
        assert!(CoordinationError::NoNode("/sequence".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = CoordinationError::AllocationExhausted { attempts: 5 };
        assert_eq!(
            err.to_string(),
            "sequence allocation exhausted after 5 attempts"
        );
        let err = CoordinationError::ClaimCollision(7);
        assert!(err.to_string().contains("7"));
    }
}
