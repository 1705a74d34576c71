//! Ensemble and allocator settings.

use std::time::Duration;

use crate::error::{CoordinationError, CoordinationResult};

/// Default parent node of every claim.
pub const DEFAULT_ROOT_PATH: &str = "/sequence";
/// Default ZooKeeper session timeout.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_millis(5000);
/// Default interval between readiness checks.
pub const DEFAULT_READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Default number of readiness checks before giving up.
pub const DEFAULT_READY_MAX_POLLS: u32 = 50;
/// Default number of claim attempts per allocation.
pub const DEFAULT_CLAIM_ATTEMPTS: u32 = 5;

/// How long [`ConnectionManager::active_session`] waits for `Connected`.
///
/// [`ConnectionManager::active_session`]: crate::ConnectionManager::active_session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl ReadinessPolicy {
    /// Total time a caller waits before `ConnectionTimeout`.
    pub fn budget(&self) -> Duration {
        self.poll_interval.saturating_mul(self.max_polls)
    }
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_READY_POLL_INTERVAL,
            max_polls: DEFAULT_READY_MAX_POLLS,
        }
    }
}

/// Everything needed to connect and allocate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationConfig {
    /// ZooKeeper connection string, e.g. `zk1:2181,zk2:2181/chroot`.
    pub servers: String,
    pub session_timeout: Duration,
    pub root_path: String,
    /// Payload written into each claim node.
    pub instance_id: String,
    pub readiness: ReadinessPolicy,
    pub claim_attempts: u32,
}

impl CoordinationConfig {
    pub fn new(servers: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            servers: servers.into(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            root_path: DEFAULT_ROOT_PATH.to_owned(),
            instance_id: instance_id.into(),
            readiness: ReadinessPolicy::default(),
            claim_attempts: DEFAULT_CLAIM_ATTEMPTS,
        }
    }

    /// Reject settings the allocator cannot work with.
    pub fn validate(&self) -> CoordinationResult<()> {
        if self.servers.trim().is_empty() {
            return Err(CoordinationError::Config(
                "ensemble connection string is empty".into(),
            ));
        }
        if !self.root_path.starts_with('/') || self.root_path.len() < 2 {
            return Err(CoordinationError::Config(format!(
                "root path '{}' must be absolute and not '/'",
                self.root_path
            )));
        }
        if self.root_path.ends_with('/') {
            return Err(CoordinationError::Config(format!(
                "root path '{}' must not end with '/'",
                self.root_path
            )));
        }
        if self.claim_attempts == 0 {
            return Err(CoordinationError::Config(
                "claim attempts must be at least 1".into(),
            ));
        }
        if self.readiness.max_polls == 0 {
            return Err(CoordinationError::Config(
                "readiness polls must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
