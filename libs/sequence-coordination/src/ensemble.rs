//! Abstract coordination ensemble interface.
//!
//! `Ensemble` opens sessions and `Session` performs the three round trips the
//! allocator needs. The ZooKeeper client implements both in
//! [`crate::zookeeper`]; [`crate::memory`] provides an in-process tree used to
//! simulate many instances sharing one ensemble.

use std::fmt;

use async_trait::async_trait;

use crate::error::CoordinationResult;
use crate::watcher::SessionWatcher;

/// Connectivity transitions reported by the ensemble client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// Session established (or re-established) and synced.
    SyncConnected,
    /// Connected to a read-only server; claims cannot be written.
    ConnectedReadOnly,
    /// Connection dropped.
    Disconnected,
    /// The ensemble expired the session; its ephemeral nodes are gone.
    Expired,
    /// Authentication was rejected.
    AuthFailed,
    /// The session was closed by the client.
    Closed,
}

impl SessionEvent {
    /// Returns true if the handle that reported this event can no longer be used.
    pub fn is_session_loss(&self) -> bool {
        matches!(
            self,
            SessionEvent::Disconnected
                | SessionEvent::Expired
                | SessionEvent::AuthFailed
                | SessionEvent::Closed
        )
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionEvent::SyncConnected => "SyncConnected",
            SessionEvent::ConnectedReadOnly => "ConnectedReadOnly",
            SessionEvent::Disconnected => "Disconnected",
            SessionEvent::Expired => "Expired",
            SessionEvent::AuthFailed => "AuthFailed",
            SessionEvent::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// Lifetime of a created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the session that created it.
    Persistent,
    /// Removed by the ensemble when the creating session ends.
    Ephemeral,
}

/// A live session to the ensemble.
#[async_trait]
pub trait Session: Send + Sync + fmt::Debug + 'static {
    /// Returns true if a node exists at `path`.
    async fn exists(&self, path: &str) -> CoordinationResult<bool>;

    /// Atomically create a node. Fails with
    /// [`CoordinationError::NodeExists`] if the path is already taken.
    ///
    /// [`CoordinationError::NodeExists`]: crate::CoordinationError::NodeExists
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordinationResult<()>;

    /// Names (not full paths) of the children of `path`.
    async fn children(&self, path: &str) -> CoordinationResult<Vec<String>>;
}

/// Opens sessions against a coordination ensemble.
pub trait Ensemble: Send + Sync + fmt::Debug + 'static {
    type Session: Session;

    /// Create a new session handle. Connecting happens in the background;
    /// progress is reported through `watcher`. No round trip is made here.
    fn open(&self, watcher: SessionWatcher) -> CoordinationResult<Self::Session>;
}
