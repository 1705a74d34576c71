//! ZooKeeper ensemble backed by `zookeeper-client`.
//!
//! Opening a session returns immediately; a background task connects, stores
//! the client, then forwards every session state change to the watcher. The
//! task stops when the session ends or the handle is dropped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zookeeper_client as zk;

use crate::config::CoordinationConfig;
use crate::ensemble::{CreateMode, Ensemble, Session, SessionEvent};
use crate::error::{CoordinationError, CoordinationResult};
use crate::watcher::SessionWatcher;

/// Connection settings for a ZooKeeper ensemble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZkEnsemble {
    servers: String,
    session_timeout: Duration,
}

impl ZkEnsemble {
    pub fn new(servers: impl Into<String>, session_timeout: Duration) -> Self {
        Self {
            servers: servers.into(),
            session_timeout,
        }
    }

    pub fn from_config(config: &CoordinationConfig) -> CoordinationResult<Self> {
        config.validate()?;
        Ok(Self::new(config.servers.clone(), config.session_timeout))
    }

    pub fn servers(&self) -> &str {
        &self.servers
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }
}

impl Ensemble for ZkEnsemble {
    type Session = ZkSession;

    fn open(&self, watcher: SessionWatcher) -> CoordinationResult<Self::Session> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|err| {
            CoordinationError::Config(format!("zookeeper session needs a tokio runtime: {err}"))
        })?;
        let client = Arc::new(OnceCell::new());
        let cancel = CancellationToken::new();
        runtime.spawn(drive_session(
            self.clone(),
            watcher,
            Arc::clone(&client),
            cancel.clone(),
        ));
        debug!(servers = %self.servers, "zookeeper session handle created");
        Ok(ZkSession {
            servers: self.servers.clone(),
            client,
            cancel,
        })
    }
}

fn session_event(state: zk::SessionState) -> SessionEvent {
    #[allow(unreachable_patterns)]
    match state {
        zk::SessionState::SyncConnected => SessionEvent::SyncConnected,
        zk::SessionState::ConnectedReadOnly => SessionEvent::ConnectedReadOnly,
        zk::SessionState::Disconnected => SessionEvent::Disconnected,
        zk::SessionState::Expired => SessionEvent::Expired,
        zk::SessionState::AuthFailed => SessionEvent::AuthFailed,
        zk::SessionState::Closed => SessionEvent::Closed,
        _ => SessionEvent::Disconnected,
    }
}

async fn drive_session(
    ensemble: ZkEnsemble,
    watcher: SessionWatcher,
    slot: Arc<OnceCell<zk::Client>>,
    cancel: CancellationToken,
) {
    let connect = async {
        zk::Client::connector()
            .session_timeout(ensemble.session_timeout)
            .connect(&ensemble.servers)
            .await
    };
    let client = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("zookeeper session dropped before connecting");
            return;
        }
        res = connect => match res {
            Ok(client) => client,
            Err(err) => {
                warn!(servers = %ensemble.servers, error = %err, "zookeeper connect failed");
                return;
            }
        }
    };

    let mut states = client.state_watcher();
    if slot.set(client).is_err() {
        return;
    }
    info!(servers = %ensemble.servers, "zookeeper session established");
    watcher.on_event(SessionEvent::SyncConnected).await;

    loop {
        let state = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            state = states.changed() => state,
        };
        let event = session_event(state);
        watcher.on_event(event).await;
        if matches!(
            event,
            SessionEvent::Expired | SessionEvent::Closed | SessionEvent::AuthFailed
        ) {
            break;
        }
    }
    debug!(servers = %ensemble.servers, "zookeeper session event forwarding stopped");
}

fn map_error(path: &str, err: zk::Error) -> CoordinationError {
    match err {
        zk::Error::NodeExists => CoordinationError::NodeExists(path.to_owned()),
        zk::Error::NoNode => CoordinationError::NoNode(path.to_owned()),
        other => CoordinationError::Transport(format!("zookeeper request on '{path}' failed: {other}")),
    }
}

/// A ZooKeeper session handle. Dropping it stops event forwarding.
pub struct ZkSession {
    servers: String,
    client: Arc<OnceCell<zk::Client>>,
    cancel: CancellationToken,
}

impl ZkSession {
    fn client(&self) -> CoordinationResult<&zk::Client> {
        self.client.get().ok_or_else(|| {
            CoordinationError::NotConnected(format!("zookeeper session to {} not established", self.servers))
        })
    }
}

#[async_trait]
impl Session for ZkSession {
    async fn exists(&self, path: &str) -> CoordinationResult<bool> {
        let client = self.client()?;
        client
            .check_stat(path)
            .await
            .map(|stat| stat.is_some())
            .map_err(|err| map_error(path, err))
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordinationResult<()> {
        let client = self.client()?;
        let options = match mode {
            CreateMode::Persistent => zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all()),
            CreateMode::Ephemeral => zk::CreateMode::Ephemeral.with_acls(zk::Acls::anyone_all()),
        };
        client
            .create(path, data, &options)
            .await
            .map(|_| ())
            .map_err(|err| map_error(path, err))
    }

    async fn children(&self, path: &str) -> CoordinationResult<Vec<String>> {
        let client = self.client()?;
        client
            .list_children(path)
            .await
            .map_err(|err| map_error(path, err))
    }
}

impl Drop for ZkSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for ZkSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZkSession")
            .field("servers", &self.servers)
            .field("established", &self.client.initialized())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        let mut config = CoordinationConfig::new("zk1:2181,zk2:2181", "host-a");
        config.session_timeout = Duration::from_millis(8000);
        let ensemble = ZkEnsemble::from_config(&config).unwrap();
        assert_eq!(ensemble.servers(), "zk1:2181,zk2:2181");
        assert_eq!(ensemble.session_timeout(), Duration::from_millis(8000));

        config.servers = String::new();
        assert!(matches!(
            ZkEnsemble::from_config(&config),
            Err(CoordinationError::Config(_))
        ));
    }

    #[test]
    fn test_open_requires_runtime() {
        let ensemble = ZkEnsemble::new("127.0.0.1:2181", Duration::from_secs(5));
        let err = ensemble.open(SessionWatcher::new()).unwrap_err();
        assert!(matches!(err, CoordinationError::Config(_)));
    }

    #[test]
    fn test_map_error() {
        assert!(matches!(
            map_error("/sequence/1", zk::Error::NodeExists),
            CoordinationError::NodeExists(path) if path == "/sequence/1"
        ));
        assert!(matches!(
            map_error("/sequence", zk::Error::NoNode),
            CoordinationError::NoNode(_)
        ));
    }

    #[tokio::test]
    async fn test_requests_before_connect_fail() {
        // nothing listens on port 1
        let ensemble = ZkEnsemble::new("127.0.0.1:1", Duration::from_secs(5));
        let session = ensemble.open(SessionWatcher::new()).unwrap();
        assert!(matches!(
            session.exists("/sequence").await,
            Err(CoordinationError::NotConnected(_))
        ));
        assert!(matches!(
            session.children("/sequence").await,
            Err(CoordinationError::NotConnected(_))
        ));
    }
}
