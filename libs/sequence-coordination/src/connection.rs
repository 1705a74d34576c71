//! Ensemble connection manager.
//!
//! Owns the single session handle for the process and knows whether it is
//! usable. The handle is opened lazily by [`ConnectionManager::active_session`]
//! and is discarded, never reused, once the watcher reports it lost.
//!
//! Each handle gets its own [`HandleId`] and reports through a watcher tagged
//! with it. Events tagged with any other id are stale and ignored.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ReadinessPolicy;
use crate::ensemble::{Ensemble, SessionEvent};
use crate::error::{CoordinationError, CoordinationResult};
use crate::metrics;
use crate::watcher::{HandleId, SessionListener, SessionWatcher, WatchedEvent};

/// Connection state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No usable handle.
    Disconnected,
    /// Handle created, waiting for the first `SyncConnected`.
    Connecting,
    /// Session established; claims may be made.
    Connected,
}

/// Notified after each connected/disconnected transition.
#[async_trait]
pub trait ConnectionListener: Send + Sync + 'static {
    async fn on_connected(&self);
    async fn on_disconnected(&self);
}

struct Current<S> {
    id: HandleId,
    session: Arc<S>,
}

struct ManagerInner<E: Ensemble> {
    ensemble: E,
    watcher: SessionWatcher,
    readiness: ReadinessPolicy,
    /// state changes happen while this is held
    session: Mutex<Option<Current<E::Session>>>,
    next_handle: AtomicU64,
    state: watch::Sender<ConnectionState>,
    /// serializes handle creation and the readiness wait
    opening: tokio::sync::Mutex<()>,
    /// bumped on every readiness timeout
    timeouts: AtomicU64,
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
}

impl<E: Ensemble> ManagerInner<E> {
    fn ready_session(&self) -> Option<Arc<E::Session>> {
        let slot = self.session.lock();
        if *self.state.borrow() != ConnectionState::Connected {
            return None;
        }
        slot.as_ref().map(|current| Arc::clone(&current.session))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
        metrics::COORDINATION_STATE.set(i64::from(state == ConnectionState::Connected));
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.listeners.read().clone()
    }

    /// True if `handle` names the current handle. Untagged events apply to
    /// whatever handle is current.
    fn is_current_handle(slot: &Option<Current<E::Session>>, handle: Option<HandleId>) -> bool {
        match (slot, handle) {
            (Some(current), Some(handle)) => current.id == handle,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    async fn handle_event(&self, event: WatchedEvent) {
        match event.state {
            SessionEvent::SyncConnected => {
                {
                    let slot = self.session.lock();
                    if !Self::is_current_handle(&slot, event.handle) {
                        debug!(handle = ?event.handle, "ignoring SyncConnected for a discarded handle");
                        return;
                    }
                    self.set_state(ConnectionState::Connected);
                }
                info!(handle = ?event.handle, "ensemble session connected");
                for listener in self.listeners() {
                    listener.on_connected().await;
                }
            }
            SessionEvent::Disconnected
            | SessionEvent::Expired
            | SessionEvent::AuthFailed
            | SessionEvent::Closed => {
                let discarded = {
                    let mut slot = self.session.lock();
                    if !Self::is_current_handle(&slot, event.handle) {
                        debug!(
                            state = %event.state,
                            handle = ?event.handle,
                            "ignoring session loss for a discarded handle"
                        );
                        return;
                    }
                    let discarded = slot.take();
                    self.set_state(ConnectionState::Disconnected);
                    discarded
                };
                warn!(
                    state = %event.state,
                    handle = ?event.handle,
                    "ensemble session lost, handle discarded"
                );
                drop(discarded);
                for listener in self.listeners() {
                    listener.on_disconnected().await;
                }
            }
            SessionEvent::ConnectedReadOnly => {
                warn!("ensemble session is read-only, claims are not possible until it syncs");
            }
        }
    }
}

/// Forwards watcher events to the manager without keeping it alive.
struct ManagerEvents<E: Ensemble> {
    inner: Weak<ManagerInner<E>>,
}

#[async_trait]
impl<E: Ensemble> SessionListener for ManagerEvents<E> {
    async fn on_event(&self, event: WatchedEvent) -> CoordinationResult<()> {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_event(event).await;
        }
        Ok(())
    }
}

/// Connection manager for the coordination ensemble.
///
/// Cloning is cheap; all clones share one session handle.
pub struct ConnectionManager<E: Ensemble> {
    inner: Arc<ManagerInner<E>>,
}

impl<E: Ensemble> Clone for ConnectionManager<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Ensemble> ConnectionManager<E> {
    /// Create a manager in `Disconnected` state and subscribe it to `watcher`.
    ///
    /// Every session this manager opens reports its events to `watcher`.
    pub fn new(ensemble: E, watcher: SessionWatcher, readiness: ReadinessPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(ManagerInner {
            ensemble,
            watcher: watcher.clone(),
            readiness,
            session: Mutex::new(None),
            next_handle: AtomicU64::new(1),
            state,
            opening: tokio::sync::Mutex::new(()),
            timeouts: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
        });
        watcher.subscribe(Arc::new(ManagerEvents {
            inner: Arc::downgrade(&inner),
        }));
        Self { inner }
    }

    /// Register for connected/disconnected notifications.
    pub fn subscribe(&self, listener: Arc<dyn ConnectionListener>) {
        self.inner.listeners.write().push(listener);
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn ensemble(&self) -> &E {
        &self.inner.ensemble
    }

    pub fn readiness(&self) -> ReadinessPolicy {
        self.inner.readiness
    }

    /// Returns true while `session` is the handle this manager hands out.
    /// A discarded handle never becomes current again.
    pub fn is_current(&self, session: &Arc<E::Session>) -> bool {
        self.inner
            .session
            .lock()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(&current.session, session))
    }

    /// Returns a connected session handle, opening one if needed.
    ///
    /// Waits up to the readiness budget for `Connected`. On timeout the
    /// half-open handle is discarded and `ConnectionTimeout` is returned.
    /// Callers queued behind a timed-out attempt get the same timeout instead
    /// of starting another wait.
    pub async fn active_session(&self) -> CoordinationResult<Arc<E::Session>> {
        if let Some(session) = self.inner.ready_session() {
            return Ok(session);
        }

        let timeouts_seen = self.inner.timeouts.load(Ordering::Acquire);
        let _opening = self.inner.opening.lock().await;
        if let Some(session) = self.inner.ready_session() {
            return Ok(session);
        }
        let budget = self.inner.readiness.budget();
        if self.inner.timeouts.load(Ordering::Acquire) != timeouts_seen {
            return Err(CoordinationError::ConnectionTimeout { waited: budget });
        }

        let mut state = self.inner.state.subscribe();
        let session = self.current_or_open()?;

        let ready = tokio::time::timeout(budget, async {
            state
                .wait_for(|state| *state == ConnectionState::Connected)
                .await
                .map(|_| ())
        })
        .await;

        match ready {
            Ok(Ok(_)) => self.inner.ready_session().ok_or_else(|| {
                CoordinationError::NotConnected("session lost right after connecting".into())
            }),
            Ok(Err(_)) => Err(CoordinationError::NotConnected(
                "connection state channel closed".into(),
            )),
            Err(_) => {
                {
                    let mut slot = self.inner.session.lock();
                    if slot
                        .as_ref()
                        .is_some_and(|current| Arc::ptr_eq(&current.session, &session))
                    {
                        *slot = None;
                        self.inner.set_state(ConnectionState::Disconnected);
                    }
                }
                self.inner.timeouts.fetch_add(1, Ordering::AcqRel);
                metrics::CONNECTION_TIMEOUTS.inc();
                warn!(
                    waited_ms = budget.as_millis(),
                    polls = self.inner.readiness.max_polls,
                    "ensemble session not ready, discarding handle"
                );
                Err(CoordinationError::ConnectionTimeout { waited: budget })
            }
        }
    }

    fn current_or_open(&self) -> CoordinationResult<Arc<E::Session>> {
        let mut slot = self.inner.session.lock();
        if let Some(current) = slot.as_ref() {
            return Ok(Arc::clone(&current.session));
        }
        let id = HandleId(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        // state must read Connecting before the client can report anything
        self.inner.set_state(ConnectionState::Connecting);
        match self.inner.ensemble.open(self.inner.watcher.for_handle(id)) {
            Ok(session) => {
                let session = Arc::new(session);
                *slot = Some(Current {
                    id,
                    session: Arc::clone(&session),
                });
                info!(handle = %id, "opened new ensemble session handle");
                Ok(session)
            }
            Err(err) => {
                self.inner.set_state(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    /// Drop the current session, e.g. on process shutdown.
    pub fn shutdown(&self) {
        let discarded = {
            let mut slot = self.inner.session.lock();
            self.inner.set_state(ConnectionState::Disconnected);
            slot.take()
        };
        if discarded.is_some() {
            info!("ensemble session closed");
        }
    }
}

impl<E: Ensemble> fmt::Debug for ConnectionManager<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("ensemble", &self.inner.ensemble)
            .field("state", &self.connection_state())
            .field("readiness", &self.inner.readiness)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::memory::MemoryEnsemble;

    fn manager(ensemble: MemoryEnsemble) -> ConnectionManager<MemoryEnsemble> {
        ConnectionManager::new(ensemble, SessionWatcher::new(), ReadinessPolicy::default())
    }

    #[derive(Default)]
    struct Counts {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionListener for Counts {
        async fn on_connected(&self) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_disconnected(&self) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_initial_state() {
        let mgr = manager(MemoryEnsemble::new());
        assert_eq!(mgr.connection_state(), ConnectionState::Disconnected);
        assert!(!mgr.is_connected());
        assert_eq!(mgr.ensemble().sessions_opened(), 0);
    }

    #[tokio::test]
    async fn test_active_session_connects() {
        let mgr = manager(MemoryEnsemble::new());
        let counts = Arc::new(Counts::default());
        mgr.subscribe(counts.clone());

        mgr.active_session().await.unwrap();
        assert!(mgr.is_connected());
        assert_eq!(counts.connected.load(Ordering::SeqCst), 1);

        // already connected, no new handle
        mgr.active_session().await.unwrap();
        assert_eq!(mgr.ensemble().sessions_opened(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_session() {
        let mgr = manager(MemoryEnsemble::new());
        let (a, b, c) = tokio::join!(
            mgr.active_session(),
            mgr.active_session(),
            mgr.active_session()
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&b, &c));
        assert_eq!(mgr.ensemble().sessions_opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_timeout_after_budget() {
        let mgr = manager(MemoryEnsemble::unreachable());
        let start = tokio::time::Instant::now();

        let err = mgr.active_session().await.unwrap_err();
        let waited = start.elapsed();

        assert!(err.is_timeout());
        assert!(waited >= Duration::from_millis(100) * 50);
        assert!(waited < Duration::from_millis(100) * 51);
        assert_eq!(mgr.connection_state(), ConnectionState::Disconnected);

        // the half-open handle was discarded, the next call opens a fresh one
        let _ = mgr.active_session().await;
        assert_eq!(mgr.ensemble().sessions_opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_timeout() {
        let mgr = manager(MemoryEnsemble::unreachable());
        let (a, b) = tokio::join!(mgr.active_session(), mgr.active_session());
        assert!(a.unwrap_err().is_timeout());
        assert!(b.unwrap_err().is_timeout());
        assert_eq!(mgr.ensemble().sessions_opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_connect_within_budget() {
        let ensemble = MemoryEnsemble::unreachable();
        let mgr = manager(ensemble.clone());

        let connector = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let id = ensemble.latest_session().unwrap();
            ensemble.connect(id).await;
        });

        assert!(mgr.active_session().await.is_ok());
        connector.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_loss_discards_handle() {
        let mgr = manager(MemoryEnsemble::new());
        let counts = Arc::new(Counts::default());
        mgr.subscribe(counts.clone());

        let first = mgr.active_session().await.unwrap();
        let id = mgr.ensemble().latest_session().unwrap();
        mgr.ensemble().expire(id).await;

        assert_eq!(mgr.connection_state(), ConnectionState::Disconnected);
        assert_eq!(counts.disconnected.load(Ordering::SeqCst), 1);

        let second = mgr.active_session().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(mgr.ensemble().sessions_opened(), 2);
        assert_eq!(counts.connected.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown() {
        let mgr = manager(MemoryEnsemble::new());
        mgr.active_session().await.unwrap();
        mgr.shutdown();
        assert_eq!(mgr.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_from_a_discarded_handle_are_ignored() {
        let ensemble = MemoryEnsemble::unreachable();
        let watcher = SessionWatcher::new();
        let mgr = ConnectionManager::new(ensemble.clone(), watcher.clone(), ReadinessPolicy::default());

        // the first handle never connects and is discarded
        assert!(mgr.active_session().await.unwrap_err().is_timeout());
        let stale = watcher.for_handle(HandleId(1));

        let waiter = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.active_session().await })
        };
        while mgr.connection_state() != ConnectionState::Connecting {
            tokio::task::yield_now().await;
        }
        assert_eq!(ensemble.sessions_opened(), 2);

        // the old client reporting late must not touch the new handle
        stale.on_event(SessionEvent::SyncConnected).await;
        assert_eq!(mgr.connection_state(), ConnectionState::Connecting);
        stale.on_event(SessionEvent::Expired).await;
        assert_eq!(mgr.connection_state(), ConnectionState::Connecting);

        let id = ensemble.latest_session().unwrap();
        ensemble.connect(id).await;
        let session = waiter.await.unwrap().unwrap();
        assert_eq!(session.id(), id);
        assert!(mgr.is_connected());
        assert!(mgr.is_current(&session));
    }

    #[tokio::test]
    async fn test_discarded_handle_is_not_current() {
        let mgr = manager(MemoryEnsemble::new());
        let first = mgr.active_session().await.unwrap();
        assert!(mgr.is_current(&first));

        mgr.ensemble().expire(first.id()).await;
        assert!(!mgr.is_current(&first));

        let second = mgr.active_session().await.unwrap();
        assert!(mgr.is_current(&second));
        assert!(!mgr.is_current(&first));
    }
}
