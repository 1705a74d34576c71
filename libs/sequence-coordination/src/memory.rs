//! In-process coordination tree.
//!
//! Behaves like a single-server ensemble: atomic create, persistent and
//! ephemeral nodes, sessions whose ephemeral nodes vanish when they expire or
//! disconnect. Several [`ConnectionManager`]s built on clones of one
//! [`MemoryEnsemble`] act as independent instances sharing one tree. Faults
//! can be injected to force collisions, transient failures, or a server that
//! never connects.
//!
//! [`ConnectionManager`]: crate::ConnectionManager

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::ensemble::{CreateMode, Ensemble, Session, SessionEvent};
use crate::error::{CoordinationError, CoordinationResult};
use crate::watcher::SessionWatcher;

/// Identifies a session inside a [`MemoryEnsemble`].
pub type SessionId = u64;

#[derive(Debug, Clone)]
struct MemoryNode {
    data: Vec<u8>,
    owner: Option<SessionId>,
}

#[derive(Debug)]
struct MemorySessionEntry {
    /// `None` for sessions seeded directly into the tree
    watcher: Option<SessionWatcher>,
    alive: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Faults {
    collide_all_creates: bool,
    steal_next_claims: u32,
    fail_next_creates: u32,
    claim_delay: Duration,
}

/// Round trips served so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallStats {
    pub exists: usize,
    pub creates: usize,
    pub children: usize,
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, MemoryNode>,
    sessions: HashMap<SessionId, MemorySessionEntry>,
    next_session: SessionId,
    latest_opened: Option<SessionId>,
    opened: usize,
    connect_on_open: bool,
    faults: Faults,
    stats: CallStats,
}

impl Tree {
    fn new(connect_on_open: bool) -> Self {
        Self {
            nodes: BTreeMap::new(),
            sessions: HashMap::new(),
            next_session: 1,
            latest_opened: None,
            opened: 0,
            connect_on_open,
            faults: Faults::default(),
            stats: CallStats::default(),
        }
    }

    fn register(&mut self, watcher: Option<SessionWatcher>) -> SessionId {
        let id = self.next_session;
        self.next_session += 1;
        self.sessions.insert(
            id,
            MemorySessionEntry {
                watcher,
                alive: true,
            },
        );
        id
    }

    fn check_alive(&self, id: SessionId) -> CoordinationResult<()> {
        match self.sessions.get(&id) {
            Some(entry) if entry.alive => Ok(()),
            _ => Err(CoordinationError::NotConnected(format!(
                "memory session {id} is closed"
            ))),
        }
    }

    fn insert(
        &mut self,
        path: &str,
        data: &[u8],
        owner: Option<SessionId>,
    ) -> CoordinationResult<()> {
        if self.nodes.contains_key(path) {
            return Err(CoordinationError::NodeExists(path.to_owned()));
        }
        let parent = parent_of(path);
        if parent != "/" && !self.nodes.contains_key(parent) {
            return Err(CoordinationError::NoNode(parent.to_owned()));
        }
        self.nodes.insert(
            path.to_owned(),
            MemoryNode {
                data: data.to_vec(),
                owner,
            },
        );
        Ok(())
    }

    /// Mark a session dead and drop its ephemeral nodes.
    fn end_session(&mut self, id: SessionId) -> Option<SessionWatcher> {
        let entry = self.sessions.get_mut(&id)?;
        entry.alive = false;
        let watcher = entry.watcher.clone();
        self.nodes.retain(|_, node| node.owner != Some(id));
        watcher
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Shared in-memory ensemble. Clones share one tree.
#[derive(Debug, Clone)]
pub struct MemoryEnsemble {
    tree: Arc<Mutex<Tree>>,
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnsemble {
    /// Sessions report `SyncConnected` shortly after they are opened.
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new(true))),
        }
    }

    /// Sessions never connect unless [`connect`](Self::connect) is called.
    pub fn unreachable() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new(false))),
        }
    }

    pub fn sessions_opened(&self) -> usize {
        self.tree.lock().opened
    }

    pub fn latest_session(&self) -> Option<SessionId> {
        self.tree.lock().latest_opened
    }

    pub fn stats(&self) -> CallStats {
        self.tree.lock().stats
    }

    /// Deliver `SyncConnected` to a session opened while unreachable.
    pub async fn connect(&self, id: SessionId) {
        let watcher = {
            let tree = self.tree.lock();
            tree.sessions
                .get(&id)
                .filter(|entry| entry.alive)
                .and_then(|entry| entry.watcher.clone())
        };
        if let Some(watcher) = watcher {
            watcher.on_event(SessionEvent::SyncConnected).await;
        }
    }

    /// Expire a session: its ephemeral nodes are removed and its client is
    /// told `Expired`.
    pub async fn expire(&self, id: SessionId) {
        self.end_session(id, SessionEvent::Expired).await
    }

    /// Drop a session's connection. The tree treats it as gone at once, which
    /// is what an instance that never comes back looks like after its
    /// session timeout.
    pub async fn disconnect(&self, id: SessionId) {
        self.end_session(id, SessionEvent::Disconnected).await
    }

    async fn end_session(&self, id: SessionId, event: SessionEvent) {
        let watcher = self.tree.lock().end_session(id);
        debug!(session = id, state = %event, "memory session ended");
        if let Some(watcher) = watcher {
            watcher.on_event(event).await;
        }
    }

    /// Report `Disconnected` to a session's client while the tree keeps the
    /// session and its ephemeral nodes, as a server does until the session
    /// timeout runs out.
    pub async fn interrupt(&self, id: SessionId) {
        let watcher = {
            let tree = self.tree.lock();
            tree.sessions
                .get(&id)
                .filter(|entry| entry.alive)
                .and_then(|entry| entry.watcher.clone())
        };
        debug!(session = id, "memory session interrupted");
        if let Some(watcher) = watcher {
            watcher.on_event(SessionEvent::Disconnected).await;
        }
    }

    /// Delete `path` and everything below it, as an operator would.
    pub fn remove_tree(&self, path: &str) {
        let prefix = format!("{path}/");
        self.tree
            .lock()
            .nodes
            .retain(|node, _| node != path && !node.starts_with(&prefix));
    }

    /// Create `root` if needed and claim `numbers` under it on behalf of a
    /// foreign session, which is returned so it can be expired later.
    pub fn seed_claims(&self, root: &str, numbers: &[u32]) -> SessionId {
        let mut tree = self.tree.lock();
        if !tree.nodes.contains_key(root) {
            tree.nodes.insert(
                root.to_owned(),
                MemoryNode {
                    data: Vec::new(),
                    owner: None,
                },
            );
        }
        let owner = tree.register(None);
        for number in numbers {
            let path = format!("{root}/{number}");
            let data = format!("seed-{owner}");
            tree.nodes.insert(
                path,
                MemoryNode {
                    data: data.into_bytes(),
                    owner: Some(owner),
                },
            );
        }
        owner
    }

    /// Current numeric claims under `root` with their payloads.
    pub fn claims(&self, root: &str) -> BTreeMap<u32, String> {
        let prefix = format!("{root}/");
        self.tree
            .lock()
            .nodes
            .iter()
            .filter_map(|(path, node)| {
                let name = path.strip_prefix(&prefix)?;
                let number = name.parse::<u32>().ok()?;
                Some((number, String::from_utf8_lossy(&node.data).into_owned()))
            })
            .collect()
    }

    pub fn node_exists(&self, path: &str) -> bool {
        self.tree.lock().nodes.contains_key(path)
    }

    /// Every ephemeral create fails with `NodeExists`.
    pub fn collide_all_creates(&self, collide: bool) {
        self.tree.lock().faults.collide_all_creates = collide;
    }

    /// The next `count` ephemeral creates lose their race: another session
    /// creates the node first.
    pub fn steal_next_claims(&self, count: u32) {
        self.tree.lock().faults.steal_next_claims = count;
    }

    /// The next `count` creates fail with a transport error.
    pub fn fail_next_creates(&self, count: u32) {
        self.tree.lock().faults.fail_next_creates = count;
    }

    /// Ephemeral creates wait `delay` before reaching the tree.
    pub fn delay_claims(&self, delay: Duration) {
        self.tree.lock().faults.claim_delay = delay;
    }
}

impl Ensemble for MemoryEnsemble {
    type Session = MemorySession;

    fn open(&self, watcher: SessionWatcher) -> CoordinationResult<Self::Session> {
        let (id, connect) = {
            let mut tree = self.tree.lock();
            let id = tree.register(Some(watcher.clone()));
            tree.opened += 1;
            tree.latest_opened = Some(id);
            (id, tree.connect_on_open)
        };
        if connect {
            tokio::spawn(async move {
                watcher.on_event(SessionEvent::SyncConnected).await;
            });
        }
        Ok(MemorySession {
            id,
            tree: Arc::clone(&self.tree),
        })
    }
}

/// Session handle on a [`MemoryEnsemble`].
#[derive(Debug)]
pub struct MemorySession {
    id: SessionId,
    tree: Arc<Mutex<Tree>>,
}

impl MemorySession {
    pub fn id(&self) -> SessionId {
        self.id
    }
}

/// Closing a handle ends its session, like a client close.
impl Drop for MemorySession {
    fn drop(&mut self) {
        self.tree.lock().end_session(self.id);
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn exists(&self, path: &str) -> CoordinationResult<bool> {
        tokio::task::yield_now().await;
        let mut tree = self.tree.lock();
        tree.stats.exists += 1;
        tree.check_alive(self.id)?;
        Ok(tree.nodes.contains_key(path))
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordinationResult<()> {
        tokio::task::yield_now().await;
        let delay = self.tree.lock().faults.claim_delay;
        if mode == CreateMode::Ephemeral && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut tree = self.tree.lock();
        tree.stats.creates += 1;
        tree.check_alive(self.id)?;

        if tree.faults.fail_next_creates > 0 {
            tree.faults.fail_next_creates -= 1;
            return Err(CoordinationError::Transport(format!(
                "injected failure creating {path}"
            )));
        }

        match mode {
            CreateMode::Persistent => tree.insert(path, data, None),
            CreateMode::Ephemeral => {
                if tree.faults.collide_all_creates {
                    return Err(CoordinationError::NodeExists(path.to_owned()));
                }
                if tree.faults.steal_next_claims > 0 && !tree.nodes.contains_key(path) {
                    tree.faults.steal_next_claims -= 1;
                    let thief = tree.register(None);
                    tree.insert(path, b"thief", Some(thief))?;
                    return Err(CoordinationError::NodeExists(path.to_owned()));
                }
                tree.insert(path, data, Some(self.id))
            }
        }
    }

    async fn children(&self, path: &str) -> CoordinationResult<Vec<String>> {
        tokio::task::yield_now().await;
        let mut tree = self.tree.lock();
        tree.stats.children += 1;
        tree.check_alive(self.id)?;
        if !tree.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_owned()));
        }
        let prefix = format!("{path}/");
        Ok(tree
            .nodes
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|name| !name.contains('/'))
            .map(str::to_owned)
            .collect())
    }
}
