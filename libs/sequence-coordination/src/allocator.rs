//! Gap-filling sequence number allocation.
//!
//! Each instance holds one ephemeral child of the root node, named after its
//! number. The number picked is always the smallest positive integer no live
//! instance holds, so numbers stay dense and are reused as soon as the
//! ensemble drops a departed instance's claim.

use std::fmt;
use std::future::Future;
use std::iter;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CoordinationConfig;
use crate::connection::{ConnectionListener, ConnectionManager};
use crate::ensemble::{CreateMode, Ensemble, Session};
use crate::error::{CoordinationError, CoordinationResult};
use crate::metrics;

/// Lowest number handed out.
pub const FIRST_SEQUENCE: u32 = 1;

/// Answers "what is this instance's number".
#[async_trait]
pub trait SequenceSource: Send + Sync + 'static {
    /// Returns the held number, claiming one first if needed.
    async fn sequence_number(&self, cancel: &CancellationToken) -> CoordinationResult<u32>;

    /// The held number, if any, without touching the ensemble.
    fn assigned(&self) -> Option<u32>;
}

/// Smallest positive integer missing from `sorted` (ascending, deduplicated),
/// or `None` when every number up to `u32::MAX` is taken.
pub fn first_free(sorted: &[u32]) -> Option<u32> {
    first_free_up_to(sorted, u32::MAX)
}

fn first_free_up_to(sorted: &[u32], max: u32) -> Option<u32> {
    let mut candidate = FIRST_SEQUENCE;
    for &taken in sorted {
        if taken > candidate {
            break;
        }
        if taken == candidate {
            if candidate == max {
                return None;
            }
            candidate += 1;
        }
    }
    Some(candidate)
}

/// `/a/b/c` yields `/a`, `/a/b`, `/a/b/c`.
fn path_prefixes(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/')
        .skip(1)
        .map(move |(idx, _)| &path[..idx])
        .chain(iter::once(path))
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = CoordinationResult<T>>,
) -> CoordinationResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CoordinationError::Cancelled),
        res = fut => res,
    }
}

#[derive(Debug, Default)]
struct Assignment {
    /// bumped on every session loss
    generation: u64,
    number: Option<u32>,
    root_confirmed: bool,
}

/// Allocation state shared with the connection manager's listener list.
#[derive(Debug, Default)]
struct AllocatorState {
    assignment: Mutex<Assignment>,
}

impl AllocatorState {
    fn cached(&self) -> Option<u32> {
        self.assignment.lock().number
    }

    fn generation(&self) -> u64 {
        self.assignment.lock().generation
    }

    fn root_confirmed(&self, generation: u64) -> bool {
        let assignment = self.assignment.lock();
        assignment.generation == generation && assignment.root_confirmed
    }

    fn confirm_root(&self, generation: u64) {
        let mut assignment = self.assignment.lock();
        if assignment.generation == generation {
            assignment.root_confirmed = true;
        }
    }

    /// The root vanished under a live session; check it again next attempt.
    fn forget_root(&self) {
        self.assignment.lock().root_confirmed = false;
    }

    /// Record a successful claim unless the session that made it is gone.
    fn assign(&self, generation: u64, number: u32) -> bool {
        let mut assignment = self.assignment.lock();
        if assignment.generation != generation {
            return false;
        }
        assignment.number = Some(number);
        metrics::ASSIGNED_SEQUENCE.set(i64::from(number));
        true
    }

    /// Forget everything tied to the lost session.
    fn reset(&self) -> Option<u32> {
        let mut assignment = self.assignment.lock();
        assignment.generation = assignment.generation.wrapping_add(1);
        assignment.root_confirmed = false;
        metrics::ASSIGNED_SEQUENCE.set(0);
        assignment.number.take()
    }
}

#[async_trait]
impl ConnectionListener for AllocatorState {
    async fn on_connected(&self) {
        debug!("session connected, sequence claim deferred until requested");
    }

    async fn on_disconnected(&self) {
        metrics::SESSION_RESETS.inc();
        match self.reset() {
            Some(number) => warn!(number, "session lost, sequence number released"),
            None => debug!("session lost while unassigned"),
        }
    }
}

/// Claims and caches this instance's sequence number.
pub struct SequenceAllocator<E: Ensemble> {
    connection: ConnectionManager<E>,
    state: Arc<AllocatorState>,
    root: String,
    instance_id: String,
    max_attempts: u32,
    /// one allocation in flight at a time
    claim: tokio::sync::Mutex<()>,
}

impl<E: Ensemble> SequenceAllocator<E> {
    /// Create an allocator and subscribe it to `connection`'s notifications.
    pub fn new(
        connection: ConnectionManager<E>,
        root: impl Into<String>,
        instance_id: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        let state = Arc::new(AllocatorState::default());
        connection.subscribe(state.clone());
        Self {
            connection,
            state,
            root: root.into(),
            instance_id: instance_id.into(),
            max_attempts,
            claim: tokio::sync::Mutex::new(()),
        }
    }

    pub fn from_config(connection: ConnectionManager<E>, config: &CoordinationConfig) -> Self {
        Self::new(
            connection,
            config.root_path.clone(),
            config.instance_id.clone(),
            config.claim_attempts,
        )
    }

    pub fn connection(&self) -> &ConnectionManager<E> {
        &self.connection
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn assigned(&self) -> Option<u32> {
        self.state.cached()
    }

    /// Make sure this instance holds a claim and return its number.
    ///
    /// Returns the cached number straight away while the session that claimed
    /// it is alive. Otherwise lists the current claims, picks the lowest free
    /// number and tries to create it, up to the attempt budget. Collisions and
    /// transient failures each use one attempt; running out yields
    /// `AllocationExhausted`.
    ///
    /// `cancel` is honoured at every round trip. Cancelling while a create is
    /// in flight may still leave the claim in the ensemble; it is released only
    /// when this process's session ends.
    pub async fn ensure_assigned(&self, cancel: &CancellationToken) -> CoordinationResult<u32> {
        if let Some(number) = self.state.cached() {
            return Ok(number);
        }
        let _claim = cancellable(cancel, async { Ok(self.claim.lock().await) }).await?;
        if let Some(number) = self.state.cached() {
            return Ok(number);
        }

        for attempt in 1..=self.max_attempts {
            let session = cancellable(cancel, self.connection.active_session()).await?;
            let generation = self.state.generation();

            let outcome = cancellable(cancel, async {
                self.ensure_root(session.as_ref(), generation).await?;
                let taken = self.claimed_numbers(session.as_ref()).await?;
                let candidate = first_free(&taken)
                    .ok_or(CoordinationError::NumberSpaceFull { max: u32::MAX })?;
                debug!(attempt, candidate, claimed = taken.len(), "claiming sequence number");
                self.claim(session.as_ref(), candidate).await?;
                Ok::<_, CoordinationError>(candidate)
            })
            .await;

            // a handle discarded mid-claim takes its claim with it when dropped
            match outcome {
                Ok(number)
                    if self.connection.is_current(&session)
                        && self.state.assign(generation, number) =>
                {
                    metrics::CLAIM_ATTEMPTS.claimed.inc();
                    info!(number, attempt, instance = %self.instance_id, "sequence number assigned");
                    return Ok(number);
                }
                Ok(number) => {
                    metrics::CLAIM_ATTEMPTS.error.inc();
                    warn!(number, attempt, "session lost during claim, retrying");
                }
                Err(CoordinationError::ClaimCollision(number)) => {
                    metrics::CLAIM_ATTEMPTS.collision.inc();
                    debug!(number, attempt, "sequence number taken by another instance");
                }
                Err(err @ CoordinationError::NoNode(_)) => {
                    metrics::CLAIM_ATTEMPTS.error.inc();
                    self.state.forget_root();
                    warn!(attempt, error = %err, root = %self.root, "sequence root missing, will recreate");
                }
                Err(err) if err.is_retryable() => {
                    metrics::CLAIM_ATTEMPTS.error.inc();
                    warn!(attempt, error = %err, "sequence claim attempt failed");
                }
                Err(err) => return Err(err),
            }
        }

        metrics::ALLOCATIONS_EXHAUSTED.inc();
        error!(
            attempts = self.max_attempts,
            root = %self.root,
            "could not claim a sequence number"
        );
        Err(CoordinationError::AllocationExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Check for the root node once per session, creating it (and any missing
    /// ancestors) if absent. Losing the create race is fine.
    async fn ensure_root(&self, session: &E::Session, generation: u64) -> CoordinationResult<()> {
        if self.state.root_confirmed(generation) {
            return Ok(());
        }
        if session.exists(&self.root).await? {
            debug!(root = %self.root, "sequence root node exists");
        } else {
            info!(root = %self.root, "creating sequence root node");
            for path in path_prefixes(&self.root) {
                match session.create(path, &[], CreateMode::Persistent).await {
                    Ok(()) => info!(path, "created persistent node"),
                    Err(CoordinationError::NodeExists(_)) => {
                        debug!(path, "persistent node already exists")
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        self.state.confirm_root(generation);
        Ok(())
    }

    /// Numbers currently held, ascending. Non-numeric children are skipped.
    async fn claimed_numbers(&self, session: &E::Session) -> CoordinationResult<Vec<u32>> {
        let names = session.children(&self.root).await?;
        let mut numbers = names
            .iter()
            .filter_map(|name| match name.parse::<u32>() {
                Ok(number) if number >= FIRST_SEQUENCE => Some(number),
                _ => {
                    warn!(child = %name, root = %self.root, "ignoring non-sequence child node");
                    None
                }
            })
            .collect::<Vec<_>>();
        numbers.sort_unstable();
        numbers.dedup();
        Ok(numbers)
    }

    async fn claim(&self, session: &E::Session, number: u32) -> CoordinationResult<()> {
        let path = format!("{}/{number}", self.root);
        match session
            .create(&path, self.instance_id.as_bytes(), CreateMode::Ephemeral)
            .await
        {
            Ok(()) => Ok(()),
            Err(CoordinationError::NodeExists(_)) => Err(CoordinationError::ClaimCollision(number)),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl<E: Ensemble> SequenceSource for SequenceAllocator<E> {
    async fn sequence_number(&self, cancel: &CancellationToken) -> CoordinationResult<u32> {
        self.ensure_assigned(cancel).await
    }

    fn assigned(&self) -> Option<u32> {
        self.state.cached()
    }
}

impl<E: Ensemble> fmt::Debug for SequenceAllocator<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceAllocator")
            .field("root", &self.root)
            .field("instance_id", &self.instance_id)
            .field("max_attempts", &self.max_attempts)
            .field("assigned", &self.state.cached())
            .finish_non_exhaustive()
    }
}
