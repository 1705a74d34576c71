//! # sequence-coordination
//!
//! Assigns every running instance of a service a unique, densely packed
//! sequence number by coordinating through a ZooKeeper ensemble.
//!
//! This library provides:
//! - **Session watcher** relaying connectivity events to subscribers in order.
//! - **Connection manager** owning the one session handle, with a bounded
//!   wait-until-connected accessor and connected/disconnected notifications.
//! - **Sequence allocator** claiming the lowest free number as an ephemeral
//!   node, retrying on contention and resetting whenever the session is lost.
//! - **Ensemble backends**: ZooKeeper via `zookeeper-client`, and an in-memory
//!   tree for simulating many instances.
//!
//! ## Guarantees
//!
//! - No two live sessions hold the same number: claims are atomic creates.
//! - A departed instance's number is reused once the ensemble drops its
//!   ephemeral node.
//! - Allocation never reports a number it does not hold.

pub mod allocator;
pub mod config;
pub mod connection;
pub mod ensemble;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod watcher;
pub mod zookeeper;

// Re-export key types for convenient access
pub use allocator::{SequenceAllocator, SequenceSource, first_free};
pub use config::{CoordinationConfig, ReadinessPolicy};
pub use connection::{ConnectionListener, ConnectionManager, ConnectionState};
pub use ensemble::{CreateMode, Ensemble, Session, SessionEvent};
pub use error::{CoordinationError, CoordinationResult};
pub use memory::MemoryEnsemble;
pub use watcher::{HandleId, SessionListener, SessionWatcher, SubscriptionId, WatchedEvent};
pub use zookeeper::{ZkEnsemble, ZkSession};
