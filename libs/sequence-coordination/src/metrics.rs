//! Sequence coordination metrics.
//!
//! Registered lazily on first access via `lazy_static!`. Registration failure
//! is a programming error and panics at start-up.

use lazy_static::lazy_static;
use prometheus::{
    IntCounter, IntCounterVec, IntGauge, register_int_counter, register_int_counter_vec,
    register_int_gauge,
};
use prometheus_static_metric::make_static_metric;

make_static_metric! {
    pub label_enum ClaimOutcome {
        claimed,
        collision,
        error,
    }
    pub struct ClaimStats: IntCounter {
        "outcome" => ClaimOutcome
    }
}

lazy_static! {
    pub static ref CLAIM_ATTEMPT_VEC: IntCounterVec = register_int_counter_vec!(
        "sequence_claim_attempts",
        "count of sequence claim attempts by outcome",
        &["outcome"]
    )
    .unwrap();

    /// claim attempts split by outcome
    pub static ref CLAIM_ATTEMPTS: ClaimStats = ClaimStats::from(&CLAIM_ATTEMPT_VEC);

    /// Count of allocations that used their whole attempt budget without a claim
    pub static ref ALLOCATIONS_EXHAUSTED: IntCounter = register_int_counter!(
        "sequence_allocations_exhausted",
        "count of sequence allocations that exhausted their claim budget"
    ).unwrap();

    /// Count of cached assignments dropped because the session was lost
    pub static ref SESSION_RESETS: IntCounter = register_int_counter!(
        "sequence_session_resets",
        "count of allocator resets caused by session loss"
    ).unwrap();

    /// Count of readiness waits that ended in a timeout
    pub static ref CONNECTION_TIMEOUTS: IntCounter = register_int_counter!(
        "sequence_connection_timeouts",
        "count of ensemble readiness waits that timed out"
    ).unwrap();

    /// Gauge: current coordination state (1=connected, 0=otherwise)
    pub static ref COORDINATION_STATE: IntGauge = register_int_gauge!(
        "sequence_coordination_state",
        "current ensemble connection state (1=connected, 0=disconnected/connecting)"
    ).unwrap();

    /// Gauge: currently held sequence number, 0 when unassigned
    pub static ref ASSIGNED_SEQUENCE: IntGauge = register_int_gauge!(
        "sequence_assigned_number",
        "sequence number held by this instance (0=unassigned)"
    ).unwrap();
}
