#![allow(missing_docs)] // lazy_static items dont take docstrings well

//! # metrics
//!
//! process level statistics
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, register_int_counter, register_int_gauge};

lazy_static! {
    /// When the server started
    pub static ref START_TIME: Instant = Instant::now();

    /// server uptime
    pub static ref UPTIME: IntGauge = register_int_gauge!("uptime", "server uptime (seconds)").unwrap();

    /// requests served by the /sequence endpoint
    pub static ref SEQUENCE_REQUESTS: IntCounter = register_int_counter!("sequence_requests", "count of sequence number requests").unwrap();

    /// /sequence requests that ended in an error
    pub static ref SEQUENCE_REQUEST_ERRORS: IntCounter = register_int_counter!("sequence_request_errors", "count of sequence number requests that failed").unwrap();
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use prometheus::gather;

    use super::{SEQUENCE_REQUESTS, UPTIME};

    #[test]
    fn metrics_are_registered_and_exposed() {
        UPTIME.set(1);
        SEQUENCE_REQUESTS.inc();

        let names = gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect::<HashSet<_>>();

        assert!(names.contains("uptime"), "registered metric families: {names:?}");
        assert!(
            names.contains("sequence_requests"),
            "registered metric families: {names:?}"
        );
    }
}
