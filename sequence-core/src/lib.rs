//! # sequence-core
//!
//! configuration, tracing setup and process metrics shared by the
//! sequence-node binary and its external api
#![warn(
    missing_debug_implementations,
    missing_docs,
    missing_copy_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
pub use anyhow;
pub use clap;
pub use tokio;
pub use tracing;

pub mod config;
pub mod env;
pub mod metrics;
