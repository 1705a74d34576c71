//! sequence-node configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default zookeeper connection string
    pub static DEFAULT_ZK_SERVERS: &str = "127.0.0.1:2181";
    /// Default zookeeper session timeout (ms)
    pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 5_000;
    /// Default parent node for sequence claims
    pub static DEFAULT_ROOT_PATH: &str = "/sequence";
    /// Default external api
    pub static DEFAULT_EXTERNAL_API: &str = "[::]:8080";
    /// Default interval between readiness checks (ms)
    pub const DEFAULT_READY_POLL_INTERVAL_MS: u64 = 100;
    /// Default number of readiness checks before giving up
    pub const DEFAULT_READY_MAX_POLLS: u32 = 50;
    /// Default number of claim attempts per allocation
    pub const DEFAULT_CLAIM_ATTEMPTS: u32 = 5;
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "sequence-worker";
    /// default log level. Can use this argument or SEQUENCE_LOG env var
    pub const DEFAULT_SEQUENCE_LOG: &str = "info";

    use std::{net::SocketAddr, time::Duration};

    use anyhow::{Context, Result};
    pub use clap::Parser;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "sequence-node", bin_name = "sequence-node", about, long_about = None)]
    /// parses from cli & environment var. `.env` in the working dir is loaded as well
    pub struct Config {
        /// comma separated zookeeper hosts, ex. "zk1:2181,zk2:2181"
        #[clap(long, env, value_parser, default_value = DEFAULT_ZK_SERVERS)]
        pub zk_servers: String,
        /// zookeeper session timeout in milliseconds
        #[clap(long, env, value_parser, default_value_t = DEFAULT_SESSION_TIMEOUT_MS)]
        pub session_timeout_ms: u64,
        /// parent node under which sequence numbers are claimed
        #[clap(long, env, value_parser, default_value = DEFAULT_ROOT_PATH)]
        pub root_path: String,
        /// payload written into claimed nodes, defaults to the hostname
        #[clap(long, env, value_parser)]
        pub instance_id: Option<String>,
        /// the address the external api listens on
        #[clap(long, env, value_parser, default_value = DEFAULT_EXTERNAL_API)]
        pub external_api: SocketAddr,
        /// delay between connection readiness checks in milliseconds
        #[clap(long, env, value_parser, default_value_t = DEFAULT_READY_POLL_INTERVAL_MS)]
        pub ready_poll_interval_ms: u64,
        /// number of readiness checks before a request fails
        #[clap(long, env, value_parser, default_value_t = DEFAULT_READY_MAX_POLLS)]
        pub ready_max_polls: u32,
        /// claim attempts before an allocation gives up
        #[clap(long, env, value_parser, default_value_t = DEFAULT_CLAIM_ATTEMPTS)]
        pub claim_attempts: u32,
        /// claim a sequence number during start-up instead of on first request
        #[clap(long, env, value_parser, default_value_t = false)]
        pub claim_on_startup: bool,
        /// number of tokio worker threads, defaults to the number of cores
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_SEQUENCE_LOG)]
        pub sequence_log: String,
    }

    impl Config {
        /// zookeeper session timeout as `Duration`
        pub fn session_timeout(&self) -> Duration {
            Duration::from_millis(self.session_timeout_ms)
        }

        /// readiness poll interval as `Duration`
        pub fn ready_poll_interval(&self) -> Duration {
            Duration::from_millis(self.ready_poll_interval_ms)
        }

        /// the configured instance id, or this host's name
        pub fn instance_id(&self) -> Result<String> {
            match &self.instance_id {
                Some(id) => Ok(id.clone()),
                None => hostname::get()
                    .context("failed to read hostname")?
                    .into_string()
                    .map_err(|name| anyhow::anyhow!("hostname is not valid utf-8: {name:?}")),
            }
        }
    }

}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    use crate::env::parse_var_with_err;

    /// log as "json", "pretty" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Logging configuration
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber. `sequence_log` is an `EnvFilter` directive
        pub fn parse(sequence_log: &str) -> Result<Self> {
            let log_frmt: String = parse_var_with_err("LOG_FORMAT", DEFAULT_LOG_FORMAT)?;

            let filter = EnvFilter::try_new(sequence_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?);

            match &log_frmt[..] {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self { log_frmt })
        }
    }
}
