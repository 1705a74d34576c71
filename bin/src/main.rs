#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

mod startup_health;

use external_api::{ExternalApi, Health};
use sequence_coordination::{
    ConnectionManager, CoordinationConfig, ReadinessPolicy, SequenceAllocator, SequenceSource,
    SessionWatcher, ZkEnsemble,
};
use sequence_core::{
    config::{
        cli::{self, Parser},
        trace,
    },
    tokio::{self, runtime::Builder, signal},
    tracing::*,
};
use startup_health::verify_startup_subsystems;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    if let Err(err) = dotenv::dotenv() {
        eprintln!(".env file not loaded: {err}");
    }
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.sequence_log)?;
    debug!(?config, ?trace_config);

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start server"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

/// Ensemble and allocator settings from the cli config
fn coordination_config(config: &cli::Config) -> Result<CoordinationConfig> {
    let coordination = CoordinationConfig {
        servers: config.zk_servers.clone(),
        session_timeout: config.session_timeout(),
        root_path: config.root_path.clone(),
        instance_id: config.instance_id()?,
        readiness: ReadinessPolicy {
            poll_interval: config.ready_poll_interval(),
            max_polls: config.ready_max_polls,
        },
        claim_attempts: config.claim_attempts,
    };
    coordination
        .validate()
        .context("invalid coordination configuration")?;
    Ok(coordination)
}

async fn start(config: cli::Config) -> Result<()> {
    let coordination = coordination_config(&config)?;
    info!(
        servers = %coordination.servers,
        root = %coordination.root_path,
        instance_id = %coordination.instance_id,
        "using coordination ensemble"
    );

    let ensemble = ZkEnsemble::from_config(&coordination)?;
    let connection = ConnectionManager::new(ensemble, SessionWatcher::new(), coordination.readiness);
    let allocator = Arc::new(SequenceAllocator::from_config(
        connection.clone(),
        &coordination,
    ));

    let token = CancellationToken::new();
    let api = ExternalApi::new(config.external_api, allocator.clone());
    let api_sender = api.sender();
    let mut api_guard = api.start(token.clone());

    let eager = config
        .claim_on_startup
        .then_some((allocator.as_ref() as &dyn SequenceSource, &token));
    // Keep health BAD until all startup-critical tasks are confirmed running.
    if let Err(err) = verify_startup_subsystems(&mut api_guard, eager).await {
        let _ = api_sender.send(Health::Bad).await;
        token.cancel();
        connection.shutdown();
        return Err(err);
    }

    debug!("changing health to good after startup checks passed");
    api_sender
        .send(Health::Good)
        .await
        .context("error occurred in changing health status to Good")?;

    let res = shutdown_signal(token.clone()).await;
    info!("shutting down");
    let _ = api_sender.send(Health::Bad).await;
    if let Err(err) = api_guard.await {
        error!(?err, "error waiting for web server API");
    }
    // dropping the session releases our claim
    connection.shutdown();
    res
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
