use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use sequence_coordination::SequenceSource;
use sequence_core::{
    tokio::{self, task::JoinHandle},
    tracing::info,
};
use tokio_util::sync::CancellationToken;

const STARTUP_STABILIZATION_WINDOW: Duration = Duration::from_millis(300);

/// Keep health BAD until every start-up critical piece is confirmed
pub async fn verify_startup_subsystems(
    api_task: &mut JoinHandle<()>,
    eager: Option<(&dyn SequenceSource, &CancellationToken)>,
) -> Result<()> {
    verify_background_task_running("external API", api_task)
        .await
        .context("startup check failed")?;
    if let Some((source, token)) = eager {
        let number = source
            .sequence_number(token)
            .await
            .context("startup check failed: could not claim a sequence number")?;
        info!(number, "claimed sequence number during startup");
    }
    Ok(())
}

pub async fn verify_background_task_running(name: &str, task: &mut JoinHandle<()>) -> Result<()> {
    match tokio::time::timeout(STARTUP_STABILIZATION_WINDOW, task).await {
        Err(_) => Ok(()),
        Ok(join_res) => match join_res {
            Ok(()) => Err(anyhow!("{name} exited during startup stabilization window")),
            Err(err) => Err(anyhow!("{name} panicked during startup: {err}")),
        },
    }
}
