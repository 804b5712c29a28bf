//! Scheduler command: runs both jobs on their schedules until Ctrl-C

use super::helpers::{load_config, open_storage};
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tagmaker_core::{
    evolution::EvolutionJob, BackgroundScheduler, EdgeLearner, JobMetrics, TagStore,
    TieringRebalancer,
};
use tracing::{info, warn};

/// Handle `serve`
pub async fn handle(db_path: Option<String>, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let storage: Arc<dyn TagStore> = open_storage(db_path).await?;
    let metrics = JobMetrics::new();

    let mut scheduler = BackgroundScheduler::new(config.clone());
    let learner: Arc<dyn EvolutionJob> =
        Arc::new(EdgeLearner::new(Arc::clone(&storage), &config, metrics.clone()));
    let rebalancer: Arc<dyn EvolutionJob> =
        Arc::new(TieringRebalancer::new(storage, &config, metrics.clone()));
    scheduler.register_job(learner);
    scheduler.register_job(rebalancer);

    let scheduler = Arc::new(scheduler);
    let runner = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.start().await })
    };

    info!("Scheduler running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down scheduler");
    scheduler.stop();

    match runner.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Scheduler stopped with error: {}", e),
        Err(e) => warn!("Scheduler task failed: {}", e),
    }

    for run in scheduler.get_job_history(None, 10).await {
        info!(
            "{} {} at {}: {:?}",
            run.job_name,
            run.id,
            run.started_at,
            run.status
        );
    }

    print!("{}", metrics.export_prometheus().await);
    Ok(())
}
