//! Edge learning command (scheduled pass or single-org replay)

use super::helpers::{load_config, open_storage};
use std::path::Path;
use tagmaker_core::{EdgeLearner, JobMetrics};

/// Handle `learn`
pub async fn handle(
    org: Option<String>,
    hours: Option<u32>,
    db_path: Option<String>,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let storage = open_storage(db_path).await?;
    let learner = EdgeLearner::new(storage, &config, JobMetrics::new());

    let summary = match org.as_deref() {
        Some(org) => {
            eprintln!("Replaying edge learning for org {}...", org);
            learner.run_for_org(org, hours).await?
        }
        None => {
            eprintln!("Running edge learning for all active orgs...");
            learner.run(None, hours).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
