//! Tier rebalance command

use super::helpers::{load_config, open_storage};
use std::path::Path;
use tagmaker_core::{JobMetrics, TieringRebalancer};

/// Handle `rebalance`
pub async fn handle(db_path: Option<String>, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let storage = open_storage(db_path).await?;
    let rebalancer = TieringRebalancer::new(storage, &config, JobMetrics::new());

    eprintln!("Rebalancing tag tiers...");
    let report = rebalancer.rebalance_all().await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
