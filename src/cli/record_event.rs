//! Pack event ingestion command

use super::helpers::open_storage;
use anyhow::Context;
use tagmaker_core::PackEvent;
use tracing::info;

/// Arguments of `record-event`
pub struct RecordEventArgs {
    pub org: String,
    pub project: String,
    pub tags: Vec<String>,
    pub rejected: bool,
    pub items: Vec<String>,
    pub ts: Option<i64>,
}

/// Handle `record-event`
pub async fn handle(args: RecordEventArgs, db_path: Option<String>) -> anyhow::Result<()> {
    let tags: Vec<String> = args
        .tags
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    if tags.is_empty() {
        anyhow::bail!("at least one tag is required");
    }

    let mut event = PackEvent::new(args.org, args.project, !args.rejected, tags);
    event.item_ids = args.items;
    if let Some(ts) = args.ts {
        event.ts = ts;
    }

    let storage = open_storage(db_path).await?;
    storage
        .record_pack_event(&event)
        .await
        .context("Failed to record pack event")?;

    info!(
        "Recorded pack {} for org {} ({} tags)",
        event.pack_id,
        event.org_id,
        event.tags.len()
    );
    println!("{}", event.pack_id);
    Ok(())
}
