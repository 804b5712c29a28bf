//! Tag statistics command

use super::helpers::open_storage;

/// Handle `stats`
pub async fn handle(db_path: Option<String>) -> anyhow::Result<()> {
    let storage = open_storage(db_path).await?;
    let stats = storage.tag_statistics().await?;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
