//! Shared helper functions for CLI commands
//!
//! Database path resolution, configuration loading and storage startup.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tagmaker_core::{evolution::EvolutionConfig, LibsqlStorage};
use tracing::debug;

/// Get the default database path using XDG_DATA_HOME standard
pub fn get_default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tagmaker")
        .join("tagmaker.db")
}

/// Get the database path from CLI arg, env var, or default
pub fn get_db_path(cli_path: Option<String>) -> String {
    cli_path
        .or_else(|| std::env::var("TAGMAKER_DB_PATH").ok())
        .filter(|path| !path.is_empty())
        .unwrap_or_else(|| get_default_db_path().to_string_lossy().to_string())
}

/// Load job configuration from `path` (or defaults) and apply `MME_*` overrides
pub fn load_config(path: Option<&Path>) -> anyhow::Result<EvolutionConfig> {
    let config = match path {
        Some(path) => EvolutionConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EvolutionConfig::default(),
    };

    config
        .with_env_overrides()
        .context("Invalid MME_* environment override")
}

/// Open (creating if needed) the database and run migrations
pub async fn open_storage(db_path: Option<String>) -> anyhow::Result<Arc<LibsqlStorage>> {
    let db_path = get_db_path(db_path);
    debug!("Using database: {}", db_path);

    let storage = LibsqlStorage::from_path(&db_path, true)
        .await
        .with_context(|| format!("Failed to initialize storage at {}", db_path))?;

    Ok(Arc::new(storage))
}
