//! Tagmaker - Tag Graph Maintenance Engine
//!
//! Background jobs that keep a per-organization tag graph useful:
//! - Co-occurrence edge learning from pack acceptance feedback
//! - Hotness scoring of tags from usage, recency and promotions
//! - Hot/warm/cold tier rebalancing across every tagged memory
//!
//! # Architecture
//!
//! The crate is organized into a few layers:
//! - **Types**: Documents the jobs read and write (PackEvent, TagEdges, etc.)
//! - **Storage**: The `TagStore` adapter and its libSQL implementation
//! - **Evolution**: The jobs, their configuration and the scheduler
//! - **Metrics**: Job counters exported in Prometheus text format
//!
//! # Example
//!
//! ```ignore
//! use tagmaker_core::{EdgeLearner, EvolutionConfig, JobMetrics, LibsqlStorage};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let storage = Arc::new(LibsqlStorage::from_path("tagmaker.db", true).await?);
//!     let config = EvolutionConfig::default().with_env_overrides()?;
//!
//!     let learner = EdgeLearner::new(storage, &config, JobMetrics::new());
//!     let summary = learner.run_for_org("acme", Some(48)).await?;
//!     println!("{} edges updated", summary.updated);
//!
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod evolution;
pub mod metrics;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use error::{Result, TagmakerError};
pub use evolution::{
    BackgroundScheduler, EdgeLearner, EdgeLearningSummary, EvolutionConfig, RebalanceReport,
    TieringRebalancer,
};
pub use metrics::JobMetrics;
pub use storage::{
    libsql::{ConnectionMode, LibsqlStorage},
    TagStore,
};
pub use types::{
    PackEvent, StoredTagEdges, TagEdge, TagEdges, TagMetrics, TagMetricsRecord, TagStatistics,
    TaggedMemory, Tier, WriteOutcome,
};
