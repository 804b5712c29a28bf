// Evolution Module - Background tag graph jobs
//
// This module implements the periodic jobs that keep the tag graph and the
// tier placement of tags current without user intervention.
//
// Components:
// - scheduler: Interval and daily job scheduling, on-demand triggers
// - edges: Co-occurrence edge learning from pack feedback
// - hotness: Pure hotness scoring and tier thresholds
// - tiering: Tier rebalancing across all tags

pub mod config;
pub mod edges;
pub mod hotness;
pub mod scheduler;
pub mod tiering;

pub use config::{ConfigError, EvolutionConfig, JobConfig, LearningConfig, Schedule, TieringConfig};
pub use edges::{EdgeLearner, EdgeLearningSummary};
pub use hotness::{compute_hotness, determine_tier};
pub use scheduler::{
    BackgroundScheduler, EvolutionJob, JobError, JobReport, JobRun, JobStatus, SchedulerError,
};
pub use tiering::{RebalanceReport, TieringRebalancer};

use crate::error::{Result, TagmakerError};
use std::future::Future;
use std::time::Duration;

/// Bound one storage round trip by `limit`
///
/// Expiry surfaces as `TagmakerError::Timeout`, which callers treat as a
/// transient failure of that unit of work.
pub(crate) async fn with_deadline<T, F>(operation: &'static str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TagmakerError::Timeout {
            operation,
            timeout: limit,
        }),
    }
}
