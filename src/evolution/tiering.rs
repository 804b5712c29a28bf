// Tier Rebalancing Job
//
// Sweeps every tag in the metrics view page by page, scores it, and moves it
// to the tier its hotness calls for. A tier change is written to the tag and
// fanned out to every memory carrying it.

use super::config::{EvolutionConfig, JobConfig};
use super::hotness::{compute_hotness, determine_tier};
use super::scheduler::{EvolutionJob, JobError, JobReport};
use super::with_deadline;
use crate::error::{Result, TagmakerError};
use crate::metrics::JobMetrics;
use crate::storage::TagStore;
use crate::types::{parse_timestamp, TagMetrics, TagMetricsRecord, Tier, WriteOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Name the scheduler and the CLI know this job by
pub const JOB_NAME: &str = "tier_rebalance";

/// Tier assumed for a tag that has never been assigned one
const DEFAULT_TIER: i64 = 2;

/// Outcome of one rebalancing sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceReport {
    /// Tag records looked at
    pub processed: usize,
    /// Tags whose tier changed
    pub rebalanced: usize,
    /// Records skipped as malformed
    pub skipped: usize,
    /// Tier writes lost to a concurrent sweep
    pub conflicts: usize,
    pub errors: usize,
    pub duration_seconds: f64,
    pub cancelled: bool,
}

/// What happened to one tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagOutcome {
    Unchanged,
    Moved(Tier),
    Conflict,
}

/// Tier rebalancing job
pub struct TieringRebalancer {
    store: Arc<dyn TagStore>,
    page_size: usize,
    storage_timeout: Duration,
    metrics: JobMetrics,
}

impl TieringRebalancer {
    pub fn new(store: Arc<dyn TagStore>, config: &EvolutionConfig, metrics: JobMetrics) -> Self {
        Self {
            store,
            page_size: config.tiering.page_size.max(1),
            storage_timeout: config.storage_timeout,
            metrics,
        }
    }

    /// Rebalance every tag
    pub async fn rebalance_all(&self) -> Result<RebalanceReport> {
        self.rebalance_with_cancel(&CancellationToken::new()).await
    }

    /// Rebalance every tag, stopping between records once `cancel` fires
    ///
    /// Fails only if the store is unreachable at the start.
    pub async fn rebalance_with_cancel(&self, cancel: &CancellationToken) -> Result<RebalanceReport> {
        let start = Instant::now();
        let now = Utc::now();

        tracing::info!("Starting tier rebalance (page_size: {})", self.page_size);

        with_deadline("ping", self.storage_timeout, self.store.ping()).await?;

        let mut report = RebalanceReport::default();
        let mut page = 0;

        'pages: loop {
            let records = match with_deadline(
                "list_tag_metrics",
                self.storage_timeout,
                self.store.list_tag_metrics(page, self.page_size),
            )
            .await
            {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!("Failed to fetch tag metrics page {}: {}", page, e);
                    report.errors += 1;
                    break;
                }
            };

            if records.is_empty() {
                break;
            }

            tracing::debug!("Rebalancing page {} ({} tags)", page, records.len());

            for record in &records {
                if cancel.is_cancelled() {
                    tracing::info!("Tier rebalance cancelled at tag '{}'", record.tag);
                    report.cancelled = true;
                    break 'pages;
                }

                report.processed += 1;

                let metrics = match metrics_from_record(record) {
                    Ok(metrics) => metrics,
                    Err(e) => {
                        tracing::warn!("Skipping tag '{}': {}", record.tag, e);
                        report.skipped += 1;
                        continue;
                    }
                };

                match self.rebalance_tag(&metrics, record.tier, now).await {
                    Ok(TagOutcome::Unchanged) => {}
                    Ok(TagOutcome::Moved(tier)) => {
                        report.rebalanced += 1;
                        tracing::debug!("Moved tag '{}' to tier {}", record.tag, tier);
                    }
                    Ok(TagOutcome::Conflict) => {
                        tracing::warn!(
                            "Tier of '{}' changed during the sweep, leaving it",
                            record.tag
                        );
                        report.conflicts += 1;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to rebalance tag '{}': {}", record.tag, e);
                        report.errors += 1;
                    }
                }
            }

            page += 1;
        }

        self.metrics.record_tags_rebalanced(report.rebalanced).await;
        report.duration_seconds = start.elapsed().as_secs_f64();

        tracing::info!(
            "Tier rebalance complete: {} processed, {} rebalanced, {} skipped, {} conflicts, {} errors in {:.3}s",
            report.processed,
            report.rebalanced,
            report.skipped,
            report.conflicts,
            report.errors,
            report.duration_seconds
        );

        Ok(report)
    }

    async fn rebalance_tag(
        &self,
        metrics: &TagMetrics,
        observed_tier: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<TagOutcome> {
        let hotness = compute_hotness(metrics, now);
        let new_tier = determine_tier(hotness);
        let current = observed_tier.unwrap_or(DEFAULT_TIER);

        tracing::trace!(
            "Tag '{}': hotness {:.3}, tier {} -> {}",
            metrics.tag,
            hotness,
            current,
            new_tier.as_i64()
        );

        if new_tier.as_i64() == current {
            return Ok(TagOutcome::Unchanged);
        }

        let outcome = with_deadline(
            "update_tag_tier",
            self.storage_timeout,
            self.store.update_tag_tier(&metrics.tag, new_tier, observed_tier),
        )
        .await?;

        Ok(match outcome {
            WriteOutcome::Applied => TagOutcome::Moved(new_tier),
            WriteOutcome::Conflict => TagOutcome::Conflict,
        })
    }
}

/// Validate a raw metrics row
///
/// Missing or unparseable `created_at`/`last_used_at` is an error; a missing
/// `use_count` counts as one use.
pub fn metrics_from_record(record: &TagMetricsRecord) -> Result<TagMetrics> {
    let created_at = required_timestamp(record, "createdAt", record.created_at.as_deref())?;
    let last_used_at = required_timestamp(record, "lastUsedAt", record.last_used_at.as_deref())?;

    Ok(TagMetrics {
        tag: record.tag.clone(),
        use_count: record.use_count.unwrap_or(1),
        created_at,
        last_used_at,
        last_promoted_at: record.last_promoted_at.as_deref().and_then(parse_timestamp),
    })
}

fn required_timestamp(
    record: &TagMetricsRecord,
    field: &str,
    raw: Option<&str>,
) -> Result<DateTime<Utc>> {
    let raw = raw.ok_or_else(|| {
        TagmakerError::Validation(format!("tag '{}' is missing {}", record.tag, field))
    })?;

    parse_timestamp(raw).ok_or_else(|| {
        TagmakerError::Validation(format!(
            "tag '{}' has unparseable {}: {:?}",
            record.tag, field, raw
        ))
    })
}

#[async_trait]
impl EvolutionJob for TieringRebalancer {
    fn name(&self) -> &str {
        JOB_NAME
    }

    async fn run(
        &self,
        _config: &JobConfig,
        cancel: CancellationToken,
    ) -> std::result::Result<JobReport, JobError> {
        let report = self.rebalance_with_cancel(&cancel).await?;

        Ok(JobReport {
            items_processed: report.processed,
            changes_made: report.rebalanced,
            duration: Duration::from_secs_f64(report.duration_seconds),
            errors: report.errors,
            error_message: report.cancelled.then(|| "cancelled".to_string()),
        })
    }

    async fn should_run(&self) -> std::result::Result<bool, JobError> {
        with_deadline("ping", self.storage_timeout, self.store.ping()).await?;
        Ok(true)
    }
}
