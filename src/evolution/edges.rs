// Edge Learning Job
//
// Learns directed tag-to-tag co-occurrence weights from pack acceptance
// feedback. For every pair of tags in an event, both directions move toward
// a clipped target by an exponential moving average:
//
//   target = clip(current ± reward, 0, w_max)
//   new    = clip((1 - eta) * current + eta * target, 0, w_max)
//
// Each tag keeps only its top-M neighbors, sorted by weight descending.

use super::config::{EvolutionConfig, JobConfig, LearningConfig};
use super::scheduler::{EvolutionJob, JobError, JobReport};
use super::with_deadline;
use crate::error::{Result, TagmakerError};
use crate::metrics::JobMetrics;
use crate::storage::TagStore;
use crate::types::{PackEvent, TagEdge, TagEdges, WriteOutcome};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Name the scheduler and the CLI know this job by
pub const JOB_NAME: &str = "edge_learning";

/// Outcome of one edge learning pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeLearningSummary {
    /// Directed edge updates written
    pub updated: usize,
    /// Edges dropped by top-M truncation
    pub pruned: usize,
    pub duration_seconds: f64,
    pub orgs_processed: usize,
    pub errors: usize,
    /// Pass stopped early; counts are partial
    pub cancelled: bool,
}

/// Edge learning job
pub struct EdgeLearner {
    store: Arc<dyn TagStore>,
    learning: LearningConfig,
    storage_timeout: Duration,
    metrics: JobMetrics,
}

impl EdgeLearner {
    pub fn new(store: Arc<dyn TagStore>, config: &EvolutionConfig, metrics: JobMetrics) -> Self {
        Self {
            store,
            learning: config.learning.clone(),
            storage_timeout: config.storage_timeout,
            metrics,
        }
    }

    /// Learn from every organization with events inside the default window
    pub async fn run_all(&self) -> Result<EdgeLearningSummary> {
        self.run(None, None).await
    }

    /// Replay the window for one organization
    pub async fn run_for_org(
        &self,
        org_id: &str,
        window_hours: Option<u32>,
    ) -> Result<EdgeLearningSummary> {
        self.run(Some(org_id), window_hours).await
    }

    /// Run one pass, optionally scoped to `org_id` and a custom window
    pub async fn run(
        &self,
        org_id: Option<&str>,
        window_hours: Option<u32>,
    ) -> Result<EdgeLearningSummary> {
        self.run_with_cancel(org_id, window_hours, &CancellationToken::new())
            .await
    }

    /// Run one pass, stopping between organizations or events once `cancel` fires
    ///
    /// Fails only if the store is unreachable at the start; everything after
    /// that is isolated per organization and per edge and shows up in
    /// `errors`.
    pub async fn run_with_cancel(
        &self,
        org_id: Option<&str>,
        window_hours: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<EdgeLearningSummary> {
        let start = Instant::now();
        let hours = window_hours.unwrap_or(self.learning.window_hours);
        let since_ts = Utc::now().timestamp() - i64::from(hours) * 3600;

        tracing::info!(
            "Starting edge learning (org: {}, window: {}h)",
            org_id.unwrap_or("all"),
            hours
        );

        with_deadline("ping", self.storage_timeout, self.store.ping()).await?;

        let orgs = match org_id {
            Some(org) => vec![org.to_string()],
            None => {
                with_deadline(
                    "list_active_orgs",
                    self.storage_timeout,
                    self.store.list_active_orgs(since_ts),
                )
                .await?
            }
        };

        let mut summary = EdgeLearningSummary::default();

        for org in &orgs {
            if cancel.is_cancelled() {
                tracing::info!("Edge learning cancelled before org {}", org);
                summary.cancelled = true;
                break;
            }

            let org_start = Instant::now();
            let before = summary.updated;

            if let Err(e) = self.learn_org(org, since_ts, cancel, &mut summary).await {
                tracing::warn!("Edge learning failed for org {}: {}", org, e);
                summary.errors += 1;
            }

            summary.orgs_processed += 1;
            self.metrics
                .record_edges_updated(org, summary.updated - before)
                .await;
            self.metrics
                .observe_edge_learning_duration(org, org_start.elapsed().as_secs_f64())
                .await;
        }

        summary.duration_seconds = start.elapsed().as_secs_f64();

        tracing::info!(
            "Edge learning complete: {} orgs, {} edges updated, {} pruned, {} errors in {:.3}s",
            summary.orgs_processed,
            summary.updated,
            summary.pruned,
            summary.errors,
            summary.duration_seconds
        );

        Ok(summary)
    }

    /// Process the event window of one organization
    async fn learn_org(
        &self,
        org_id: &str,
        since_ts: i64,
        cancel: &CancellationToken,
        summary: &mut EdgeLearningSummary,
    ) -> Result<()> {
        let events = with_deadline(
            "events_since",
            self.storage_timeout,
            self.store.events_since(org_id, since_ts),
        )
        .await?;

        tracing::debug!("Org {}: {} events in window", org_id, events.len());

        for event in &events {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            self.learn_event(event, summary).await;
        }

        Ok(())
    }

    async fn learn_event(&self, event: &PackEvent, summary: &mut EdgeLearningSummary) {
        for (a, b) in tag_pairs(&event.tags) {
            for (src, dst) in [(a, b), (b, a)] {
                match self.update_edge(&event.org_id, src, dst, event.accepted).await {
                    Ok(pruned) => {
                        summary.updated += 1;
                        summary.pruned += pruned;
                    }
                    Err(e) if e.is_transient() => {
                        tracing::warn!(
                            "Failed to update edge {} -> {} for org {}: {}",
                            src,
                            dst,
                            event.org_id,
                            e
                        );
                        summary.errors += 1;
                    }
                    Err(e) => {
                        tracing::error!(
                            "Edge {} -> {} for org {} is unwritable: {}",
                            src,
                            dst,
                            event.org_id,
                            e
                        );
                        summary.errors += 1;
                    }
                }
            }
        }
    }

    /// Apply one directed update, re-reading on write conflicts
    ///
    /// Returns the number of edges the write pruned.
    async fn update_edge(&self, org_id: &str, src: &str, dst: &str, accepted: bool) -> Result<usize> {
        let attempts = self.learning.max_write_retries.max(1);

        for attempt in 1..=attempts {
            let stored = with_deadline(
                "load_tag_edges",
                self.storage_timeout,
                self.store.load_tag_edges(org_id, src),
            )
            .await?;

            let (mut doc, expected_version) = match stored {
                Some(stored) => (stored.doc, Some(stored.version)),
                None => (TagEdges::empty(org_id, src), None),
            };

            let current = doc.weight_to(dst).unwrap_or(0.0);
            let weight = ema_update(current, accepted, &self.learning);
            let pruned = apply_edge_weight(
                &mut doc.edges,
                dst,
                weight,
                Utc::now().timestamp(),
                self.learning.max_edges_per_tag,
            );

            let outcome = with_deadline(
                "replace_tag_edges",
                self.storage_timeout,
                self.store.replace_tag_edges(&doc, expected_version),
            )
            .await?;

            match outcome {
                WriteOutcome::Applied => {
                    tracing::trace!(
                        "Edge {} -> {} in {}: {:.4} -> {:.4}",
                        src,
                        dst,
                        org_id,
                        current,
                        weight
                    );
                    return Ok(pruned);
                }
                WriteOutcome::Conflict => {
                    tracing::debug!(
                        "Conflict on {}/{} (attempt {}/{}), re-reading",
                        org_id,
                        src,
                        attempt,
                        attempts
                    );
                }
            }
        }

        Err(TagmakerError::Conflict(format!(
            "{}/{} after {} attempts",
            org_id, src, attempts
        )))
    }
}

/// One EMA step toward the clipped reward target
pub fn ema_update(current: f64, accepted: bool, params: &LearningConfig) -> f64 {
    let current = if current.is_finite() { current } else { 0.0 };
    let reward = if accepted {
        params.reward
    } else {
        -params.penalty
    };

    let target = (current + reward).clamp(0.0, params.w_max);
    ((1.0 - params.eta) * current + params.eta * target).clamp(0.0, params.w_max)
}

/// Unordered pairs of distinct tags, in first-occurrence order
///
/// Duplicate tags are collapsed first; fewer than two distinct tags yields
/// no pairs.
pub fn tag_pairs(tags: &[String]) -> Vec<(&str, &str)> {
    let mut seen = HashSet::new();
    let distinct: Vec<&str> = tags
        .iter()
        .map(String::as_str)
        .filter(|tag| seen.insert(*tag))
        .collect();

    let mut pairs = Vec::new();
    for i in 0..distinct.len() {
        for j in (i + 1)..distinct.len() {
            pairs.push((distinct[i], distinct[j]));
        }
    }
    pairs
}

/// Set the weight toward `to`, re-sort and truncate to `max_edges`
///
/// Returns how many edges were dropped. Ties are ordered by target tag so
/// snapshots are deterministic.
pub fn apply_edge_weight(
    edges: &mut Vec<TagEdge>,
    to: &str,
    weight: f64,
    now_ts: i64,
    max_edges: usize,
) -> usize {
    match edges.iter_mut().find(|e| e.to == to) {
        Some(edge) => {
            edge.weight = weight;
            edge.updated_at = now_ts;
        }
        None => edges.push(TagEdge::new(to, weight, now_ts)),
    }

    edges.sort_by(|a, b| b.weight.total_cmp(&a.weight).then_with(|| a.to.cmp(&b.to)));

    let pruned = edges.len().saturating_sub(max_edges);
    edges.truncate(max_edges);
    pruned
}

#[async_trait]
impl EvolutionJob for EdgeLearner {
    fn name(&self) -> &str {
        JOB_NAME
    }

    async fn run(
        &self,
        _config: &JobConfig,
        cancel: CancellationToken,
    ) -> std::result::Result<JobReport, JobError> {
        let summary = self.run_with_cancel(None, None, &cancel).await?;

        Ok(JobReport {
            items_processed: summary.orgs_processed,
            changes_made: summary.updated,
            duration: Duration::from_secs_f64(summary.duration_seconds),
            errors: summary.errors,
            error_message: summary.cancelled.then(|| "cancelled".to_string()),
        })
    }

    async fn should_run(&self) -> std::result::Result<bool, JobError> {
        with_deadline("ping", self.storage_timeout, self.store.ping()).await?;
        Ok(true)
    }
}
