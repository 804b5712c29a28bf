//! Job metrics
//!
//! Counters and histograms for the graph jobs, exported in Prometheus text
//! format. Recording never fails; a missing exporter is not an error.
//!
//! # Example
//!
//! ```no_run
//! # use tagmaker_core::metrics::JobMetrics;
//! # async fn example() {
//! let metrics = JobMetrics::new();
//! metrics.record_edges_updated("acme", 12).await;
//! metrics.observe_edge_learning_duration("acme", 0.42).await;
//!
//! let text = metrics.export_prometheus().await;
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Upper bounds (seconds) of the edge learning duration histogram
const DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0];

/// Cumulative histogram for one label set
#[derive(Debug, Clone, Default)]
struct Histogram {
    /// Per-bucket counts, aligned with `DURATION_BUCKETS`
    buckets: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn observe(&mut self, value: f64) {
        if self.buckets.is_empty() {
            self.buckets = vec![0; DURATION_BUCKETS.len()];
        }
        for (bound, slot) in DURATION_BUCKETS.iter().zip(self.buckets.iter_mut()) {
            if value <= *bound {
                *slot += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    edges_updated: BTreeMap<String, u64>,
    edge_learning_duration: BTreeMap<String, Histogram>,
    tags_rebalanced: u64,
}

/// Shared metrics sink for the graph jobs
#[derive(Debug, Clone, Default)]
pub struct JobMetrics {
    state: Arc<RwLock<MetricsState>>,
}

impl JobMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `count` to `mme_edges_updated_total{org}`
    pub async fn record_edges_updated(&self, org_id: &str, count: usize) {
        let mut state = self.state.write().await;
        *state.edges_updated.entry(org_id.to_string()).or_insert(0) += count as u64;
    }

    /// Observe one per-organization edge learning duration
    pub async fn observe_edge_learning_duration(&self, org_id: &str, seconds: f64) {
        let mut state = self.state.write().await;
        state
            .edge_learning_duration
            .entry(org_id.to_string())
            .or_default()
            .observe(seconds);
    }

    /// Add `count` to `mme_tag_rebalanced_total`
    pub async fn record_tags_rebalanced(&self, count: usize) {
        let mut state = self.state.write().await;
        state.tags_rebalanced += count as u64;
    }

    /// Current value of the edge counter for one organization
    pub async fn edges_updated(&self, org_id: &str) -> u64 {
        self.state
            .read()
            .await
            .edges_updated
            .get(org_id)
            .copied()
            .unwrap_or(0)
    }

    /// Current value of the rebalance counter
    pub async fn tags_rebalanced(&self) -> u64 {
        self.state.read().await.tags_rebalanced
    }

    /// Export metrics in Prometheus text format
    pub async fn export_prometheus(&self) -> String {
        let state = self.state.read().await;
        let mut output = String::new();

        output.push_str("# HELP mme_edges_updated_total Directed tag edges written by edge learning\n");
        output.push_str("# TYPE mme_edges_updated_total counter\n");
        for (org, value) in &state.edges_updated {
            output.push_str(&format!(
                "mme_edges_updated_total{{org=\"{}\"}} {}\n",
                escape_label(org),
                value
            ));
        }

        output.push_str("# HELP mme_tag_rebalanced_total Tags whose tier changed\n");
        output.push_str("# TYPE mme_tag_rebalanced_total counter\n");
        output.push_str(&format!("mme_tag_rebalanced_total {}\n", state.tags_rebalanced));

        output.push_str(
            "# HELP mme_edge_learning_duration_seconds Edge learning time per organization\n",
        );
        output.push_str("# TYPE mme_edge_learning_duration_seconds histogram\n");
        for (org, hist) in &state.edge_learning_duration {
            let org = escape_label(org);
            for (bound, count) in DURATION_BUCKETS.iter().zip(&hist.buckets) {
                output.push_str(&format!(
                    "mme_edge_learning_duration_seconds_bucket{{org=\"{}\",le=\"{}\"}} {}\n",
                    org, bound, count
                ));
            }
            output.push_str(&format!(
                "mme_edge_learning_duration_seconds_bucket{{org=\"{}\",le=\"+Inf\"}} {}\n",
                org, hist.count
            ));
            output.push_str(&format!(
                "mme_edge_learning_duration_seconds_sum{{org=\"{}\"}} {}\n",
                org, hist.sum
            ));
            output.push_str(&format!(
                "mme_edge_learning_duration_seconds_count{{org=\"{}\"}} {}\n",
                org, hist.count
            ));
        }

        debug!("Exported metrics ({} bytes)", output.len());
        output
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
