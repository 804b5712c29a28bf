//! Storage layer for the Tagmaker engine
//!
//! Provides the adapter interface the jobs read and write through, and the
//! libSQL implementation of it.

pub mod libsql;

use crate::error::Result;
use crate::types::{PackEvent, StoredTagEdges, TagEdges, TagMetricsRecord, Tier, WriteOutcome};
use async_trait::async_trait;

/// Storage adapter trait defining what the graph jobs need
///
/// Writes are compare-and-set: callers pass the version (or tier) they
/// observed and get `WriteOutcome::Conflict` back if someone else wrote in
/// between. No method requires a lock to be held across calls.
#[async_trait]
pub trait TagStore: Send + Sync {
    /// Cheap round trip used to fail fast before a job starts
    async fn ping(&self) -> Result<()>;

    /// Organizations with at least one event at or after `since_ts`
    async fn list_active_orgs(&self, since_ts: i64) -> Result<Vec<String>>;

    /// Events of one organization with `ts >= since_ts`, oldest first
    async fn events_since(&self, org_id: &str, since_ts: i64) -> Result<Vec<PackEvent>>;

    /// Current edge document for `(org_id, tag)`, if one exists
    async fn load_tag_edges(&self, org_id: &str, tag: &str) -> Result<Option<StoredTagEdges>>;

    /// Replace the edge document wholesale
    ///
    /// `expected_version = None` creates the document and conflicts if it
    /// already exists; `Some(v)` replaces it only if still at version `v`.
    async fn replace_tag_edges(
        &self,
        doc: &TagEdges,
        expected_version: Option<i64>,
    ) -> Result<WriteOutcome>;

    /// One page of the aggregated tag metrics view, ordered by tag
    async fn list_tag_metrics(&self, page: usize, page_size: usize)
        -> Result<Vec<TagMetricsRecord>>;

    /// Set the tier of `tag` on every document that references it
    ///
    /// Applies only if the tag's tier still equals `observed_tier`
    /// (`None` = never assigned).
    async fn update_tag_tier(
        &self,
        tag: &str,
        new_tier: Tier,
        observed_tier: Option<i64>,
    ) -> Result<WriteOutcome>;
}
