//! Core data types for the Tagmaker engine
//!
//! This module defines the documents the engine reads and writes: pack
//! feedback events, per-tag edge documents, the aggregated tag metrics view,
//! and the tagged memory documents that carry a tier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Acceptance or rejection feedback for one assembled pack
///
/// Immutable once written. Produced by the pack acceptance workflow and
/// consumed read-only by the edge learner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackEvent {
    pub org_id: String,
    pub project_id: String,
    pub pack_id: String,
    pub accepted: bool,
    pub tags: Vec<String>,
    #[serde(default)]
    pub item_ids: Vec<String>,
    /// Unix seconds
    pub ts: i64,
}

impl PackEvent {
    /// Create an event stamped with the current time
    pub fn new(
        org_id: impl Into<String>,
        project_id: impl Into<String>,
        accepted: bool,
        tags: Vec<String>,
    ) -> Self {
        Self {
            org_id: org_id.into(),
            project_id: project_id.into(),
            pack_id: Uuid::new_v4().to_string(),
            accepted,
            tags,
            item_ids: Vec::new(),
            ts: Utc::now().timestamp(),
        }
    }
}

/// One weighted, directed neighbor of a tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagEdge {
    pub to: String,
    #[serde(rename = "w")]
    pub weight: f64,
    #[serde(rename = "facetSrc", default)]
    pub facet_src: String,
    #[serde(rename = "facetDst", default)]
    pub facet_dst: String,
    /// Unix seconds of the last write that touched this edge
    #[serde(rename = "ts")]
    pub updated_at: i64,
}

impl TagEdge {
    pub fn new(to: impl Into<String>, weight: f64, updated_at: i64) -> Self {
        Self {
            to: to.into(),
            weight,
            facet_src: String::new(),
            facet_dst: String::new(),
            updated_at,
        }
    }
}

/// Complete snapshot of one tag's top neighbors within an organization
///
/// Invariant after every write: `edges` sorted by weight descending and no
/// longer than the configured per-tag maximum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagEdges {
    pub org_id: String,
    pub tag: String,
    pub edges: Vec<TagEdge>,
}

impl TagEdges {
    pub fn empty(org_id: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            tag: tag.into(),
            edges: Vec::new(),
        }
    }

    /// Current weight toward `to`, if the edge exists
    pub fn weight_to(&self, to: &str) -> Option<f64> {
        self.edges.iter().find(|e| e.to == to).map(|e| e.weight)
    }
}

/// An edge document together with the version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTagEdges {
    pub doc: TagEdges,
    pub version: i64,
}

/// Result of a compare-and-set write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Write applied
    Applied,
    /// Another writer got there first
    Conflict,
}

/// Hot/warm/cold placement of a tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Hot,
    #[default]
    Warm,
    Cold,
}

impl Tier {
    /// Numeric tier as persisted (1 = hot, 2 = warm, 3 = cold)
    pub fn as_i64(self) -> i64 {
        match self {
            Tier::Hot => 1,
            Tier::Warm => 2,
            Tier::Cold => 3,
        }
    }
}

impl TryFrom<i64> for Tier {
    type Error = i64;

    fn try_from(value: i64) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Tier::Hot),
            2 => Ok(Tier::Warm),
            3 => Ok(Tier::Cold),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        };
        write!(f, "{} ({})", self.as_i64(), name)
    }
}

/// Raw row of the aggregated tag metrics view
///
/// Fields are left unparsed; the rebalancer validates them per record so a
/// single malformed tag never fails a page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagMetricsRecord {
    pub tag: String,
    pub use_count: Option<i64>,
    pub created_at: Option<String>,
    pub last_used_at: Option<String>,
    pub last_promoted_at: Option<String>,
    /// Authoritative tier of the tag, `None` if never assigned
    pub tier: Option<i64>,
}

/// Validated metrics for one tag, ready for scoring
#[derive(Debug, Clone, PartialEq)]
pub struct TagMetrics {
    pub tag: String,
    pub use_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub last_promoted_at: Option<DateTime<Utc>>,
}

/// A memory document carrying tags; the unit the tier fan-out writes to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaggedMemory {
    pub id: String,
    pub org_id: String,
    pub project_id: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub promoted_at: Option<DateTime<Utc>>,
}

impl TaggedMemory {
    pub fn new(org_id: impl Into<String>, project_id: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.into(),
            project_id: project_id.into(),
            tags,
            created_at: Utc::now(),
            promoted_at: None,
        }
    }
}

/// Corpus-wide counts for monitoring
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagStatistics {
    pub total_tags: usize,
    pub total_memories: usize,
    pub recent_memories_24h: usize,
    pub total_edge_documents: usize,
}

/// Parse a stored timestamp, tolerating the formats seen in practice
///
/// Accepts RFC 3339 (with `Z` or an offset) and SQLite's
/// `YYYY-MM-DD HH:MM:SS[.fff]`. Anything else yields `None`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_pack_event_wire_names() {
        let json = r#"{
            "orgId": "acme",
            "projectId": "web",
            "packId": "p-1",
            "accepted": true,
            "tags": ["python", "fastapi"],
            "itemIds": ["m-1"],
            "ts": 1700000000
        }"#;

        let event: PackEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.org_id, "acme");
        assert_eq!(event.tags, vec!["python", "fastapi"]);
        assert_eq!(event.ts, 1_700_000_000);
    }

    #[test]
    fn test_tag_edge_wire_names() {
        let edge = TagEdge::new("fastapi", 0.5, 42);
        let value = serde_json::to_value(&edge).unwrap();

        assert_eq!(value["to"], "fastapi");
        assert_eq!(value["w"], 0.5);
        assert_eq!(value["facetSrc"], "");
        assert_eq!(value["ts"], 42);
    }

    #[test]
    fn test_tier_numeric_mapping() {
        assert_eq!(Tier::Hot.as_i64(), 1);
        assert_eq!(Tier::try_from(3), Ok(Tier::Cold));
        assert_eq!(Tier::try_from(7), Err(7));
        assert_eq!(Tier::default(), Tier::Warm);
    }

    #[test]
    fn test_weight_to() {
        let mut doc = TagEdges::empty("acme", "python");
        doc.edges.push(TagEdge::new("fastapi", 0.7, 0));

        assert_eq!(doc.weight_to("fastapi"), Some(0.7));
        assert_eq!(doc.weight_to("django"), None);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();

        assert_eq!(parse_timestamp("2024-03-01T12:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T12:30:00+00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01 12:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T12:30:00"), Some(expected));
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(parse_timestamp("2024-13-45"), None);
    }
}
