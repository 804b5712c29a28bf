//! Common test utilities and helpers

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tagmaker_core::{
    evolution::{EvolutionConfig, LearningConfig},
    ConnectionMode, LibsqlStorage, PackEvent, Result, StoredTagEdges, TagEdge, TagEdges,
    TagMetricsRecord, TagStore, TagmakerError, TaggedMemory, Tier, WriteOutcome,
};
use tempfile::TempDir;

/// Create a LibSQL storage backed by a temp file
///
/// libSQL's `:memory:` mode gives every connection its own database, so
/// migrations would not be visible to later connections. Keep the returned
/// `TempDir` alive for the duration of the test.
pub async fn create_test_storage() -> (Arc<LibsqlStorage>, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("tagmaker_test.db");

    let storage = LibsqlStorage::new_with_validation(
        ConnectionMode::Local(path.to_string_lossy().to_string()),
        true, // create_if_missing - required for test databases
    )
    .await
    .expect("Failed to create test storage");

    (Arc::new(storage), dir)
}

/// Parameters of the documented worked example
pub fn worked_example_config() -> EvolutionConfig {
    EvolutionConfig {
        learning: LearningConfig {
            eta: 0.1,
            reward: 0.05,
            penalty: 0.02,
            w_max: 1.0,
            ..LearningConfig::default()
        },
        ..EvolutionConfig::default()
    }
}

pub fn tags(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

pub fn event(org: &str, accepted: bool, names: &[&str]) -> PackEvent {
    PackEvent::new(org, "web", accepted, tags(names))
}

/// Insert an event over a separate connection, the way another producer would
pub async fn insert_raw_event(dir: &TempDir, org: &str, names: &[&str], ts: i64) {
    let db = libsql::Builder::new_local(dir.path().join("tagmaker_test.db"))
        .build()
        .await
        .expect("Failed to open raw connection");
    let conn = db.connect().expect("Failed to connect");

    conn.execute(
        "INSERT INTO pack_events (org_id, project_id, pack_id, accepted, tags, item_ids, ts)
         VALUES (?, 'web', 'external-pack', 1, ?, '[]', ?)",
        libsql::params![org, serde_json::to_string(&tags(names)).unwrap(), ts],
    )
    .await
    .expect("Failed to insert raw event");
}

/// Seed an edge document directly
pub async fn seed_edges(storage: &LibsqlStorage, org: &str, tag: &str, edges: &[(&str, f64)]) {
    let mut doc = TagEdges::empty(org, tag);
    doc.edges = edges
        .iter()
        .map(|(to, w)| TagEdge::new(*to, *w, 0))
        .collect();

    let outcome = storage
        .replace_tag_edges(&doc, None)
        .await
        .expect("Failed to seed edges");
    assert_eq!(outcome, WriteOutcome::Applied);
}

/// Store `count` memories carrying `tag`, all created `age` ago
pub async fn seed_memories(
    storage: &LibsqlStorage,
    tag: &str,
    count: usize,
    age: chrono::Duration,
) -> Vec<TaggedMemory> {
    let mut memories = Vec::new();
    for _ in 0..count {
        let mut memory = TaggedMemory::new("acme", "web", tags(&[tag]));
        memory.created_at = chrono::Utc::now() - age;
        storage
            .store_tagged_memory(&memory)
            .await
            .expect("Failed to store memory");
        memories.push(memory);
    }
    memories
}

/// Store wrapper that injects failures and concurrent writers
pub struct FaultyStore {
    inner: Arc<LibsqlStorage>,
    ping_fails: bool,
    failing_org: Option<String>,
    always_conflict: bool,
    interleave_edge_write: AtomicBool,
    interleave_tier: Option<(String, Tier)>,
    interleave_tier_pending: AtomicBool,
    injected_record: Option<TagMetricsRecord>,
    failing_tier_tag: Option<String>,
    slow_edge_tag: Option<(String, Duration)>,
    slow_tier: Option<Duration>,
}

impl FaultyStore {
    pub fn new(inner: Arc<LibsqlStorage>) -> Self {
        Self {
            inner,
            ping_fails: false,
            failing_org: None,
            always_conflict: false,
            interleave_edge_write: AtomicBool::new(false),
            interleave_tier: None,
            interleave_tier_pending: AtomicBool::new(false),
            injected_record: None,
            failing_tier_tag: None,
            slow_edge_tag: None,
            slow_tier: None,
        }
    }

    /// Store looks unreachable
    pub fn unreachable(mut self) -> Self {
        self.ping_fails = true;
        self
    }

    /// Reading events of `org` fails
    pub fn failing_org(mut self, org: &str) -> Self {
        self.failing_org = Some(org.to_string());
        self
    }

    /// Every edge write loses the race
    pub fn always_conflict(mut self) -> Self {
        self.always_conflict = true;
        self
    }

    /// Another writer adds an edge to "other" right before the first edge write
    pub fn interleave_edge_write(self) -> Self {
        self.interleave_edge_write.store(true, Ordering::SeqCst);
        self
    }

    /// Another sweep moves `tag` to `tier` right before our tier write
    pub fn interleave_tier(mut self, tag: &str, tier: Tier) -> Self {
        self.interleave_tier = Some((tag.to_string(), tier));
        self.interleave_tier_pending.store(true, Ordering::SeqCst);
        self
    }

    /// Tier writes for `tag` fail
    pub fn failing_tier(mut self, tag: &str) -> Self {
        self.failing_tier_tag = Some(tag.to_string());
        self
    }

    /// Loading the edge document of `tag` stalls for `delay`
    pub fn slow_edges(mut self, tag: &str, delay: Duration) -> Self {
        self.slow_edge_tag = Some((tag.to_string(), delay));
        self
    }

    /// Every tier write stalls for `delay` before reaching the database
    pub fn slow_tier(mut self, delay: Duration) -> Self {
        self.slow_tier = Some(delay);
        self
    }

    /// Extra raw record served on the first metrics page
    pub fn inject_record(mut self, record: TagMetricsRecord) -> Self {
        self.injected_record = Some(record);
        self
    }
}

#[async_trait]
impl TagStore for FaultyStore {
    async fn ping(&self) -> Result<()> {
        if self.ping_fails {
            return Err(TagmakerError::Database("connection refused".to_string()));
        }
        self.inner.ping().await
    }

    async fn list_active_orgs(&self, since_ts: i64) -> Result<Vec<String>> {
        self.inner.list_active_orgs(since_ts).await
    }

    async fn events_since(&self, org_id: &str, since_ts: i64) -> Result<Vec<PackEvent>> {
        if self.failing_org.as_deref() == Some(org_id) {
            return Err(TagmakerError::Database(format!("cursor lost for {}", org_id)));
        }
        self.inner.events_since(org_id, since_ts).await
    }

    async fn load_tag_edges(&self, org_id: &str, tag: &str) -> Result<Option<StoredTagEdges>> {
        if let Some((slow, delay)) = &self.slow_edge_tag {
            if slow == tag {
                tokio::time::sleep(*delay).await;
            }
        }
        self.inner.load_tag_edges(org_id, tag).await
    }

    async fn replace_tag_edges(
        &self,
        doc: &TagEdges,
        expected_version: Option<i64>,
    ) -> Result<WriteOutcome> {
        if self.always_conflict {
            return Ok(WriteOutcome::Conflict);
        }

        if self.interleave_edge_write.swap(false, Ordering::SeqCst) {
            let (mut theirs, version) = match self.inner.load_tag_edges(&doc.org_id, &doc.tag).await? {
                Some(stored) => (stored.doc, Some(stored.version)),
                None => (TagEdges::empty(&doc.org_id, &doc.tag), None),
            };
            theirs.edges.push(TagEdge::new("other", 0.3, 0));
            self.inner.replace_tag_edges(&theirs, version).await?;
        }

        self.inner.replace_tag_edges(doc, expected_version).await
    }

    async fn list_tag_metrics(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<TagMetricsRecord>> {
        let mut records = self.inner.list_tag_metrics(page, page_size).await?;
        if page == 0 {
            if let Some(record) = &self.injected_record {
                records.push(record.clone());
            }
        }
        Ok(records)
    }

    async fn update_tag_tier(
        &self,
        tag: &str,
        new_tier: Tier,
        observed_tier: Option<i64>,
    ) -> Result<WriteOutcome> {
        if let Some(delay) = self.slow_tier {
            tokio::time::sleep(delay).await;
        }
        if self.failing_tier_tag.as_deref() == Some(tag) {
            return Err(TagmakerError::Database(format!("write to {} rejected", tag)));
        }
        if let Some((target, theirs)) = &self.interleave_tier {
            if target == tag && self.interleave_tier_pending.swap(false, Ordering::SeqCst) {
                self.inner
                    .update_tag_tier(tag, *theirs, observed_tier)
                    .await?;
            }
        }
        self.inner.update_tag_tier(tag, new_tier, observed_tier).await
    }
}
