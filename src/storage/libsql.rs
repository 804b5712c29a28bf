//! LibSQL storage backend implementation
//!
//! Persists pack events, tag edge documents and tagged memories in a local
//! libSQL file or a remote libSQL server, and serves the aggregated tag
//! metrics view the tiering job paginates over.

use crate::error::{Result, TagmakerError};
use crate::storage::TagStore;
use crate::types::{
    PackEvent, StoredTagEdges, TagEdge, TagEdges, TagMetricsRecord, TagStatistics, TaggedMemory,
    Tier, WriteOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use libsql::{params, Builder, Connection, Database};
use tracing::{debug, info, warn};

/// Busy timeout applied to local connections so concurrent writers queue
/// instead of failing immediately
const BUSY_TIMEOUT_MS: u64 = 5000;

/// Schema migrations, applied in order and tracked in `_migrations_applied`
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "001_initial_schema.sql",
        include_str!("../../migrations/libsql/001_initial_schema.sql"),
    ),
    (
        "002_add_indexes.sql",
        include_str!("../../migrations/libsql/002_add_indexes.sql"),
    ),
    (
        "003_active_orgs_trigger.sql",
        include_str!("../../migrations/libsql/003_active_orgs_trigger.sql"),
    ),
];

/// Parse SQL file into individual statements, handling multi-line constructs like triggers
fn parse_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut depth: i32 = 0; // Track BEGIN/END nesting depth

    for line in sql.lines() {
        let trimmed = line.trim();

        if current.is_empty() && (trimmed.is_empty() || trimmed.starts_with("--")) {
            continue;
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);

        let upper = trimmed.to_uppercase();
        if upper.starts_with("BEGIN") || upper.contains(" BEGIN") {
            depth += 1;
        }
        if upper.starts_with("END") {
            depth = depth.saturating_sub(1);
        }

        if trimmed.ends_with(';') && depth == 0 {
            statements.push(current.clone());
            current.clear();
        }
    }

    if !current.trim().is_empty() {
        statements.push(current);
    }

    statements
}

/// Database connection mode
#[derive(Debug, Clone)]
pub enum ConnectionMode {
    /// Local file-based database
    Local(String),
    /// Remote database (libSQL server / Turso)
    Remote { url: String, token: String },
}

/// LibSQL storage backend
pub struct LibsqlStorage {
    db: Database,
    local: bool,
}

impl LibsqlStorage {
    /// Validate a local database file before opening
    ///
    /// Returns `Ok(false)` when the file is missing and `must_exist` is false,
    /// `Ok(true)` when it exists and carries the SQLite header.
    fn validate_database_file(db_path: &str, must_exist: bool) -> Result<bool> {
        use std::io::Read;
        use std::path::Path;

        let path = Path::new(db_path);

        if !path.exists() {
            if must_exist {
                return Err(TagmakerError::Database(format!(
                    "Database file not found at '{}'. Check TAGMAKER_DB_PATH or --db-path.",
                    db_path
                )));
            }
            return Ok(false);
        }

        let mut header = [0u8; 16];
        let read = std::fs::File::open(path).and_then(|mut f| f.read_exact(&mut header));
        match read {
            Ok(()) if &header == b"SQLite format 3\0" => {
                debug!("Database file validation passed: {}", db_path);
                Ok(true)
            }
            Ok(()) => Err(TagmakerError::Database(format!(
                "Database file at '{}' is not a valid SQLite database",
                db_path
            ))),
            // An empty file is what a freshly created temp file looks like
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(true),
            Err(e) => Err(TagmakerError::Database(format!(
                "Cannot read database file at '{}': {}",
                db_path, e
            ))),
        }
    }

    /// Open storage, optionally creating the database, and run migrations
    ///
    /// Fails if the database cannot be reached or written; callers treat
    /// that as fatal for the job about to start.
    pub async fn new_with_validation(mode: ConnectionMode, create_if_missing: bool) -> Result<Self> {
        info!(
            "Connecting to LibSQL database: {} (create_if_missing: {})",
            describe_mode(&mode),
            create_if_missing
        );

        let db = match &mode {
            ConnectionMode::Local(path) => {
                let exists = Self::validate_database_file(path, !create_if_missing)?;

                if create_if_missing && !exists {
                    if let Some(parent) = std::path::Path::new(path).parent() {
                        if !parent.as_os_str().is_empty() {
                            std::fs::create_dir_all(parent).map_err(|e| {
                                TagmakerError::Database(format!(
                                    "Failed to create database directory {}: {}",
                                    parent.display(),
                                    e
                                ))
                            })?;
                        }
                    }
                }

                Builder::new_local(path).build().await.map_err(|e| {
                    TagmakerError::Database(format!("Failed to create local database: {}", e))
                })?
            }
            ConnectionMode::Remote { url, token } => Builder::new_remote(url.clone(), token.clone())
                .build()
                .await
                .map_err(|e| {
                    TagmakerError::Database(format!("Failed to create remote database: {}", e))
                })?,
        };

        let storage = Self {
            db,
            local: matches!(mode, ConnectionMode::Local(_)),
        };

        storage.verify_database_health().await?;
        storage.run_migrations().await?;

        info!("LibSQL database ready");
        Ok(storage)
    }

    /// Open an existing database
    pub async fn new(mode: ConnectionMode) -> Result<Self> {
        Self::new_with_validation(mode, false).await
    }

    /// Create from string path
    ///
    /// - "libsql://..." or "https://..." → Remote (token from TAGMAKER_DB_TOKEN)
    /// - Other → Local file path
    pub async fn from_path(database_url: &str, create_if_missing: bool) -> Result<Self> {
        let mode = if database_url.starts_with("libsql://") || database_url.starts_with("https://") {
            let token = std::env::var("TAGMAKER_DB_TOKEN")
                .map_err(|_| TagmakerError::Other("TAGMAKER_DB_TOKEN not found".into()))?;
            ConnectionMode::Remote {
                url: database_url.to_string(),
                token,
            }
        } else {
            ConnectionMode::Local(database_url.to_string())
        };

        Self::new_with_validation(mode, create_if_missing).await
    }

    async fn verify_database_health(&self) -> Result<()> {
        let conn = self.get_conn().await?;

        conn.query("SELECT 1", ()).await.map_err(|e| {
            TagmakerError::Database(format!(
                "Database corruption detected or invalid database file: {}",
                e
            ))
        })?;

        let write_test = r#"
            CREATE TABLE IF NOT EXISTS _health_check (id INTEGER PRIMARY KEY);
            DROP TABLE IF EXISTS _health_check;
        "#;

        if let Err(e) = conn.execute_batch(write_test).await {
            let error_msg = e.to_string().to_lowercase();
            if error_msg.contains("readonly") || error_msg.contains("permission") {
                return Err(TagmakerError::Database(format!(
                    "Database is read-only or lacks write permissions: {}",
                    e
                )));
            }
            return Err(TagmakerError::Database(format!(
                "Database write test failed: {}",
                e
            )));
        }

        debug!("Database health check passed");
        Ok(())
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations...");

        let conn = self.get_conn().await?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations_applied (
                migration_name TEXT PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )",
            (),
        )
        .await
        .map_err(|e| TagmakerError::Migration(format!("Failed to create migrations table: {}", e)))?;

        for (name, sql) in MIGRATIONS {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM _migrations_applied WHERE migration_name = ?",
                    params![*name],
                )
                .await?;

            let already_applied = match rows.next().await? {
                Some(row) => row.get::<i64>(0).unwrap_or(0),
                None => 0,
            };

            if already_applied > 0 {
                debug!("Skipping already applied migration: {}", name);
                continue;
            }

            let statements = parse_sql_statements(sql);
            debug!("Parsed {} statements from {}", statements.len(), name);
            for (i, statement) in statements.iter().enumerate() {
                let statement = statement.trim();
                if statement.is_empty() {
                    continue;
                }
                conn.execute(statement, ()).await.map_err(|e| {
                    TagmakerError::Migration(format!(
                        "Failed to execute statement #{} in {}: {}",
                        i + 1,
                        name,
                        e
                    ))
                })?;
            }

            conn.execute(
                "INSERT INTO _migrations_applied (migration_name, applied_at) VALUES (?, ?)",
                params![*name, Utc::now().timestamp()],
            )
            .await
            .map_err(|e| TagmakerError::Migration(format!("Failed to record migration: {}", e)))?;

            info!("Executed migration: {}", name);
        }

        info!("Database migrations completed");
        Ok(())
    }

    /// Get a connection from the database
    async fn get_conn(&self) -> Result<Connection> {
        let conn = self
            .db
            .connect()
            .map_err(|e| TagmakerError::Database(format!("Failed to get connection: {}", e)))?;

        if self.local {
            conn.execute_batch(&format!("PRAGMA busy_timeout = {};", BUSY_TIMEOUT_MS))
                .await?;
        }

        Ok(conn)
    }

    /// Record a pack event
    ///
    /// The active-org index is bumped by the `pack_events` insert trigger, so
    /// events written by other producers are picked up the same way.
    pub async fn record_pack_event(&self, event: &PackEvent) -> Result<()> {
        debug!(
            "Recording pack event {} for org {} ({} tags, accepted: {})",
            event.pack_id,
            event.org_id,
            event.tags.len(),
            event.accepted
        );

        let conn = self.get_conn().await?;
        conn.execute(
            r#"
            INSERT INTO pack_events (org_id, project_id, pack_id, accepted, tags, item_ids, ts)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                event.org_id.as_str(),
                event.project_id.as_str(),
                event.pack_id.as_str(),
                event.accepted as i64,
                serde_json::to_string(&event.tags)?,
                serde_json::to_string(&event.item_ids)?,
                event.ts
            ],
        )
        .await?;

        Ok(())
    }

    /// Store a tagged memory document
    pub async fn store_tagged_memory(&self, memory: &TaggedMemory) -> Result<()> {
        debug!("Storing memory {} with {} tags", memory.id, memory.tags.len());

        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;

        tx.execute(
            r#"
            INSERT INTO memories (id, org_id, project_id, created_at, promoted_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![
                memory.id.as_str(),
                memory.org_id.as_str(),
                memory.project_id.as_str(),
                memory.created_at.to_rfc3339(),
                memory
                    .promoted_at
                    .map(|t| libsql::Value::Text(t.to_rfc3339()))
                    .unwrap_or(libsql::Value::Null)
            ],
        )
        .await?;

        for tag in &memory.tags {
            tx.execute(
                "INSERT OR IGNORE INTO memory_tags (memory_id, tag) VALUES (?, ?)",
                params![memory.id.as_str(), tag.as_str()],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Mark a memory as promoted at `at`
    pub async fn mark_promoted(&self, memory_id: &str, at: DateTime<Utc>) -> Result<()> {
        debug!("Marking memory {} promoted", memory_id);

        let conn = self.get_conn().await?;
        let updated = conn
            .execute(
                "UPDATE memories SET promoted_at = ? WHERE id = ?",
                params![at.to_rfc3339(), memory_id],
            )
            .await?;

        if updated == 0 {
            return Err(TagmakerError::Other(format!("Memory not found: {}", memory_id)));
        }
        Ok(())
    }

    /// Tier and rebalance count of one memory document
    pub async fn memory_tier(&self, memory_id: &str) -> Result<Option<(i64, i64)>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT tier, rebalance_count FROM memories WHERE id = ?",
                params![memory_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some((row.get::<i64>(0)?, row.get::<i64>(1)?))),
            None => Ok(None),
        }
    }

    /// Authoritative tier of a tag, if one has been assigned
    pub async fn tag_tier(&self, tag: &str) -> Result<Option<i64>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query("SELECT tier FROM tag_tiers WHERE tag = ?", params![tag])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<i64>(0)?)),
            None => Ok(None),
        }
    }

    /// Corpus-wide counts for monitoring
    pub async fn tag_statistics(&self) -> Result<TagStatistics> {
        let conn = self.get_conn().await?;
        let since = (Utc::now() - ChronoDuration::hours(24)).to_rfc3339();

        let total_tags = count(&conn, "SELECT COUNT(DISTINCT tag) FROM memory_tags", ()).await?;
        let total_memories = count(&conn, "SELECT COUNT(*) FROM memories", ()).await?;
        let recent_memories_24h = count(
            &conn,
            "SELECT COUNT(*) FROM memories WHERE created_at >= ?",
            params![since],
        )
        .await?;
        let total_edge_documents = count(&conn, "SELECT COUNT(*) FROM tag_edges", ()).await?;

        Ok(TagStatistics {
            total_tags,
            total_memories,
            recent_memories_24h,
            total_edge_documents,
        })
    }
}

async fn count(conn: &Connection, sql: &str, params: impl libsql::params::IntoParams) -> Result<usize> {
    let mut rows = conn.query(sql, params).await?;
    match rows.next().await? {
        Some(row) => Ok(row.get::<i64>(0)?.max(0) as usize),
        None => Ok(0),
    }
}

fn describe_mode(mode: &ConnectionMode) -> String {
    match mode {
        ConnectionMode::Local(path) => format!("local:{}", path),
        ConnectionMode::Remote { url, .. } => format!("remote:{}", url),
    }
}

#[async_trait]
impl TagStore for LibsqlStorage {
    async fn ping(&self) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.query("SELECT 1", ()).await?;
        Ok(())
    }

    async fn list_active_orgs(&self, since_ts: i64) -> Result<Vec<String>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT org_id FROM active_orgs WHERE last_event_ts >= ? ORDER BY org_id",
                params![since_ts],
            )
            .await?;

        let mut orgs = Vec::new();
        while let Some(row) = rows.next().await? {
            orgs.push(row.get::<String>(0)?);
        }

        debug!("Found {} active orgs since {}", orgs.len(), since_ts);
        Ok(orgs)
    }

    async fn events_since(&self, org_id: &str, since_ts: i64) -> Result<Vec<PackEvent>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT org_id, project_id, pack_id, accepted, tags, item_ids, ts
                FROM pack_events
                WHERE org_id = ? AND ts >= ?
                ORDER BY ts ASC, id ASC
                "#,
                params![org_id, since_ts],
            )
            .await?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await? {
            let pack_id: String = row.get(2)?;
            let tags_json: String = row.get(4)?;
            let items_json: String = row.get(5)?;

            let tags: Vec<String> = match serde_json::from_str(&tags_json) {
                Ok(tags) => tags,
                Err(e) => {
                    warn!("Skipping pack event {} with malformed tags: {}", pack_id, e);
                    continue;
                }
            };

            events.push(PackEvent {
                org_id: row.get(0)?,
                project_id: row.get(1)?,
                pack_id,
                accepted: row.get::<i64>(3)? != 0,
                tags,
                item_ids: serde_json::from_str(&items_json).unwrap_or_default(),
                ts: row.get(6)?,
            });
        }

        Ok(events)
    }

    async fn load_tag_edges(&self, org_id: &str, tag: &str) -> Result<Option<StoredTagEdges>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT edges, version FROM tag_edges WHERE org_id = ? AND tag = ?",
                params![org_id, tag],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };

        let edges_json: String = row.get(0)?;
        let edges: Vec<TagEdge> = serde_json::from_str(&edges_json)?;

        Ok(Some(StoredTagEdges {
            doc: TagEdges {
                org_id: org_id.to_string(),
                tag: tag.to_string(),
                edges,
            },
            version: row.get(1)?,
        }))
    }

    async fn replace_tag_edges(
        &self,
        doc: &TagEdges,
        expected_version: Option<i64>,
    ) -> Result<WriteOutcome> {
        let conn = self.get_conn().await?;
        let edges_json = serde_json::to_string(&doc.edges)?;
        let now = Utc::now().timestamp();

        let written = match expected_version {
            None => {
                conn.execute(
                    r#"
                    INSERT INTO tag_edges (org_id, tag, edges, version, updated_at)
                    VALUES (?, ?, ?, 1, ?)
                    ON CONFLICT(org_id, tag) DO NOTHING
                    "#,
                    params![doc.org_id.as_str(), doc.tag.as_str(), edges_json, now],
                )
                .await?
            }
            Some(version) => {
                conn.execute(
                    r#"
                    UPDATE tag_edges
                    SET edges = ?, version = version + 1, updated_at = ?
                    WHERE org_id = ? AND tag = ? AND version = ?
                    "#,
                    params![edges_json, now, doc.org_id.as_str(), doc.tag.as_str(), version],
                )
                .await?
            }
        };

        if written == 0 {
            debug!(
                "Edge document {}/{} changed underneath us (expected version {:?})",
                doc.org_id, doc.tag, expected_version
            );
            return Ok(WriteOutcome::Conflict);
        }

        Ok(WriteOutcome::Applied)
    }

    async fn list_tag_metrics(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<TagMetricsRecord>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT mt.tag,
                       COUNT(*) AS use_count,
                       MIN(m.created_at) AS created_at,
                       MAX(m.created_at) AS last_used_at,
                       MAX(m.promoted_at) AS last_promoted_at,
                       MAX(tt.tier) AS tier
                FROM memory_tags mt
                JOIN memories m ON m.id = mt.memory_id
                LEFT JOIN tag_tiers tt ON tt.tag = mt.tag
                GROUP BY mt.tag
                ORDER BY mt.tag
                LIMIT ? OFFSET ?
                "#,
                params![page_size as i64, (page * page_size) as i64],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(TagMetricsRecord {
                tag: row.get(0)?,
                use_count: row.get(1)?,
                created_at: row.get(2)?,
                last_used_at: row.get(3)?,
                last_promoted_at: row.get(4)?,
                tier: row.get(5)?,
            });
        }

        debug!(
            "Fetched {} tag metric records (page={}, page_size={})",
            records.len(),
            page,
            page_size
        );
        Ok(records)
    }

    async fn update_tag_tier(
        &self,
        tag: &str,
        new_tier: Tier,
        observed_tier: Option<i64>,
    ) -> Result<WriteOutcome> {
        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;
        let now = Utc::now().to_rfc3339();

        let claimed = match observed_tier {
            Some(observed) => {
                tx.execute(
                    "UPDATE tag_tiers SET tier = ?, updated_at = ? WHERE tag = ? AND tier = ?",
                    params![new_tier.as_i64(), now.as_str(), tag, observed],
                )
                .await?
            }
            None => {
                tx.execute(
                    r#"
                    INSERT INTO tag_tiers (tag, tier, updated_at) VALUES (?, ?, ?)
                    ON CONFLICT(tag) DO NOTHING
                    "#,
                    params![tag, new_tier.as_i64(), now.as_str()],
                )
                .await?
            }
        };

        if claimed == 0 {
            tx.rollback().await?;
            return Ok(WriteOutcome::Conflict);
        }

        let fanned_out = tx
            .execute(
                r#"
                UPDATE memories
                SET tier = ?, tier_updated_at = ?, rebalance_count = rebalance_count + 1
                WHERE id IN (SELECT memory_id FROM memory_tags WHERE tag = ?)
                "#,
                params![new_tier.as_i64(), now.as_str(), tag],
            )
            .await?;

        tx.commit().await?;

        debug!(
            "Updated tier for tag '{}' to {}: {} documents modified",
            tag, new_tier, fanned_out
        );
        Ok(WriteOutcome::Applied)
    }
}
