//! Embedded libSQL state store plus batch artifacts and the run lock.
//!
//! The [`Storage`] struct wraps a libSQL database holding the run ledger,
//! per-product lifecycle states, the enrichment mirror, index document hashes,
//! and pre-deletion index snapshots.
//!
//! **Access rules:**
//! - `run`, `fetch`, `restore`: read-write via [`Storage::open`]
//! - `runs`, `report`: read-only via [`Storage::open_readonly`]

pub mod batches;
pub mod lock;
mod migrations;

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use catalogsync_shared::{
    CatalogSyncError, EnrichmentRecord, EntityKind, ProductState, Result, RunStatus,
};
use libsql::{Connection, Database, params};

pub use batches::{BatchStore, FileBatchStore, MemoryBatchStore};
pub use lock::RunLock;

/// Database file name inside the state directory.
pub const DB_FILE_NAME: &str = "catalogsync.db";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// One row of the run ledger.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub source: String,
    pub status: RunStatus,
    pub dry_run: bool,
    pub batch_id: Option<String>,
    pub report_json: Option<String>,
}

/// A document captured before it was deleted from the index.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub document_id: String,
    pub document_json: String,
    pub restored: bool,
}

fn db_err(e: libsql::Error) -> CatalogSyncError {
    CatalogSyncError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CatalogSyncError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Scratch database that disappears with the handle. Used for dry runs.
    pub async fn open_in_memory() -> Result<Self> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` for inspection only.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CatalogSyncError::Storage(format!(
                "no state database at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    CatalogSyncError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(CatalogSyncError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run ledger
    // -----------------------------------------------------------------------

    /// Record the start of a run.
    pub async fn insert_run(
        &self,
        run_id: &str,
        started_at: DateTime<Utc>,
        source: &str,
        dry_run: bool,
    ) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO runs (id, started_at, source, status, dry_run)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run_id,
                    started_at.to_rfc3339(),
                    source,
                    RunStatus::Running.as_str(),
                    dry_run as i64
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Close a run with its final status and serialized report.
    pub async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        batch_id: Option<&str>,
        report_json: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET finished_at = ?1, status = ?2, batch_id = ?3, report_json = ?4
                 WHERE id = ?5",
                params![now.as_str(), status.as_str(), batch_id, report_json, run_id],
            )
            .await
            .map_err(db_err)?;
        if changed == 0 {
            return Err(CatalogSyncError::Storage(format!("unknown run {run_id}")));
        }
        Ok(())
    }

    /// Overwrite only the status of a run.
    pub async fn set_run_status(&self, run_id: &str, status: RunStatus) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE runs SET status = ?1 WHERE id = ?2",
                params![status.as_str(), run_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, source, status, dry_run, batch_id, report_json
                 FROM runs WHERE id = ?1",
                params![run_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, source, status, dry_run, batch_id, report_json
                 FROM runs ORDER BY started_at DESC, id DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_run(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Product lifecycle
    // -----------------------------------------------------------------------

    /// Persist final lifecycle states for a run.
    pub async fn upsert_product_states(
        &self,
        run_id: &str,
        states: &[(String, String, ProductState)],
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction().await.map_err(db_err)?;
        for (vendor_id, canonical_id, state) in states {
            tx.execute(
                "INSERT INTO product_states (vendor_id, canonical_id, state, run_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(vendor_id) DO UPDATE SET
                   canonical_id = excluded.canonical_id,
                   state = excluded.state,
                   run_id = excluded.run_id,
                   updated_at = excluded.updated_at",
                params![
                    vendor_id.as_str(),
                    canonical_id.as_str(),
                    state.as_str(),
                    run_id,
                    now.as_str()
                ],
            )
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Last persisted state per vendor id.
    pub async fn product_states(&self) -> Result<HashMap<String, ProductState>> {
        let mut rows = self
            .conn
            .query("SELECT vendor_id, state FROM product_states", params![])
            .await
            .map_err(db_err)?;

        let mut out = HashMap::new();
        while let Ok(Some(row)) = rows.next().await {
            let vendor_id = row.get::<String>(0).map_err(db_err)?;
            let state = row.get::<String>(1).map_err(db_err)?;
            out.insert(vendor_id, state.parse()?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Enrichment mirror
    // -----------------------------------------------------------------------

    /// Replace the mirror with the latest content-service listing.
    pub async fn replace_enrichment_mirror(&self, records: &[EnrichmentRecord]) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction().await.map_err(db_err)?;
        tx.execute("DELETE FROM enrichment_mirror", params![])
            .await
            .map_err(db_err)?;
        for record in records {
            let json = serde_json::to_string(record)
                .map_err(|e| CatalogSyncError::Storage(format!("encode record: {e}")))?;
            tx.execute(
                "INSERT OR REPLACE INTO enrichment_mirror
                   (entity_kind, entity_id, remote_id, record_json, mirrored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entity_kind_str(record.entity_kind),
                    record.entity_id.as_str(),
                    record.id.as_deref(),
                    json,
                    now.as_str()
                ],
            )
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    pub async fn enrichment_mirror(&self) -> Result<Vec<EnrichmentRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_json FROM enrichment_mirror ORDER BY entity_kind, entity_id",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let json = row.get::<String>(0).map_err(db_err)?;
            out.push(
                serde_json::from_str(&json)
                    .map_err(|e| CatalogSyncError::Storage(format!("decode record: {e}")))?,
            );
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Index bookkeeping
    // -----------------------------------------------------------------------

    /// Content hash of every document last sent to the index.
    pub async fn document_hashes(&self) -> Result<HashMap<String, String>> {
        let mut rows = self
            .conn
            .query("SELECT id, content_hash FROM indexed_documents", params![])
            .await
            .map_err(db_err)?;

        let mut out = HashMap::new();
        while let Ok(Some(row)) = rows.next().await {
            out.insert(
                row.get::<String>(0).map_err(db_err)?,
                row.get::<String>(1).map_err(db_err)?,
            );
        }
        Ok(out)
    }

    pub async fn set_document_hash(&self, id: &str, hash: &str, run_id: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO indexed_documents (id, content_hash, run_id, synced_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                   content_hash = excluded.content_hash,
                   run_id = excluded.run_id,
                   synced_at = excluded.synced_at",
                params![id, hash, run_id, now.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn remove_document_hash(&self, id: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute("DELETE FROM indexed_documents WHERE id = ?1", params![id])
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Capture documents about to be deleted. Must complete before any delete.
    pub async fn insert_snapshots(&self, run_id: &str, documents: &[(String, String)]) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction().await.map_err(db_err)?;
        for (document_id, json) in documents {
            tx.execute(
                "INSERT OR REPLACE INTO index_snapshots
                   (run_id, document_id, document_json, captured_at, restored_at)
                 VALUES (?1, ?2, ?3, ?4, NULL)",
                params![run_id, document_id.as_str(), json.as_str(), now.as_str()],
            )
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    pub async fn snapshots(&self, run_id: &str) -> Result<Vec<SnapshotEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT document_id, document_json, restored_at FROM index_snapshots
                 WHERE run_id = ?1 ORDER BY document_id",
                params![run_id],
            )
            .await
            .map_err(db_err)?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(SnapshotEntry {
                document_id: row.get::<String>(0).map_err(db_err)?,
                document_json: row.get::<String>(1).map_err(db_err)?,
                restored: row.get::<String>(2).is_ok(),
            });
        }
        Ok(out)
    }

    pub async fn mark_snapshot_restored(&self, run_id: &str, document_id: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE index_snapshots SET restored_at = ?1
                 WHERE run_id = ?2 AND document_id = ?3",
                params![now.as_str(), run_id, document_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

fn entity_kind_str(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Product => "product",
        EntityKind::Brand => "brand",
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CatalogSyncError::Storage(format!("invalid date: {e}")))
}

fn row_to_run(row: &libsql::Row) -> Result<RunRecord> {
    Ok(RunRecord {
        id: row.get::<String>(0).map_err(db_err)?,
        started_at: parse_ts(&row.get::<String>(1).map_err(db_err)?)?,
        finished_at: match row.get::<String>(2).ok() {
            Some(s) => Some(parse_ts(&s)?),
            None => None,
        },
        source: row.get::<String>(3).map_err(db_err)?,
        status: row.get::<String>(4).map_err(db_err)?.parse()?,
        dry_run: row.get::<i64>(5).map_err(db_err)? != 0,
        batch_id: row.get::<String>(6).ok(),
        report_json: row.get::<String>(7).ok(),
    })
}
