//! SQL migration definitions for the catalogsync state database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: runs, product_states, enrichment_mirror",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Run ledger
CREATE TABLE IF NOT EXISTS runs (
    id          TEXT PRIMARY KEY,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    source      TEXT NOT NULL,
    status      TEXT NOT NULL,
    dry_run     INTEGER NOT NULL DEFAULT 0,
    batch_id    TEXT,
    report_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at);

-- Lifecycle state per vendor id
CREATE TABLE IF NOT EXISTS product_states (
    vendor_id    TEXT PRIMARY KEY,
    canonical_id TEXT NOT NULL,
    state        TEXT NOT NULL,
    run_id       TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_product_states_state ON product_states(state);

-- Local mirror of the content service listing
CREATE TABLE IF NOT EXISTS enrichment_mirror (
    entity_kind TEXT NOT NULL,
    entity_id   TEXT NOT NULL,
    remote_id   TEXT,
    record_json TEXT NOT NULL,
    mirrored_at TEXT NOT NULL,
    PRIMARY KEY (entity_kind, entity_id)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Index bookkeeping: indexed_documents, index_snapshots",
            sql: r#"
-- Content hash of every document last sent to the search index
CREATE TABLE IF NOT EXISTS indexed_documents (
    id           TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL,
    run_id       TEXT NOT NULL,
    synced_at    TEXT NOT NULL
);

-- Documents captured before deletion, for compensation
CREATE TABLE IF NOT EXISTS index_snapshots (
    run_id        TEXT NOT NULL,
    document_id   TEXT NOT NULL,
    document_json TEXT NOT NULL,
    captured_at   TEXT NOT NULL,
    restored_at   TEXT,
    PRIMARY KEY (run_id, document_id)
);

CREATE INDEX IF NOT EXISTS idx_index_snapshots_run ON index_snapshots(run_id);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
