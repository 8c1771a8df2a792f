//! SQL migration definitions for the TenderFlow database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed within a transaction.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: tenders, catalog, requirements, matches, pricing, runs",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Tender documents and their lifecycle status
CREATE TABLE IF NOT EXISTS tenders (
    id           TEXT PRIMARY KEY,
    title        TEXT NOT NULL,
    body         TEXT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'draft',
    summary_json TEXT,
    files_json   TEXT NOT NULL DEFAULT '[]',
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

-- Sellable catalog items (SKUs), the matching corpus
CREATE TABLE IF NOT EXISTS catalog_items (
    id          TEXT PRIMARY KEY,
    code        TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL,
    base_price  REAL NOT NULL,
    created_at  TEXT NOT NULL
);

-- Extracted requirement batches, one batch per pipeline run
CREATE TABLE IF NOT EXISTS requirements (
    id         TEXT PRIMARY KEY,
    tender_id  TEXT NOT NULL REFERENCES tenders(id) ON DELETE CASCADE,
    run_id     TEXT NOT NULL,
    position   INTEGER NOT NULL,
    text       TEXT NOT NULL,
    quantity   INTEGER NOT NULL DEFAULT 1,
    confidence REAL NOT NULL DEFAULT 0.0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_requirements_tender_run ON requirements(tender_id, run_id);

-- Requirement-to-catalog matches, one row per retrieved neighbor
CREATE TABLE IF NOT EXISTS matches (
    id             TEXT PRIMARY KEY,
    tender_id      TEXT NOT NULL REFERENCES tenders(id) ON DELETE CASCADE,
    run_id         TEXT NOT NULL,
    requirement_id TEXT NOT NULL REFERENCES requirements(id) ON DELETE CASCADE,
    catalog_id     TEXT NOT NULL REFERENCES catalog_items(id),
    score          REAL NOT NULL,
    explanation    TEXT NOT NULL DEFAULT 'auto',
    created_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_matches_tender_run ON matches(tender_id, run_id);

-- Authoritative pricing output, one row per completed run
CREATE TABLE IF NOT EXISTS pricing_results (
    id              TEXT PRIMARY KEY,
    tender_id       TEXT NOT NULL REFERENCES tenders(id) ON DELETE CASCADE,
    run_id          TEXT NOT NULL,
    line_items_json TEXT NOT NULL,
    total_base      REAL NOT NULL,
    margin          REAL NOT NULL,
    total           REAL NOT NULL,
    margin_percent  REAL NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_pricing_tender_run ON pricing_results(tender_id, run_id);

-- Pipeline run records: batch scoping and stage resumption
CREATE TABLE IF NOT EXISTS pipeline_runs (
    id          TEXT PRIMARY KEY,
    tender_id   TEXT NOT NULL REFERENCES tenders(id) ON DELETE CASCADE,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    last_stage  TEXT,
    error       TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_tender ON pipeline_runs(tender_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
