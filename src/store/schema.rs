//! Database schema for the knowledge store.

/// Current schema version for migrations.
pub const SCHEMA_VERSION: u32 = 1;

/// SQL schema for the knowledge database.
pub const SCHEMA: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- One evolving record per entity, stored as JSON
CREATE TABLE IF NOT EXISTS knowledge_records (
    entity TEXT PRIMARY KEY NOT NULL,
    record_json TEXT NOT NULL,
    total_runs INTEGER NOT NULL,
    last_run_id TEXT,
    updated_at TEXT NOT NULL
);

-- Run history; immutable once status leaves 'running'
CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY NOT NULL,
    entity TEXT NOT NULL,
    run_number INTEGER NOT NULL,
    status TEXT NOT NULL,
    directive TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    run_json TEXT NOT NULL,
    UNIQUE (entity, run_number)
);

-- Ordered event log per run, used for replay
CREATE TABLE IF NOT EXISTS run_events (
    run_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    event_type TEXT NOT NULL,
    node TEXT NOT NULL,
    event_json TEXT NOT NULL,
    PRIMARY KEY (run_id, seq),
    FOREIGN KEY (run_id) REFERENCES runs(run_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_runs_entity ON runs(entity);
CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at);
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
";
