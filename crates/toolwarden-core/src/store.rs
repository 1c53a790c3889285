//! SQLite persistence shared by all sentinel subsystems.
//!
//! One database, write-ahead journaling, nine logical tables. The connection
//! is wrapped in a mutex: the policy-evaluation-plus-audit-write segment for
//! a single request must be serialized against every other request touching
//! the same store, or sequence numbers and bucket state would race.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{Connection, Transaction};

/// The shared persistent store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the sentinel database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating directory for {}", db_path.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening sentinel database at {}", db_path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .context("enabling WAL journaling")?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(SCHEMA).context("initializing schema")?;
        // Seed the process-global configuration the engine reads on every
        // request. INSERT OR IGNORE keeps operator-set values across restarts.
        conn.execute_batch(
            "INSERT OR IGNORE INTO config (key, value) VALUES ('mode', 'silent-allow');
             INSERT OR IGNORE INTO config (key, value) VALUES ('anomaly_threshold_low', '25');
             INSERT OR IGNORE INTO config (key, value) VALUES ('anomaly_threshold_medium', '50');
             INSERT OR IGNORE INTO config (key, value) VALUES ('anomaly_threshold_high', '75');
             INSERT OR IGNORE INTO config (key, value) VALUES ('anomaly_threshold_critical', '90');",
        )?;
        Ok(())
    }

    /// Lock the underlying connection.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    /// Run `f` inside a single transaction, committing on success.
    ///
    /// All multi-step operations that must be atomic (audit append, bucket
    /// refill-and-consume, token consumption, breaker transitions) go through
    /// here. A failure rolls the whole segment back; the audit entry is never
    /// partially written.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction().context("beginning transaction")?;
        let out = f(&tx)?;
        tx.commit().context("committing transaction")?;
        Ok(out)
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rules (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    priority INTEGER NOT NULL,
    action TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    tool_pattern TEXT,
    host_pattern TEXT,
    agent_pattern TEXT,
    argument_pattern TEXT,
    rate_limit TEXT,
    schedule TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    sequence_number INTEGER PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    tool TEXT NOT NULL,
    host TEXT NOT NULL,
    agent TEXT NOT NULL,
    arguments TEXT NOT NULL,
    verdict TEXT NOT NULL,
    action TEXT NOT NULL,
    matched_rule_id TEXT,
    risk_score REAL NOT NULL,
    risk_factors TEXT NOT NULL,
    mode TEXT NOT NULL,
    response_status TEXT,
    error_message TEXT,
    hash TEXT NOT NULL UNIQUE,
    previous_hash TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_tool_host_time ON audit_log (tool, host, timestamp);
CREATE INDEX IF NOT EXISTS idx_audit_host_time ON audit_log (host, timestamp);

CREATE TABLE IF NOT EXISTS anomaly_baselines (
    tool TEXT NOT NULL,
    host TEXT NOT NULL,
    frequency_mean REAL NOT NULL DEFAULT 0,
    frequency_stddev REAL NOT NULL DEFAULT 0,
    frequency_m2 REAL NOT NULL DEFAULT 0,
    hourly_distribution TEXT NOT NULL,
    argument_fingerprints TEXT NOT NULL,
    tool_bigrams TEXT NOT NULL,
    error_rate_mean REAL NOT NULL DEFAULT 0,
    error_rate_stddev REAL NOT NULL DEFAULT 0,
    error_rate_m2 REAL NOT NULL DEFAULT 0,
    last_updated INTEGER NOT NULL,
    sample_count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (tool, host)
);

CREATE TABLE IF NOT EXISTS rate_limit_buckets (
    rule_id TEXT NOT NULL,
    tool TEXT NOT NULL,
    host TEXT NOT NULL,
    agent TEXT NOT NULL,
    tokens REAL NOT NULL,
    last_refill INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (rule_id, tool, host, agent)
);

CREATE TABLE IF NOT EXISTS circuit_breakers (
    host TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    failure_count INTEGER NOT NULL DEFAULT 0,
    last_failure INTEGER,
    last_success INTEGER,
    opened_at INTEGER,
    half_open_at INTEGER
);

CREATE TABLE IF NOT EXISTS quarantine (
    scope TEXT NOT NULL,
    target TEXT NOT NULL,
    reason TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER,
    created_by TEXT NOT NULL,
    PRIMARY KEY (scope, target)
);

CREATE TABLE IF NOT EXISTS alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    severity TEXT NOT NULL,
    tool TEXT NOT NULL,
    host TEXT NOT NULL,
    agent TEXT NOT NULL,
    message TEXT NOT NULL,
    risk_score REAL NOT NULL,
    acknowledged INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS confirmation_tokens (
    token TEXT PRIMARY KEY,
    tool TEXT NOT NULL,
    host TEXT NOT NULL,
    agent TEXT NOT NULL,
    arguments TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    used INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";
