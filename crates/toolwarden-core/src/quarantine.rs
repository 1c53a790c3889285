//! Quarantine registry: administrative blocks on a host, tool, or agent.
//!
//! Targets are matched case-sensitively and exactly -- operators quarantine
//! the identifier exactly as observed, with no normalization. Entries
//! auto-expire on every read touch.

use anyhow::{bail, Context, Result};
use rusqlite::{Connection, OptionalExtension};

/// What kind of identifier a quarantine entry blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Host,
    Tool,
    Agent,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Host => "host",
            Scope::Tool => "tool",
            Scope::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Result<Scope> {
        match s {
            "host" => Ok(Scope::Host),
            "tool" => Ok(Scope::Tool),
            "agent" => Ok(Scope::Agent),
            other => bail!("unknown quarantine scope '{other}'"),
        }
    }
}

/// One quarantine entry.
#[derive(Debug, Clone)]
pub struct QuarantineEntry {
    pub scope: Scope,
    pub target: String,
    pub reason: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub created_by: String,
}

/// Insert or update a quarantine entry. Re-quarantining the same
/// (scope, target) refreshes the reason and expiry.
pub fn upsert(conn: &Connection, entry: &QuarantineEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO quarantine (scope, target, reason, created_at, expires_at, created_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(scope, target) DO UPDATE SET
             reason = excluded.reason,
             created_at = excluded.created_at,
             expires_at = excluded.expires_at,
             created_by = excluded.created_by",
        rusqlite::params![
            entry.scope.as_str(),
            entry.target,
            entry.reason,
            entry.created_at,
            entry.expires_at,
            entry.created_by,
        ],
    )
    .context("upserting quarantine entry")?;
    Ok(())
}

/// Remove a quarantine entry. Returns true if one existed.
pub fn remove(conn: &Connection, scope: Scope, target: &str) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM quarantine WHERE scope = ?1 AND target = ?2",
        rusqlite::params![scope.as_str(), target],
    )?;
    Ok(removed > 0)
}

/// Look up an active quarantine entry for (scope, target).
///
/// An entry whose expiry has passed is deleted on this read and reported
/// as absent.
pub fn lookup_active(
    conn: &Connection,
    scope: Scope,
    target: &str,
    now_ms: i64,
) -> Result<Option<QuarantineEntry>> {
    let raw = conn
        .query_row(
            "SELECT reason, created_at, expires_at, created_by
             FROM quarantine WHERE scope = ?1 AND target = ?2",
            rusqlite::params![scope.as_str(), target],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    let Some((reason, created_at, expires_at, created_by)) = raw else {
        return Ok(None);
    };
    if let Some(expiry) = expires_at {
        if expiry <= now_ms {
            remove(conn, scope, target)?;
            return Ok(None);
        }
    }
    Ok(Some(QuarantineEntry {
        scope,
        target: target.to_string(),
        reason,
        created_at,
        expires_at,
        created_by,
    }))
}

/// List all active entries, sweeping expired ones first.
pub fn list(conn: &Connection, now_ms: i64) -> Result<Vec<QuarantineEntry>> {
    sweep_expired(conn, now_ms)?;
    let mut stmt = conn.prepare(
        "SELECT scope, target, reason, created_at, expires_at, created_by
         FROM quarantine ORDER BY created_at DESC",
    )?;
    let raws = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    raws.into_iter()
        .map(|(scope, target, reason, created_at, expires_at, created_by)| {
            Ok(QuarantineEntry {
                scope: Scope::parse(&scope)?,
                target,
                reason,
                created_at,
                expires_at,
                created_by,
            })
        })
        .collect()
}

/// Delete expired entries. Returns how many were removed.
pub fn sweep_expired(conn: &Connection, now_ms: i64) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM quarantine WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        [now_ms],
    )?;
    Ok(removed)
}
