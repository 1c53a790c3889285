//! Persistent token-bucket rate limiter.
//!
//! Buckets are keyed by (rule_id, tool, host, agent) and live in the store
//! so limits survive restarts. Tokens refill continuously at the rule's
//! refill rate up to its capacity; each admitted request consumes one token.

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};

use crate::policy::RateLimitSpec;

/// Outcome of a bucket check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BucketDecision {
    /// Request admitted; `remaining` tokens are left in the bucket.
    Allowed { remaining: f64 },
    /// Request throttled; the bucket projects a token at `reset_at` (ms).
    Throttled { reset_at: i64 },
}

/// The full key of one bucket.
#[derive(Debug, Clone)]
pub struct BucketKey<'a> {
    pub rule_id: &'a str,
    pub tool: &'a str,
    pub host: &'a str,
    pub agent: &'a str,
}

/// Refill the bucket to `now_ms`, then try to consume one token.
///
/// The refill-read-consume-write sequence must run inside the caller's
/// transaction so concurrent requests against the same bucket serialize.
/// New buckets are created full.
pub fn check(
    conn: &Connection,
    key: &BucketKey<'_>,
    spec: &RateLimitSpec,
    now_ms: i64,
) -> Result<BucketDecision> {
    let existing: Option<(f64, i64)> = conn
        .query_row(
            "SELECT tokens, last_refill FROM rate_limit_buckets
             WHERE rule_id = ?1 AND tool = ?2 AND host = ?3 AND agent = ?4",
            rusqlite::params![key.rule_id, key.tool, key.host, key.agent],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context("reading rate limit bucket")?;

    let capacity = spec.max_tokens;
    let tokens = match existing {
        Some((tokens, last_refill)) => {
            let elapsed_secs = (now_ms - last_refill).max(0) as f64 / 1000.0;
            (tokens + elapsed_secs * spec.refill_rate_per_sec).min(capacity)
        }
        None => capacity,
    };

    if tokens >= 1.0 {
        let remaining = tokens - 1.0;
        upsert(conn, key, remaining, now_ms)?;
        Ok(BucketDecision::Allowed { remaining })
    } else {
        upsert(conn, key, tokens, now_ms)?;
        let wait_secs = ((1.0 - tokens) / spec.refill_rate_per_sec).ceil() as i64;
        Ok(BucketDecision::Throttled { reset_at: now_ms + wait_secs * 1000 })
    }
}

fn upsert(conn: &Connection, key: &BucketKey<'_>, tokens: f64, now_ms: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO rate_limit_buckets (rule_id, tool, host, agent, tokens, last_refill, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
         ON CONFLICT(rule_id, tool, host, agent) DO UPDATE SET
             tokens = excluded.tokens,
             last_refill = excluded.last_refill",
        rusqlite::params![key.rule_id, key.tool, key.host, key.agent, tokens, now_ms],
    )?;
    Ok(())
}

/// Delete buckets created more than `max_idle_ms` ago and not touched since.
/// No functional impact; keeps the table from growing without bound.
pub fn cleanup_stale(conn: &Connection, now_ms: i64, max_idle_ms: i64) -> Result<usize> {
    let cutoff = now_ms - max_idle_ms;
    let removed = conn.execute(
        "DELETE FROM rate_limit_buckets WHERE created_at < ?1 AND last_refill < ?1",
        [cutoff],
    )?;
    Ok(removed)
}
