//! Per-host circuit breaker.
//!
//! Finite-state machine keyed by host: closed -> open after repeated
//! downstream failures, open -> half-open once the cooldown elapses
//! (transition happens on read and is persisted), half-open -> closed on the
//! next success or back to open on the next failure. The policy engine only
//! reads state; writes happen when a downstream response (or timeout)
//! arrives.

use anyhow::{bail, Context, Result};
use rusqlite::{Connection, OptionalExtension};

/// Consecutive failures before the circuit opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 2;
/// Milliseconds an open circuit waits before admitting a half-open probe.
pub const DEFAULT_COOLDOWN_MS: i64 = 120_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }

    pub fn parse(s: &str) -> Result<BreakerState> {
        match s {
            "closed" => Ok(BreakerState::Closed),
            "open" => Ok(BreakerState::Open),
            "half-open" => Ok(BreakerState::HalfOpen),
            other => bail!("unknown circuit breaker state '{other}'"),
        }
    }
}

/// Persisted breaker record for one host.
#[derive(Debug, Clone)]
pub struct BreakerRecord {
    pub host: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub last_failure: Option<i64>,
    pub last_success: Option<i64>,
    pub opened_at: Option<i64>,
    pub half_open_at: Option<i64>,
}

impl BreakerRecord {
    fn closed(host: &str) -> Self {
        Self {
            host: host.to_string(),
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure: None,
            last_success: None,
            opened_at: None,
            half_open_at: None,
        }
    }
}

/// Load the breaker record for a host, if one exists.
pub fn load(conn: &Connection, host: &str) -> Result<Option<BreakerRecord>> {
    let raw = conn
        .query_row(
            "SELECT host, state, failure_count, last_failure, last_success, opened_at, half_open_at
             FROM circuit_breakers WHERE host = ?1",
            [host],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                ))
            },
        )
        .optional()
        .with_context(|| format!("loading circuit breaker for host '{host}'"))?;

    raw.map(|(host, state, failure_count, last_failure, last_success, opened_at, half_open_at)| {
        Ok(BreakerRecord {
            state: BreakerState::parse(&state)
                .with_context(|| format!("circuit breaker for host '{host}'"))?,
            host,
            failure_count,
            last_failure,
            last_success,
            opened_at,
            half_open_at,
        })
    })
    .transpose()
}

fn save(conn: &Connection, record: &BreakerRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO circuit_breakers
             (host, state, failure_count, last_failure, last_success, opened_at, half_open_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(host) DO UPDATE SET
             state = excluded.state,
             failure_count = excluded.failure_count,
             last_failure = excluded.last_failure,
             last_success = excluded.last_success,
             opened_at = excluded.opened_at,
             half_open_at = excluded.half_open_at",
        rusqlite::params![
            record.host,
            record.state.as_str(),
            record.failure_count,
            record.last_failure,
            record.last_success,
            record.opened_at,
            record.half_open_at,
        ],
    )?;
    Ok(())
}

/// Read the effective state for a host at `now_ms`.
///
/// An open circuit whose cooldown has elapsed transitions to half-open here,
/// and the transition is persisted so concurrent readers agree.
pub fn effective_state(
    conn: &Connection,
    host: &str,
    now_ms: i64,
    cooldown_ms: i64,
) -> Result<BreakerState> {
    let Some(mut record) = load(conn, host)? else {
        return Ok(BreakerState::Closed);
    };
    if record.state == BreakerState::Open {
        let opened_at = record.opened_at.unwrap_or(now_ms);
        if now_ms - opened_at >= cooldown_ms {
            record.state = BreakerState::HalfOpen;
            record.half_open_at = Some(now_ms);
            save(conn, &record)?;
            return Ok(BreakerState::HalfOpen);
        }
    }
    Ok(record.state)
}

/// Record a successful downstream response for `host`.
pub fn record_success(conn: &Connection, host: &str, now_ms: i64) -> Result<()> {
    let mut record = load(conn, host)?.unwrap_or_else(|| BreakerRecord::closed(host));
    record.state = BreakerState::Closed;
    record.failure_count = 0;
    record.last_success = Some(now_ms);
    record.opened_at = None;
    record.half_open_at = None;
    save(conn, &record)
}

/// Record a failed downstream response for `host`.
pub fn record_failure(conn: &Connection, host: &str, now_ms: i64, threshold: u32) -> Result<()> {
    let mut record = load(conn, host)?.unwrap_or_else(|| BreakerRecord::closed(host));
    record.failure_count += 1;
    record.last_failure = Some(now_ms);
    match record.state {
        BreakerState::Closed => {
            if record.failure_count >= threshold {
                record.state = BreakerState::Open;
                record.opened_at = Some(now_ms);
            }
        }
        BreakerState::HalfOpen => {
            record.state = BreakerState::Open;
            record.opened_at = Some(now_ms);
            record.half_open_at = None;
        }
        BreakerState::Open => {}
    }
    save(conn, &record)
}

/// False only when the host's effective state is open.
pub fn is_healthy(conn: &Connection, host: &str, now_ms: i64, cooldown_ms: i64) -> Result<bool> {
    Ok(effective_state(conn, host, now_ms, cooldown_ms)? != BreakerState::Open)
}

/// Remaining cooldown in whole seconds (rounded up), or 0 when not open.
pub fn retry_after_seconds(
    conn: &Connection,
    host: &str,
    now_ms: i64,
    cooldown_ms: i64,
) -> Result<u64> {
    let Some(record) = load(conn, host)? else {
        return Ok(0);
    };
    if record.state != BreakerState::Open {
        return Ok(0);
    }
    let opened_at = record.opened_at.unwrap_or(now_ms);
    let remaining_ms = cooldown_ms - (now_ms - opened_at);
    if remaining_ms <= 0 {
        return Ok(0);
    }
    Ok(((remaining_ms + 999) / 1000) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    const T0: i64 = 1_700_000_000_000;

    #[test]
    fn unknown_host_is_closed() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        assert_eq!(
            effective_state(&conn, "nowhere", T0, DEFAULT_COOLDOWN_MS).unwrap(),
            BreakerState::Closed
        );
        assert!(is_healthy(&conn, "nowhere", T0, DEFAULT_COOLDOWN_MS).unwrap());
    }

    #[test]
    fn opens_after_threshold_failures() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();

        record_failure(&conn, "h", T0, 2).unwrap();
        assert_eq!(effective_state(&conn, "h", T0, DEFAULT_COOLDOWN_MS).unwrap(), BreakerState::Closed);

        record_failure(&conn, "h", T0 + 10, 2).unwrap();
        assert_eq!(effective_state(&conn, "h", T0 + 10, DEFAULT_COOLDOWN_MS).unwrap(), BreakerState::Open);
        assert!(!is_healthy(&conn, "h", T0 + 10, DEFAULT_COOLDOWN_MS).unwrap());
    }

    #[test]
    fn success_closes_from_open() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        record_failure(&conn, "h", T0, 1).unwrap();
        assert_eq!(effective_state(&conn, "h", T0, DEFAULT_COOLDOWN_MS).unwrap(), BreakerState::Open);

        record_success(&conn, "h", T0 + 5).unwrap();
        let record = load(&conn, "h").unwrap().unwrap();
        assert_eq!(record.state, BreakerState::Closed);
        assert_eq!(record.failure_count, 0);
        assert!(record.opened_at.is_none());
    }

    #[test]
    fn cooldown_elapse_transitions_to_half_open_and_persists() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        record_failure(&conn, "h", T0, 1).unwrap();

        // Before cooldown: still open.
        let state = effective_state(&conn, "h", T0 + DEFAULT_COOLDOWN_MS - 1, DEFAULT_COOLDOWN_MS).unwrap();
        assert_eq!(state, BreakerState::Open);

        // After cooldown: half-open, persisted.
        let state = effective_state(&conn, "h", T0 + DEFAULT_COOLDOWN_MS, DEFAULT_COOLDOWN_MS).unwrap();
        assert_eq!(state, BreakerState::HalfOpen);
        let record = load(&conn, "h").unwrap().unwrap();
        assert_eq!(record.state, BreakerState::HalfOpen);
        assert_eq!(record.half_open_at, Some(T0 + DEFAULT_COOLDOWN_MS));
    }

    #[test]
    fn half_open_failure_reopens() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        record_failure(&conn, "h", T0, 1).unwrap();
        effective_state(&conn, "h", T0 + DEFAULT_COOLDOWN_MS, DEFAULT_COOLDOWN_MS).unwrap();

        let probe_at = T0 + DEFAULT_COOLDOWN_MS + 500;
        record_failure(&conn, "h", probe_at, 1).unwrap();
        let record = load(&conn, "h").unwrap().unwrap();
        assert_eq!(record.state, BreakerState::Open);
        assert_eq!(record.opened_at, Some(probe_at));
    }

    #[test]
    fn half_open_success_closes() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        record_failure(&conn, "h", T0, 1).unwrap();
        effective_state(&conn, "h", T0 + DEFAULT_COOLDOWN_MS, DEFAULT_COOLDOWN_MS).unwrap();

        record_success(&conn, "h", T0 + DEFAULT_COOLDOWN_MS + 500).unwrap();
        assert_eq!(
            effective_state(&conn, "h", T0 + DEFAULT_COOLDOWN_MS + 501, DEFAULT_COOLDOWN_MS).unwrap(),
            BreakerState::Closed
        );
    }

    #[test]
    fn retry_after_rounds_up() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        record_failure(&conn, "h", T0, 1).unwrap();

        // 119.5 seconds of cooldown remain -> 120 after rounding up.
        let secs = retry_after_seconds(&conn, "h", T0 + 500, DEFAULT_COOLDOWN_MS).unwrap();
        assert_eq!(secs, 120);

        let secs = retry_after_seconds(&conn, "h", T0 + 119_001, DEFAULT_COOLDOWN_MS).unwrap();
        assert_eq!(secs, 1);

        let secs = retry_after_seconds(&conn, "h", T0 + DEFAULT_COOLDOWN_MS, DEFAULT_COOLDOWN_MS).unwrap();
        assert_eq!(secs, 0);
    }

    #[test]
    fn breakers_are_per_host() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        record_failure(&conn, "bad", T0, 1).unwrap();
        assert!(!is_healthy(&conn, "bad", T0, DEFAULT_COOLDOWN_MS).unwrap());
        assert!(is_healthy(&conn, "good", T0, DEFAULT_COOLDOWN_MS).unwrap());
    }
}
